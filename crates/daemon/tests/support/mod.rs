//! Shared harness for the lifecycle and cluster scenarios.
//!
//! The daemons under test run in-process. Their replication layer is
//! simulated by [`TestNet`]: a shared registry standing in for the
//! replicated member table. Joining through it has the same observable
//! effects a real engine binding produces — the accepting leader's
//! trust directory gains the joiner, and the joiner's trust directory
//! gains every existing member — while everything above (mTLS peer
//! RPCs, trust confirmation, broadcasts, hooks) is the real kernel.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use syndic_common::{AddrPort, ClusterMemberLocal, Extensions};
use syndic_daemon::db::{EngineEnv, Member};
use syndic_daemon::{
    ClusterEngine, Daemon, DaemonError, Hooks, Location, Remote, RunOptions, State, TrustStore,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};

pub const WAIT: Duration = Duration::from_secs(10);

// ════════════════════════════════════════════════════════════════════════════
// SIMULATED REPLICATION NETWORK
// ════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct TestNet {
    members: Mutex<Vec<(ClusterMemberLocal, TrustStore)>>,
}

impl TestNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    fn register_bootstrap(&self, member: ClusterMemberLocal, store: TrustStore) {
        self.members.lock().push((member, store));
    }

    /// A join accepted by the cluster: the leader (the first member)
    /// records the joiner, and the joiner's store receives the full
    /// member list. Other members learn of the joiner later, through
    /// the kernel's trust-confirmation protocol.
    fn register_join(
        &self,
        member: ClusterMemberLocal,
        store: TrustStore,
        join_addresses: &[String],
    ) -> anyhow::Result<()> {
        let mut members = self.members.lock();
        if members.is_empty() {
            anyhow::bail!("no cluster to join");
        }

        let known = members
            .iter()
            .any(|(m, _)| join_addresses.iter().any(|a| *a == m.address.to_string()));
        if !known {
            anyhow::bail!("none of the join addresses belong to this cluster");
        }

        let (_, leader_store) = &members[0];
        leader_store.add(&Remote::try_from(&member)?)?;

        for (existing, _) in members.iter() {
            store.add(&Remote::try_from(existing)?)?;
        }
        store.add(&Remote::try_from(&member)?)?;

        members.push((member, store));
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TEST ENGINE
// ════════════════════════════════════════════════════════════════════════════

pub struct TestEngine {
    net: Arc<TestNet>,
    pub bootstraps: AtomicUsize,
    pub joins: AtomicUsize,
    pub reloads: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_bootstrap: AtomicBool,
}

impl TestEngine {
    pub fn new(net: Arc<TestNet>) -> Arc<Self> {
        Arc::new(Self {
            net,
            bootstraps: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_bootstrap: AtomicBool::new(false),
        })
    }

    /// The joiner's own identity, read back from the state directory
    /// the way a real engine binding reads its node configuration.
    fn local_member(env: &EngineEnv, address: &AddrPort) -> anyhow::Result<ClusterMemberLocal> {
        let state_dir = env
            .database_dir()
            .parent()
            .ok_or_else(|| anyhow::anyhow!("database dir has no parent"))?
            .to_path_buf();

        let config = std::fs::read_to_string(state_dir.join("daemon.yaml"))?;
        let location: Location = serde_yaml::from_str(&config)?;
        let certificate = std::fs::read_to_string(state_dir.join("server.crt"))?;

        Ok(ClusterMemberLocal {
            name: location.name,
            address: address.clone(),
            certificate,
        })
    }
}

#[async_trait]
impl ClusterEngine for TestEngine {
    async fn bootstrap(
        &self,
        env: &EngineEnv,
        _extensions: &Extensions,
        _address: &AddrPort,
        seed: Member,
    ) -> anyhow::Result<()> {
        if self.fail_bootstrap.load(Ordering::SeqCst) {
            anyhow::bail!("quorum could not be established");
        }

        self.bootstraps.fetch_add(1, Ordering::SeqCst);

        // One synthetic heartbeat tick, as replication would produce.
        env.heartbeat().await;

        self.net.register_bootstrap(
            ClusterMemberLocal {
                name: seed.name,
                address: seed.address,
                certificate: seed.certificate,
            },
            env.trust().clone(),
        );
        Ok(())
    }

    async fn join(
        &self,
        env: &EngineEnv,
        _extensions: &Extensions,
        address: &AddrPort,
        join_addresses: &[String],
    ) -> anyhow::Result<()> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let member = Self::local_member(env, address)?;
        self.net
            .register_join(member, env.trust().clone(), join_addresses)
    }

    async fn start_with_cluster(
        &self,
        _env: &EngineEnv,
        _extensions: &Extensions,
        _address: &AddrPort,
        members: &[AddrPort],
    ) -> anyhow::Result<()> {
        if members.is_empty() {
            anyhow::bail!("no known members to reconnect to");
        }

        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HOOKS
// ════════════════════════════════════════════════════════════════════════════

/// Records every hook invocation in order.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// The init/start hook sequence, with noise (heartbeats) dropped.
    pub fn lifecycle_events(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e != "on-heartbeat")
            .collect()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn pre_bootstrap(
        &self,
        _state: &State,
        _init_config: &syndic_daemon::InitConfig,
    ) -> anyhow::Result<()> {
        self.record("pre-bootstrap");
        Ok(())
    }

    async fn post_bootstrap(
        &self,
        _state: &State,
        _init_config: &syndic_daemon::InitConfig,
    ) -> anyhow::Result<()> {
        self.record("post-bootstrap");
        Ok(())
    }

    async fn pre_join(
        &self,
        _state: &State,
        _init_config: &syndic_daemon::InitConfig,
    ) -> anyhow::Result<()> {
        self.record("pre-join");
        Ok(())
    }

    async fn post_join(
        &self,
        _state: &State,
        _init_config: &syndic_daemon::InitConfig,
    ) -> anyhow::Result<()> {
        self.record("post-join");
        Ok(())
    }

    async fn on_start(&self, _state: &State) -> anyhow::Result<()> {
        self.record("on-start");
        Ok(())
    }

    async fn on_heartbeat(&self, _state: &State) -> anyhow::Result<()> {
        self.record("on-heartbeat");
        Ok(())
    }

    async fn on_new_member(&self, _state: &State, member: &str) -> anyhow::Result<()> {
        self.record(format!("on-new-member:{member}"));
        Ok(())
    }
}

/// Hooks whose `on_start` blocks until released, pinning the daemon in
/// the not-yet-ready window.
pub struct GatedStartHooks {
    gate: watch::Receiver<bool>,
}

impl GatedStartHooks {
    pub fn new() -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Arc::new(Self { gate: rx }), tx)
    }
}

#[async_trait]
impl Hooks for GatedStartHooks {
    async fn on_start(&self, _state: &State) -> anyhow::Result<()> {
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DAEMON PLUMBING
// ════════════════════════════════════════════════════════════════════════════

pub struct RunningDaemon {
    pub daemon: Arc<Daemon>,
    pub state_dir: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<Result<(), DaemonError>>,
}

impl RunningDaemon {
    /// Spawns `daemon.run` and waits for the control socket to come
    /// up.
    pub async fn spawn(daemon: Arc<Daemon>, options: RunOptions) -> Self {
        init_tracing();

        let state_dir = options
            .state_dir
            .clone()
            .expect("test daemons always set a state dir");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let run_daemon = Arc::clone(&daemon);
        let handle = tokio::spawn(async move {
            run_daemon
                .run(options, async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let socket = state_dir.join("control.socket");
        wait_until(|| socket.exists()).await;

        Self { daemon, state_dir, shutdown: Some(shutdown_tx), handle }
    }

    pub fn control_socket(&self) -> PathBuf {
        self.state_dir.join("control.socket")
    }

    /// Signals external shutdown and returns `run`'s result.
    pub async fn shut_down(mut self) -> Result<(), DaemonError> {
        if let Some(trigger) = self.shutdown.take() {
            let _ = trigger.send(());
        }

        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("daemon did not shut down in time")
            .expect("daemon task panicked")
    }

    /// Awaits `run`'s result without triggering shutdown (for tests
    /// where a handler or error ends the daemon).
    pub async fn join_run(self) -> Result<(), DaemonError> {
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("daemon did not end in time")
            .expect("daemon task panicked")
    }
}

/// Installs a test-writer tracing subscriber once; `RUST_LOG` narrows
/// it.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A free loopback port. Racy by nature, fine for tests.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr").port()
}

pub fn loopback(port: u16) -> AddrPort {
    AddrPort::new("127.0.0.1", port)
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let check = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(WAIT, check)
        .await
        .expect("condition not reached in time");
}

/// Simulates the out-of-band cluster certificate handover a join
/// token mechanism would perform.
pub fn hand_over_cluster_cert(from_state_dir: &Path, to_state_dir: &Path) {
    for file in ["cluster.crt", "cluster.key"] {
        std::fs::copy(from_state_dir.join(file), to_state_dir.join(file))
            .expect("cluster cert handover");
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RAW HTTP OVER THE CONTROL SOCKET
// ════════════════════════════════════════════════════════════════════════════

/// Sends one HTTP/1.1 request over the unix control socket and
/// returns `(status, body)`.
pub async fn unix_request(
    socket: &Path,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = tokio::net::UnixStream::connect(socket)
        .await
        .expect("connect control socket");

    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(request.as_bytes()).await.expect("write request");

    let mut raw = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut raw))
        .await
        .expect("response timeout")
        .expect("read response");

    parse_http_response(&raw)
}

pub fn parse_http_response(raw: &str) -> (u16, String) {
    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}
