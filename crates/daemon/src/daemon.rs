//! # Lifecycle Orchestrator
//!
//! The root component. Owns the OS layout, watcher, trust store,
//! certificates, endpoint manager, and database facade; executes the
//! bootstrap/join/reload state machine; dispatches hooks; and
//! synchronizes shutdown.
//!
//! ## Startup States
//!
//! ```text
//! Unconfigured ──init──▶ ControlSocketOnly ──start_api──▶ NetworkListening
//!        ──▶ DatabaseReady ──on_start──▶ Ready
//! ```
//!
//! `init` brings up the control socket (and, for pre-init extension
//! servers, a network listener under the *server* certificate).
//! `start_api` — driven by the control socket, by a restart of an
//! already-configured node, or programmatically — takes the node
//! through bootstrap, join, or reload. Exactly one `start_api`
//! succeeds per process lifetime; the reload-on-restart path is the
//! same call with no join addresses.
//!
//! ## Shutdown
//!
//! One latch: the first `stop` cancels the root context, stops the
//! database (error captured), brings every endpoint down, and settles
//! the result. Concurrent and later callers all observe that same
//! result, preferring the database error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use syndic_common::{AddrPort, Extensions, HookNewMemberOptions};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, OnceCell};
use tracing::{error, info, warn};

use crate::certs::{install_crypto_provider, CertHolder, KeyPairInfo};
use crate::config;
use crate::db::{ClusterEngine, Db, EngineEnv, HeartbeatSink, Member, Role, SchemaUpdate, DATABASE_WIRE_VERSION};
use crate::endpoints::{Endpoint, EndpointKind, EndpointManager};
use crate::error::{ClientError, DaemonError, ResultExt};
use crate::hooks::{Hooks, InitConfig, NoopHooks};
use crate::layout::{OsLayout, STATE_DIR_ENV};
use crate::rest::resources::{internal_resources, public_resources, unix_resources};
use crate::rest::router::build_router;
use crate::rest::{validate_endpoints, Server};
use crate::revert::Reverter;
use crate::state::{Control, Identity, InitHook, State, StateInner};
use crate::trust::{Location, Remote, TrustStore};
use crate::watcher::FsWatcher;

/// Everything `run` needs beyond the daemon itself.
pub struct RunOptions {
    /// Port for the pre-init network listener; `start_api` later
    /// binds the configured address regardless.
    pub listen_port: Option<u16>,
    /// State directory; falls back to `SYNDIC_STATE_DIR`.
    pub state_dir: Option<PathBuf>,
    /// Group owning the control socket.
    pub socket_group: Option<String>,
    /// Ordered schema updates for the replicated database.
    pub schema: Vec<SchemaUpdate>,
    /// API extension tags, registered after the internal ones.
    pub api_extensions: Vec<String>,
    /// Embedder extension servers.
    pub extension_servers: Vec<Server>,
    /// Lifecycle hooks; missing slots are no-ops.
    pub hooks: Option<Arc<dyn Hooks>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            listen_port: None,
            state_dir: None,
            socket_group: None,
            schema: Vec::new(),
            api_extensions: Vec::new(),
            extension_servers: Vec::new(),
            hooks: None,
        }
    }
}

impl RunOptions {
    /// Options rooted at `state_dir` with everything else defaulted.
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: Some(state_dir.into()), ..Self::default() }
    }
}

/// The cluster daemon kernel.
pub struct Daemon {
    core: Arc<DaemonCore>,
}

impl Daemon {
    /// `project` names the embedding project (recorded with every
    /// member); `engine` is the replication binding the kernel drives.
    pub fn new(project: &str, engine: Arc<dyn ClusterEngine>) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (shutdown_done_tx, shutdown_done_rx) = mpsc::channel(1);

        let core = Arc::new_cyclic(|weak: &Weak<DaemonCore>| DaemonCore {
            project: project.to_string(),
            engine,
            weak_self: weak.clone(),
            identity: Arc::new(Identity::new(String::new())),
            os: OnceLock::new(),
            certs: OnceLock::new(),
            watcher: OnceLock::new(),
            trust: OnceLock::new(),
            endpoints: Arc::new(EndpointManager::new()),
            db: OnceLock::new(),
            extensions: RwLock::new(Extensions::with_internal()),
            hooks: RwLock::new(Arc::new(NoopHooks)),
            extension_servers: RwLock::new(Arc::new(Vec::new())),
            ready_tx,
            ready_rx,
            shutdown_tx,
            shutdown_rx,
            shutdown_done_tx,
            shutdown_done_rx: TokioMutex::new(Some(shutdown_done_rx)),
            stop_result: OnceCell::new(),
            api_started: AtomicBool::new(false),
            start_api_lock: TokioMutex::new(()),
        });

        Self { core }
    }

    /// Initializes the daemon, brings up its listeners, and blocks
    /// until `shutdown` resolves or an internal shutdown completes.
    /// The shutdown sequence always runs before this returns.
    pub async fn run<F>(&self, options: RunOptions, shutdown: F) -> Result<(), DaemonError>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        self.core.run(options, shutdown).await
    }

    /// The live state handle. Fails before `run` has initialized the
    /// subsystems.
    pub fn state(&self) -> Result<State, DaemonError> {
        self.core.state()
    }

    /// Transitions an unconfigured node to bootstrapped or joined.
    /// See [`State::start_api`] for the handler-side entry point.
    ///
    /// Joining requires `cluster.{crt,key}` to already exist in the
    /// state directory, handed over out-of-band (for example through a
    /// join token above this kernel); the kernel only reloads it from
    /// disk.
    pub async fn start_api(
        &self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
    ) -> Result<(), DaemonError> {
        self.core
            .start_api_direct(bootstrap, init_config, new_config, join_addresses)
            .await
    }

    /// Runs (or joins) the shutdown latch.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        self.core.stop().await
    }

    /// Waits until `on_start` has completed and the ready latch
    /// closed.
    pub async fn ready(&self) {
        let mut ready = self.core.ready_rx.clone();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn name(&self) -> String {
        self.core.identity.name()
    }

    pub fn address(&self) -> Option<AddrPort> {
        self.core.identity.address()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CORE
// ════════════════════════════════════════════════════════════════════════════

struct DaemonCore {
    project: String,
    engine: Arc<dyn ClusterEngine>,
    weak_self: Weak<DaemonCore>,

    identity: Arc<Identity>,
    os: OnceLock<Arc<OsLayout>>,
    certs: OnceLock<Arc<CertHolder>>,
    watcher: OnceLock<Arc<FsWatcher>>,
    trust: OnceLock<TrustStore>,
    endpoints: Arc<EndpointManager>,
    db: OnceLock<Arc<Db>>,

    extensions: RwLock<Extensions>,
    hooks: RwLock<Arc<dyn Hooks>>,
    extension_servers: RwLock<Arc<Vec<Server>>>,

    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    /// Root context; cancelled when shutdown starts.
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_done_tx: mpsc::Sender<Result<(), DaemonError>>,
    shutdown_done_rx: TokioMutex<Option<mpsc::Receiver<Result<(), DaemonError>>>>,
    stop_result: OnceCell<Result<(), DaemonError>>,

    api_started: AtomicBool,
    start_api_lock: TokioMutex<()>,
}

impl DaemonCore {
    async fn run<F>(&self, options: RunOptions, shutdown: F) -> Result<(), DaemonError>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        install_crypto_provider();

        let state_dir = options
            .state_dir
            .clone()
            .or_else(|| std::env::var(STATE_DIR_ENV).ok().map(PathBuf::from))
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(DaemonError::NoStateDir)?;

        let layout = OsLayout::new(state_dir, options.socket_group.as_deref())
            .context_err("Failed to initialize directory structure")?;
        self.os
            .set(Arc::new(layout))
            .map_err(|_| DaemonError::AlreadyInitialized)?;

        // Clean up daemon state on any error between here and the
        // ready latch.
        let mut reverter = Reverter::new();
        let weak = self.weak_self.clone();
        reverter.add(move || async move {
            let Some(core) = weak.upgrade() else { return };
            if let Err(err) = core.stop().await {
                error!(error = %err, "failed to cleanly stop the daemon");
            }
        });

        if let Err(err) = self.init(&options).await {
            reverter.revert().await;
            return Err(err.context("Daemon failed to start"));
        }

        // A restart of a configured node reached DatabaseReady inside
        // init; a fresh node stays in ControlSocketOnly until someone
        // drives start_api. Ready (on_start + latch) only follows the
        // database.
        if self.api_started.load(Ordering::SeqCst) {
            if let Err(err) = self.finish_ready().await {
                reverter.revert().await;
                return Err(err);
            }
        }

        reverter.disarm();
        info!(name = %self.identity.name(), "daemon initialized");

        let mut done_rx = self
            .shutdown_done_rx
            .lock()
            .await
            .take()
            .ok_or(DaemonError::AlreadyInitialized)?;

        let outcome = tokio::select! {
            _ = shutdown => Ok(()),
            result = done_rx.recv() => result.unwrap_or(Ok(())),
        };

        // The shutdown sequence always runs before returning; the
        // latch makes this a no-op when a handler already ran it.
        let stop_outcome = self.stop().await;
        outcome.and(stop_outcome)
    }

    /// `DatabaseReady → Ready`: dispatch `on_start`, then close the
    /// ready latch. Runs at most once.
    async fn finish_ready(&self) -> Result<(), DaemonError> {
        if *self.ready_rx.borrow() {
            return Ok(());
        }

        let state = self.state()?;
        if let Err(err) = state.hooks().on_start(&state).await {
            return Err(DaemonError::Hook { hook: "on-start", message: err.to_string() });
        }

        let _ = self.ready_tx.send(true);
        info!(name = %self.identity.name(), "daemon is ready");
        Ok(())
    }

    async fn init(&self, options: &RunOptions) -> Result<(), DaemonError> {
        *self.hooks.write() = options
            .hooks
            .clone()
            .unwrap_or_else(|| Arc::new(NoopHooks));
        *self.extension_servers.write() = Arc::new(options.extension_servers.clone());

        let hostname = nix::unistd::gethostname()
            .map_err(|e| DaemonError::Config(format!("Failed to assign default system name: {e}")))?;
        self.identity.set_name(hostname.to_string_lossy().to_string());

        let mut extensions = Extensions::with_internal();
        extensions
            .register(&options.api_extensions)
            .map_err(|e| DaemonError::Config(e.to_string()))?;
        *self.extensions.write() = extensions;

        let layout = self.layout()?;
        let certs = Arc::new(CertHolder::new(&layout, &self.identity.name())?);
        let _ = self.certs.set(certs);

        let watcher = Arc::new(FsWatcher::new(&[layout.trust_dir()])?);
        let trust = TrustStore::init(&watcher, layout.trust_dir())
            .context_err("Failed to initialize trust store")?;
        let _ = self.watcher.set(watcher);
        let _ = self.trust.set(trust.clone());

        let heartbeat: HeartbeatSink = {
            let weak = self.weak_self.clone();
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(core) = weak.upgrade() {
                        core.dispatch_heartbeat().await;
                    }
                })
            })
        };
        let env = EngineEnv::new(
            self.project.clone(),
            layout.database_dir(),
            trust.clone(),
            heartbeat,
            self.shutdown_rx.clone(),
        );
        let db = Arc::new(Db::new(Arc::clone(&self.engine), env));
        let _ = self.db.set(Arc::clone(&db));

        let listen_addr = options.listen_port.map(AddrPort::any);
        let servers = self.servers();
        validate_endpoints(&servers, listen_addr.as_ref())?;

        // Control socket: unix + internal + public resources, plus any
        // extension resources flagged serve_unix.
        let state = self.state()?;
        let mut groups = vec![unix_resources(), internal_resources(), public_resources()];
        for server in servers.iter().filter(|s| s.serve_unix) {
            groups.extend(server.resources.iter().cloned());
        }
        let control = Endpoint::control_socket(
            build_router(&state, &groups),
            layout.control_socket(),
            layout.socket_group_gid(),
        );
        self.endpoints.add(vec![control]).await?;

        // Pre-init listeners run under the server certificate; the
        // cluster certificate does not exist yet.
        let server_cert = self.certs()?.server();
        if let Some(addr) = &listen_addr {
            if servers.iter().any(|s| s.pre_init) {
                self.add_core_servers(true, addr, &server_cert).await?;
            }
        }
        self.add_extension_servers(true, &server_cert, listen_addr.as_ref())
            .await?;

        db.set_schema(options.schema.clone(), &self.extensions.read());

        self.reload_if_bootstrapped().await?;

        self.trust()?.refresh()?;
        Ok(())
    }

    /// Restart of an already-configured node: when both the database
    /// marker and the daemon config exist, re-enter the cluster with
    /// the known member addresses. Bootstrap and join hooks stay
    /// silent on this path.
    async fn reload_if_bootstrapped(&self) -> Result<(), DaemonError> {
        let layout = self.layout()?;
        if !layout.database_info().exists() {
            warn!("replicated database is uninitialized");
            return Ok(());
        }

        if !layout.daemon_config().exists() {
            warn!("daemon configuration is missing");
            return Ok(());
        }

        self.set_daemon_config(None)?;
        self.start_api_inner(false, InitConfig::new(), None, Vec::new(), true)
            .await
    }

    async fn start_api_direct(
        &self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
    ) -> Result<(), DaemonError> {
        self.start_api_inner(bootstrap, init_config, new_config, join_addresses, false)
            .await
    }

    /// `defer_ready` is set on the restart path, where `run` itself
    /// finishes the ready transition under the init reverter.
    fn start_api_inner<'a>(
        &'a self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
        defer_ready: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DaemonError>> + Send + 'a>> {
        Box::pin(async move {
        let _guard = self.start_api_lock.lock().await;
        if self.api_started.load(Ordering::SeqCst) {
            return Err(DaemonError::AlreadyInitialized);
        }

        if let Some(location) = new_config {
            self.set_daemon_config(Some(location))?;
        }

        if bootstrap {
            let state = self.state()?;
            state
                .dispatch_init_hook(InitHook::PreBootstrap, &init_config)
                .await?;
        }

        let name = self.identity.name();
        let address = self.identity.address().ok_or(DaemonError::Unconfigured)?;
        if name.is_empty() {
            return Err(DaemonError::Unconfigured);
        }

        let certs = self.certs()?;
        let local_remote = Remote::new(&name, address.clone(), certs.server().cert_pem())
            .context_err("Failed to build local member entry")?;

        let db = self.db()?;
        let extensions = self.extensions.read().clone();

        if bootstrap {
            let trust = self.trust()?.clone();
            trust
                .add(&local_remote)
                .context_err("Failed to initialize local remote entry")?;

            let opened = async {
                certs.ensure_cluster_on_disk(&name)?;
                self.open_network_endpoints(&address).await?;

                // Versions recorded before the engine runs; the seed
                // row describes what this node was built with, not
                // what the first migration produced.
                let version = db.schema_version()?;
                let seed = Member {
                    name: name.clone(),
                    address: address.clone(),
                    certificate: certs.server().cert_pem().to_string(),
                    heartbeat: DateTime::<Utc>::UNIX_EPOCH,
                    role: Role::Pending,
                    schema_internal: version.internal,
                    schema_external: version.external,
                };
                db.bootstrap(&extensions, &address, seed).await?;
                Ok::<(), DaemonError>(())
            }
            .await;

            // A failed bootstrap must leave no self-entry behind; the
            // next process start begins from a clean store.
            if let Err(err) = opened {
                if let Err(remove_err) = trust.remove(&name) {
                    warn!(error = %remove_err, "failed to undo local remote entry");
                }

                return Err(err);
            }

            trust.refresh()?;
            let state = self.state()?;
            state
                .dispatch_init_hook(InitHook::PostBootstrap, &init_config)
                .await?;

            self.api_started.store(true, Ordering::SeqCst);
            if !defer_ready {
                self.become_ready_or_shutdown().await?;
            }

            return Ok(());
        }

        // For a joiner (or a reload) the cluster certificate already
        // exists on disk, handed over out-of-band; a missing file is a
        // configuration error.
        self.open_network_endpoints(&address).await?;

        let joining = !join_addresses.is_empty();
        if joining {
            db.join(&extensions, &address, &join_addresses)
                .await
                .context_err("Failed to join cluster")?;
        } else {
            let members = self.trust()?.remotes().addresses();
            db.start_with_cluster(&extensions, &address, &members)
                .await
                .context_err("Failed to re-establish cluster connection")?;
        }

        self.trust()?.refresh()?;

        if joining {
            self.complete_join(&name, &local_remote, &init_config).await?;
        }

        self.api_started.store(true, Ordering::SeqCst);
        if !defer_ready {
            self.become_ready_or_shutdown().await?;
        }

        Ok(())
        })
    }

    /// Ready transition for externally-driven `start_api`. An
    /// `on_start` failure is fatal to `run` as well: the error is
    /// posted to the shutdown channel so the daemon winds down.
    async fn become_ready_or_shutdown(&self) -> Result<(), DaemonError> {
        if let Err(err) = self.finish_ready().await {
            let _ = self.shutdown_done_tx.try_send(Err(err.clone()));
            return Err(err);
        }

        Ok(())
    }

    /// Reloads the cluster certificate, re-validates extension
    /// placement against the final address, and replaces any pre-init
    /// network listeners with cluster-cert ones.
    async fn open_network_endpoints(&self, address: &AddrPort) -> Result<(), DaemonError> {
        self.reload_cluster_cert_inner()?;

        let servers = self.servers();
        validate_endpoints(&servers, Some(address))?;

        self.endpoints.down(Some(EndpointKind::Network)).await?;
        let cluster_cert = self.certs()?.cluster()?;
        self.add_core_servers(false, address, &cluster_cert).await?;
        self.add_extension_servers(false, &cluster_cert, Some(address))
            .await
    }

    /// The join sub-protocols: trust confirmation, then (after the
    /// pre-join hook) the upgrade-notification and new-member
    /// broadcasts.
    async fn complete_join(
        &self,
        name: &str,
        local_remote: &Remote,
        init_config: &InitConfig,
    ) -> Result<(), DaemonError> {
        let state = self.state()?;
        let cluster = state.cluster_clients(false)?;
        let local_info = local_remote.to_member_local();

        // At this point exactly one peer trusts us: whoever led the
        // quorum when our join was accepted. Walk peers in trust-store
        // order until one records us; it propagates the entry to the
        // rest through replication.
        let mut confirmed = false;
        let mut last_err: Option<ClientError> = None;
        for client in cluster.iter() {
            match client.add_trust_store_entry(&local_info).await {
                Ok(()) => {
                    info!(peer = %client.name(), "cluster confirmed new member");
                    confirmed = true;
                    break;
                }
                Err(err) => {
                    warn!(peer = %client.name(), error = %err, "peer declined trust confirmation");
                    last_err = Some(err);
                }
            }
        }

        if !confirmed {
            return Err(DaemonError::Confirmation {
                name: name.to_string(),
                peers: cluster.len(),
                last: last_err
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no peers available".to_string()),
            });
        }

        state
            .dispatch_init_hook(InitHook::PreJoin, init_config)
            .await?;

        // Tell the other members this system is up.
        let remotes = state.remotes();
        let joiner = name.to_string();
        cluster
            .query(true, |client| {
                let remotes = remotes.clone();
                let joiner = joiner.clone();
                Box::pin(async move {
                    // Informational: a peer that cannot be notified
                    // will discover the version at its next heartbeat.
                    if let Err(err) = client.notify_database_version(DATABASE_WIRE_VERSION).await {
                        error!(peer = %client.name(), error = %err, "failed to send database upgrade notification");
                    }

                    let Some(remote) = remotes.remote_by_address(client.address()) else {
                        return Err(DaemonError::UnknownPeer(client.address().to_string()));
                    };

                    match client
                        .run_new_member_hook(&HookNewMemberOptions { name: joiner })
                        .await
                    {
                        Ok(()) => Ok(()),
                        Err(err) if err.status() == Some(503) => {
                            info!(peer = %remote.name(), "new member hook skipped: peer still joining");
                            Ok(())
                        }
                        Err(err) => Err(err.into()),
                    }
                })
            })
            .await?;

        let state = self.state()?;
        state
            .dispatch_init_hook(InitHook::PostJoin, init_config)
            .await
    }

    /// Builds and starts the core network listener: internal + public
    /// resources (public only before init), plus every `core_api`
    /// extension server eligible at this stage.
    async fn add_core_servers(
        &self,
        pre_init: bool,
        address: &AddrPort,
        cert: &Arc<KeyPairInfo>,
    ) -> Result<(), DaemonError> {
        let state = self.state()?;
        let mut groups = if pre_init {
            vec![public_resources()]
        } else {
            vec![internal_resources(), public_resources()]
        };

        for server in self.servers().iter() {
            if !server.core_api {
                continue;
            }

            if pre_init && !server.pre_init {
                continue;
            }

            groups.extend(server.resources.iter().cloned());
        }

        let endpoint = Endpoint::network(
            "core",
            build_router(&state, &groups),
            address.clone(),
            cert,
        )?;
        Ok(self.endpoints.add(vec![endpoint]).await?)
    }

    /// Starts a listener for each extension server with its own
    /// address. Servers without an address (or matching the core
    /// address by string equality) already ride the core listener.
    async fn add_extension_servers(
        &self,
        pre_init: bool,
        fallback_cert: &Arc<KeyPairInfo>,
        core_address: Option<&AddrPort>,
    ) -> Result<(), DaemonError> {
        let state = self.state()?;
        let mut endpoints = Vec::new();

        for server in self.servers().iter() {
            if server.core_api {
                continue;
            }

            if pre_init && !server.pre_init {
                continue;
            }

            let Some(address) = &server.address else { continue };
            if server.shares_core_listener(core_address) {
                continue;
            }

            let cert = server
                .certificate
                .clone()
                .unwrap_or_else(|| Arc::clone(fallback_cert));
            endpoints.push(Endpoint::network(
                &server.name,
                build_router(&state, &server.resources),
                address.clone(),
                &cert,
            )?);
        }

        if endpoints.is_empty() {
            return Ok(());
        }

        Ok(self.endpoints.add(endpoints).await?)
    }

    /// Applies (and persists) new name/address configuration, or
    /// reloads it from `daemon.yaml` when none is given.
    fn set_daemon_config(&self, new_config: Option<Location>) -> Result<(), DaemonError> {
        let layout = self.layout()?;
        let location = match new_config {
            Some(location) => {
                config::write_location(&layout.daemon_config(), &location)?;
                location
            }
            None => config::read_location(&layout.daemon_config())?,
        };

        self.identity.configure(&location);
        Ok(())
    }

    fn reload_cluster_cert_inner(&self) -> Result<(), DaemonError> {
        let fresh = self.certs()?.reload_cluster()?;
        self.endpoints.update_tls(&fresh)?;
        Ok(())
    }

    async fn dispatch_heartbeat(&self) {
        let Ok(state) = self.state() else { return };
        if let Err(err) = state.hooks().on_heartbeat(&state).await {
            warn!(error = %err, "on_heartbeat hook failed");
        }
    }

    async fn stop(&self) -> Result<(), DaemonError> {
        self.stop_result
            .get_or_init(|| async {
                info!("daemon shutting down");
                let _ = self.shutdown_tx.send(true);

                let db_err = match self.db.get() {
                    Some(db) => db.stop().await.err(),
                    None => None,
                };
                if let Some(err) = &db_err {
                    error!(error = %err, "failed shutting down database");
                }

                let endpoint_err = self.endpoints.down(None).await.err();

                match (db_err, endpoint_err) {
                    (Some(db_err), _) => Err(DaemonError::from(db_err)),
                    (None, Some(endpoint_err)) => Err(DaemonError::from(endpoint_err)),
                    (None, None) => Ok(()),
                }
            })
            .await
            .clone()
    }

    fn state(&self) -> Result<State, DaemonError> {
        Ok(State::new(StateInner {
            os: Arc::clone(self.layout_ref()?),
            identity: Arc::clone(&self.identity),
            certs: Arc::clone(self.certs.get().ok_or(DaemonError::NotRunning)?),
            trust: self.trust()?.clone(),
            endpoints: Arc::clone(&self.endpoints),
            db: self.db()?,
            extensions: self.extensions.read().clone(),
            hooks: Arc::clone(&self.hooks.read()),
            ready: self.ready_rx.clone(),
            control: self.weak_self.clone(),
        }))
    }

    fn layout_ref(&self) -> Result<&Arc<OsLayout>, DaemonError> {
        self.os.get().ok_or(DaemonError::NotRunning)
    }

    fn layout(&self) -> Result<Arc<OsLayout>, DaemonError> {
        self.layout_ref().map(Arc::clone)
    }

    fn certs(&self) -> Result<Arc<CertHolder>, DaemonError> {
        self.certs
            .get()
            .map(Arc::clone)
            .ok_or(DaemonError::NotRunning)
    }

    fn trust(&self) -> Result<&TrustStore, DaemonError> {
        self.trust.get().ok_or(DaemonError::NotRunning)
    }

    fn db(&self) -> Result<Arc<Db>, DaemonError> {
        self.db.get().map(Arc::clone).ok_or(DaemonError::NotRunning)
    }

    fn servers(&self) -> Arc<Vec<Server>> {
        Arc::clone(&self.extension_servers.read())
    }
}

#[async_trait]
impl Control for DaemonCore {
    async fn start_api(
        &self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
    ) -> Result<(), DaemonError> {
        DaemonCore::start_api_direct(self, bootstrap, init_config, new_config, join_addresses).await
    }

    async fn stop(&self) -> Result<(), DaemonError> {
        DaemonCore::stop(self).await
    }

    fn post_shutdown(&self, result: Result<(), DaemonError>) {
        let _ = self.shutdown_done_tx.try_send(result);
    }

    async fn reload_cluster_cert(&self) -> Result<(), DaemonError> {
        self.reload_cluster_cert_inner()
    }

    async fn stop_listeners(&self) -> Result<(), DaemonError> {
        if let Some(watcher) = self.watcher.get() {
            watcher.close();
        }

        Ok(self.endpoints.down(None).await?)
    }
}
