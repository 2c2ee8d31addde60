//! # Replicated Database Facade
//!
//! The kernel never speaks the replication protocol itself; it drives
//! an embedder-supplied [`ClusterEngine`] (the binding to whatever
//! Raft-replicated store the project uses) through a thin facade that
//! adds the bookkeeping the lifecycle needs:
//!
//! - schema registration before any start operation,
//! - the `(internal, external, api_extensions)` version triple,
//! - the `database/info.yaml` marker whose presence means
//!   "bootstrapped or joined" on the next process start,
//! - an at-most-once `stop`, and
//! - heartbeat dispatch back into the embedder's hooks.
//!
//! ## Engine Contract
//!
//! The engine receives an [`EngineEnv`] giving it the database
//! directory, the trust store, and the heartbeat sink. Two obligations
//! come with it:
//!
//! - `join` must populate the local trust directory with the existing
//!   members it learns through replication; the kernel refreshes the
//!   store afterwards and builds its peer clients from it. The kernel
//!   never fetches certificates from peers.
//! - the engine should invoke [`EngineEnv::heartbeat`] on each
//!   heartbeat tick so the embedder's `on_heartbeat` hook runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use syndic_common::{AddrPort, Extensions};
use tracing::info;

use crate::error::DbError;
use crate::trust::TrustStore;

/// Version of the kernel's own bookkeeping schema, reported as the
/// `internal` component of the version triple.
pub const INTERNAL_SCHEMA_VERSION: u64 = 1;

/// Replication wire version announced to peers after joining.
pub const DATABASE_WIRE_VERSION: u64 = 1;

/// Raft role of a member, as surfaced by the replication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pending,
    Voter,
    Standby,
    Spare,
}

/// A member row as seeded into the replicated store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub address: AddrPort,
    pub certificate: String,
    pub heartbeat: DateTime<Utc>,
    pub role: Role,
    pub schema_internal: u64,
    pub schema_external: u64,
}

/// One named, ordered schema update supplied by the embedder.
#[derive(Debug, Clone)]
pub struct SchemaUpdate {
    name: String,
    sql: String,
}

impl SchemaUpdate {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self { name: name.into(), sql: sql.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// The `(internal, external, api_extensions)` version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaVersion {
    pub internal: u64,
    pub external: u64,
    pub api_extensions: u64,
}

/// Invoked by the facade on each heartbeat tick.
pub type HeartbeatSink = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Capabilities the kernel hands to the engine.
pub struct EngineEnv {
    project: String,
    database_dir: PathBuf,
    trust: TrustStore,
    heartbeat: HeartbeatSink,
    shutdown: tokio::sync::watch::Receiver<bool>,
}

impl EngineEnv {
    pub(crate) fn new(
        project: String,
        database_dir: PathBuf,
        trust: TrustStore,
        heartbeat: HeartbeatSink,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Self {
        Self { project, database_dir, trust, heartbeat, shutdown }
    }

    /// The embedding project's name, as recorded in the member table.
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn database_dir(&self) -> &PathBuf {
        &self.database_dir
    }

    /// The local trust store. Engines write the entries they learn
    /// through replication here.
    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    /// Reports one heartbeat tick; the kernel dispatches the
    /// embedder's `on_heartbeat` hook (failures logged, never fatal).
    pub async fn heartbeat(&self) {
        (self.heartbeat)().await;
    }

    /// The daemon's root shutdown signal. Flips to `true` when
    /// shutdown starts; long-running engine work should watch it and
    /// wind down.
    pub fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for EngineEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEnv")
            .field("project", &self.project)
            .field("database_dir", &self.database_dir)
            .finish()
    }
}

/// The embedder's binding to the replicated store.
#[async_trait]
pub trait ClusterEngine: Send + Sync {
    /// Creates a single-member quorum. `seed` arrives with
    /// `Role::Pending` and the schema versions registered at call
    /// time; the engine promotes the member once the quorum exists.
    async fn bootstrap(
        &self,
        env: &EngineEnv,
        extensions: &Extensions,
        address: &AddrPort,
        seed: Member,
    ) -> anyhow::Result<()>;

    /// Joins an existing quorum via at least one of `join_addresses`.
    /// On success the local trust directory must contain the existing
    /// members (including this node).
    async fn join(
        &self,
        env: &EngineEnv,
        extensions: &Extensions,
        address: &AddrPort,
        join_addresses: &[String],
    ) -> anyhow::Result<()>;

    /// Rejoins a quorum this node already belongs to, using the known
    /// member addresses.
    async fn start_with_cluster(
        &self,
        env: &EngineEnv,
        extensions: &Extensions,
        address: &AddrPort,
        members: &[AddrPort],
    ) -> anyhow::Result<()>;

    /// Flushes and terminates replication.
    async fn stop(&self) -> anyhow::Result<()>;
}

// ════════════════════════════════════════════════════════════════════════════
// FACADE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct DatabaseInfo {
    address: AddrPort,
}

struct Schema {
    updates: Vec<SchemaUpdate>,
    api_extensions: u64,
}

/// The kernel's handle on the replicated database.
pub struct Db {
    engine: Arc<dyn ClusterEngine>,
    env: EngineEnv,
    schema: RwLock<Option<Schema>>,
    open: AtomicBool,
    stopped: AtomicBool,
}

impl Db {
    pub(crate) fn new(engine: Arc<dyn ClusterEngine>, env: EngineEnv) -> Self {
        Self {
            engine,
            env,
            schema: RwLock::new(None),
            open: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Registers the ordered schema-update list. Must run before any
    /// start operation.
    pub fn set_schema(&self, updates: Vec<SchemaUpdate>, extensions: &Extensions) {
        *self.schema.write() = Some(Schema {
            updates,
            api_extensions: extensions.version(),
        });
    }

    /// The version triple derived from the registered schema.
    pub fn schema_version(&self) -> Result<SchemaVersion, DbError> {
        let guard = self.schema.read();
        let schema = guard.as_ref().ok_or(DbError::SchemaNotSet)?;
        Ok(SchemaVersion {
            internal: INTERNAL_SCHEMA_VERSION,
            external: schema.updates.len() as u64,
            api_extensions: schema.api_extensions,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn bootstrap(
        &self,
        extensions: &Extensions,
        address: &AddrPort,
        seed: Member,
    ) -> Result<(), DbError> {
        self.pre_start()?;
        self.engine
            .bootstrap(&self.env, extensions, address, seed)
            .await
            .map_err(|e| DbError::Engine(e.to_string()))?;
        self.mark_open(address)
    }

    pub async fn join(
        &self,
        extensions: &Extensions,
        address: &AddrPort,
        join_addresses: &[String],
    ) -> Result<(), DbError> {
        self.pre_start()?;
        self.engine
            .join(&self.env, extensions, address, join_addresses)
            .await
            .map_err(|e| DbError::Engine(e.to_string()))?;
        self.mark_open(address)
    }

    pub async fn start_with_cluster(
        &self,
        extensions: &Extensions,
        address: &AddrPort,
        members: &[AddrPort],
    ) -> Result<(), DbError> {
        self.pre_start()?;
        self.engine
            .start_with_cluster(&self.env, extensions, address, members)
            .await
            .map_err(|e| DbError::Engine(e.to_string()))?;
        self.mark_open(address)
    }

    /// Stops the engine. The first call wins; later (or concurrent)
    /// calls are no-ops, so the engine's `stop` runs at most once.
    pub async fn stop(&self) -> Result<(), DbError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if !self.is_open() {
            return Ok(());
        }

        self.open.store(false, Ordering::SeqCst);
        self.engine
            .stop()
            .await
            .map_err(|e| DbError::Engine(e.to_string()))
    }

    /// Forwards a heartbeat tick into the kernel's hook dispatch.
    pub async fn dispatch_heartbeat(&self) {
        self.env.heartbeat().await;
    }

    fn pre_start(&self) -> Result<(), DbError> {
        if self.schema.read().is_none() {
            return Err(DbError::SchemaNotSet);
        }

        if self.open.load(Ordering::SeqCst) {
            return Err(DbError::AlreadyOpen);
        }

        Ok(())
    }

    fn mark_open(&self, address: &AddrPort) -> Result<(), DbError> {
        let info_path = self.env.database_dir.join(crate::layout::DATABASE_INFO_FILE);
        let info = DatabaseInfo { address: address.clone() };
        let yaml = serde_yaml::to_string(&info).map_err(|e| DbError::Marker(e.to_string()))?;
        std::fs::write(&info_path, yaml).map_err(|e| DbError::Marker(e.to_string()))?;

        self.open.store(true, Ordering::SeqCst);
        info!(address = %address, "database started");
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Engine that records call counts and succeeds.
    #[derive(Default)]
    struct CountingEngine {
        bootstraps: AtomicUsize,
        stops: AtomicUsize,
        seed_versions: parking_lot::Mutex<Option<(u64, u64)>>,
    }

    #[async_trait]
    impl ClusterEngine for CountingEngine {
        async fn bootstrap(
            &self,
            _env: &EngineEnv,
            _extensions: &Extensions,
            _address: &AddrPort,
            seed: Member,
        ) -> anyhow::Result<()> {
            assert_eq!(seed.role, Role::Pending);
            *self.seed_versions.lock() = Some((seed.schema_internal, seed.schema_external));
            self.bootstraps.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn join(
            &self,
            _env: &EngineEnv,
            _extensions: &Extensions,
            _address: &AddrPort,
            _join_addresses: &[String],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn start_with_cluster(
            &self,
            _env: &EngineEnv,
            _extensions: &Extensions,
            _address: &AddrPort,
            _members: &[AddrPort],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_db(tmp: &TempDir, engine: Arc<CountingEngine>) -> Db {
        let trust_dir = tmp.path().join("truststore");
        std::fs::create_dir_all(&trust_dir).expect("trust dir");
        let trust = TrustStore::open(trust_dir).expect("store");
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let env = EngineEnv::new(
            "testproj".into(),
            tmp.path().to_path_buf(),
            trust,
            Arc::new(|| Box::pin(async {})),
            shutdown_rx,
        );
        Db::new(engine, env)
    }

    fn seed(db: &Db) -> Member {
        let version = db.schema_version().expect("version");
        Member {
            name: "alpha".into(),
            address: AddrPort::new("127.0.0.1", 7000),
            certificate: String::new(),
            heartbeat: DateTime::<Utc>::UNIX_EPOCH,
            role: Role::Pending,
            schema_internal: version.internal,
            schema_external: version.external,
        }
    }

    #[test]
    fn version_triple_counts_updates_and_extensions() {
        let tmp = TempDir::new().expect("tempdir");
        let db = make_db(&tmp, Arc::new(CountingEngine::default()));

        assert!(matches!(db.schema_version(), Err(DbError::SchemaNotSet)));

        let mut extensions = Extensions::new();
        extensions.register(["zones", "alerts"]).expect("register");
        db.set_schema(
            vec![
                SchemaUpdate::new("create_zones", "CREATE TABLE zones (name TEXT)"),
                SchemaUpdate::new("add_owner", "ALTER TABLE zones ADD owner TEXT"),
                SchemaUpdate::new("create_alerts", "CREATE TABLE alerts (id INT)"),
            ],
            &extensions,
        );

        let version = db.schema_version().expect("version");
        assert_eq!(version.internal, INTERNAL_SCHEMA_VERSION);
        assert_eq!(version.external, 3);
        assert_eq!(version.api_extensions, 2);
    }

    #[tokio::test]
    async fn bootstrap_requires_schema() {
        let tmp = TempDir::new().expect("tempdir");
        let db = make_db(&tmp, Arc::new(CountingEngine::default()));

        let member = Member {
            name: "alpha".into(),
            address: AddrPort::new("127.0.0.1", 7000),
            certificate: String::new(),
            heartbeat: DateTime::<Utc>::UNIX_EPOCH,
            role: Role::Pending,
            schema_internal: 0,
            schema_external: 0,
        };
        let err = db
            .bootstrap(&Extensions::new(), &AddrPort::new("127.0.0.1", 7000), member)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::SchemaNotSet));
    }

    #[tokio::test]
    async fn bootstrap_writes_marker_and_opens() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(CountingEngine::default());
        let db = make_db(&tmp, Arc::clone(&engine));
        db.set_schema(vec![], &Extensions::new());

        let member = seed(&db);
        db.bootstrap(&Extensions::new(), &AddrPort::new("127.0.0.1", 7000), member)
            .await
            .expect("bootstrap");

        assert!(db.is_open());
        assert!(tmp.path().join("info.yaml").exists());
        assert_eq!(engine.bootstraps.load(Ordering::SeqCst), 1);

        // A second start is rejected.
        let member = seed(&db);
        let err = db
            .bootstrap(&Extensions::new(), &AddrPort::new("127.0.0.1", 7000), member)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::AlreadyOpen));
    }

    /// The seed row carries the versions registered at call time (the
    /// update counts), not anything the engine's first migration might
    /// produce.
    #[tokio::test]
    async fn seed_versions_recorded_before_engine_runs() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(CountingEngine::default());
        let db = make_db(&tmp, Arc::clone(&engine));

        let mut extensions = Extensions::new();
        extensions.register(["zones"]).expect("register");
        db.set_schema(
            vec![
                SchemaUpdate::new("create_zones", "CREATE TABLE zones (name TEXT)"),
                SchemaUpdate::new("add_owner", "ALTER TABLE zones ADD owner TEXT"),
            ],
            &extensions,
        );

        let member = seed(&db);
        db.bootstrap(&extensions, &AddrPort::new("127.0.0.1", 7000), member)
            .await
            .expect("bootstrap");

        assert_eq!(
            *engine.seed_versions.lock(),
            Some((INTERNAL_SCHEMA_VERSION, 2))
        );
    }

    #[tokio::test]
    async fn stop_runs_engine_at_most_once() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(CountingEngine::default());
        let db = make_db(&tmp, Arc::clone(&engine));
        db.set_schema(vec![], &Extensions::new());

        let member = seed(&db);
        db.bootstrap(&Extensions::new(), &AddrPort::new("127.0.0.1", 7000), member)
            .await
            .expect("bootstrap");

        db.stop().await.expect("first stop");
        db.stop().await.expect("second stop");
        assert_eq!(engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_open_skips_engine() {
        let tmp = TempDir::new().expect("tempdir");
        let engine = Arc::new(CountingEngine::default());
        let db = make_db(&tmp, Arc::clone(&engine));

        db.stop().await.expect("stop");
        assert_eq!(engine.stops.load(Ordering::SeqCst), 0);
    }
}
