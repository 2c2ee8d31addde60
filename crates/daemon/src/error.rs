//! # Error Taxonomy
//!
//! One error enum per subsystem, rolled up into [`DaemonError`] by the
//! orchestrator with a human-readable `Failed to …` wrapper where the
//! call site adds context.
//!
//! Every variant carries owned, cloneable data (I/O errors are
//! stringified at the boundary). This matters for one consumer: the
//! shutdown latch, where every concurrent caller must observe the same
//! error value.

use std::path::PathBuf;

/// OS layout errors: state directory resolution and creation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayoutError {
    #[error("state directory {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
    #[error("unknown socket group {0:?}")]
    UnknownGroup(String),
    #[error("{context}: {message}")]
    Io { context: String, message: String },
}

impl LayoutError {
    pub(crate) fn io(context: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io { context: context.into(), message: err.to_string() }
    }
}

/// Filesystem watcher errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    #[error("failed to initialize directory watch: {0}")]
    Init(String),
    #[error("failed to watch {path:?}: {message}")]
    AddWatch { path: PathBuf, message: String },
}

/// Certificate loading, generation, and TLS assembly errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CertError {
    #[error("certificate {0:?} not found")]
    Missing(PathBuf),
    #[error("cluster certificate is not loaded")]
    ClusterNotLoaded,
    #[error("failed to read {path:?}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("invalid PEM material in {path:?}: {message}")]
    Pem { path: PathBuf, message: String },
    #[error("failed to parse certificate: {0}")]
    Parse(String),
    #[error("failed to generate keypair: {0}")]
    Generate(String),
    #[error("failed to build TLS configuration: {0}")]
    Tls(String),
}

/// Trust store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrustError {
    #[error("invalid remote name {0:?}")]
    InvalidName(String),
    #[error("remote {0:?} already exists in the trust store")]
    Duplicate(String),
    #[error("no remote named {0:?} in the trust store")]
    Unknown(String),
    #[error("trust store I/O on {path:?}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("invalid trust entry {path:?}: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error(transparent)]
    Cert(#[from] CertError),
}

/// Endpoint manager errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to bind {name:?} on {target}: {message}")]
    Bind { name: String, target: String, message: String },
    #[error("failed to prepare control socket {path:?}: {message}")]
    Socket { path: PathBuf, message: String },
    #[error("endpoint {0:?} is already running")]
    AlreadyRunning(String),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error("resource path collision: {0}")]
    Collision(String),
}

/// Database facade errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    #[error("no schema has been registered")]
    SchemaNotSet,
    #[error("database is already open")]
    AlreadyOpen,
    #[error("database error: {0}")]
    Engine(String),
    #[error("failed to record database marker: {0}")]
    Marker(String),
}

/// Peer RPC errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build peer client for {address}: {message}")]
    Build { address: String, message: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{url} returned {status}: {message}")]
    Status { url: String, status: u16, message: String },
}

impl ClientError {
    /// The HTTP status of a rejected request, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Top-level daemon errors, as surfaced from `run`, `start_api`, and
/// the shutdown latch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DaemonError {
    #[error("State directory must be specified")]
    NoStateDir,
    #[error("Daemon is not running")]
    NotRunning,
    #[error("Daemon is already initialized")]
    AlreadyInitialized,
    #[error("Cannot start network API without valid daemon configuration")]
    Unconfigured,
    #[error("{0}")]
    Config(String),
    #[error("Failed to run {hook} hook: {message}")]
    Hook { hook: &'static str, message: String },
    #[error("Failed to confirm new member {name:?} on any existing system ({peers}): {last}")]
    Confirmation { name: String, peers: usize, last: String },
    #[error("No remote found at address {0:?}")]
    UnknownPeer(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DaemonError>,
    },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Cert(#[from] CertError),
    #[error(transparent)]
    Trust(#[from] TrustError),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl DaemonError {
    /// Wraps an error with `Failed to …`-style context.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context { context: context.into(), source: Box::new(self) }
    }
}

/// Extension trait mirroring the `fmt.Errorf("Failed to X: %w", err)`
/// propagation style: every fallible step names what it was doing.
pub trait ResultExt<T> {
    fn context_err(self, context: impl Into<String>) -> Result<T, DaemonError>;
}

impl<T, E: Into<DaemonError>> ResultExt<T> for Result<T, E> {
    fn context_err(self, context: impl Into<String>) -> Result<T, DaemonError> {
        self.map_err(|e| e.into().context(context))
    }
}
