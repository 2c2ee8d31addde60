//! # Endpoint Manager
//!
//! An ordered set of live listeners, each bound to its own router:
//! exactly one unix control socket plus zero or more TLS network
//! sockets. Listeners come and go independently — `start_api` drops
//! the pre-init network listener and adds the cluster-cert ones
//! without touching the control socket, and an extension server on its
//! own address outlives a core listener brought down.
//!
//! ## TLS Hot Swap
//!
//! Each network endpoint keeps its `TlsAcceptor` behind an `RwLock`.
//! The accept loop clones the acceptor per connection, so
//! [`EndpointManager::update_tls`] affects only connections accepted
//! after the swap; requests in flight complete on the certificate they
//! were accepted with, and no listener is dropped.
//!
//! ## Serving
//!
//! Connections are served one hyper connection task each, driving the
//! endpoint's axum router. The router sees the raw request path
//! (percent-encoding intact) and a [`ConnectionInfo`] request
//! extension carrying the transport kind and, for TLS connections, the
//! fingerprint of the presented client certificate.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::{Mutex, RwLock};
use syndic_common::AddrPort;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::util::ServiceExt;
use tracing::{debug, info, warn};

use crate::certs::{fingerprint_hex, KeyPairInfo};
use crate::error::EndpointError;

/// Listener kinds; `down` can target one kind selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ControlSocket,
    Network,
}

/// Per-connection transport facts, inserted into every request's
/// extensions. Handlers gate internal endpoints on this.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub kind: EndpointKind,
    /// SHA-256 fingerprint of the client certificate, when one was
    /// presented over TLS.
    pub peer_fingerprint: Option<String>,
}

impl ConnectionInfo {
    pub fn unix() -> Self {
        Self { kind: EndpointKind::ControlSocket, peer_fingerprint: None }
    }
}

enum Target {
    Unix { path: PathBuf, group_gid: Option<u32> },
    Network { addr: AddrPort, tls: Arc<RwLock<TlsAcceptor>> },
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
    local_addr: Option<SocketAddr>,
}

/// One listener plus its router.
pub struct Endpoint {
    name: String,
    kind: EndpointKind,
    router: Router,
    target: Target,
    running: Mutex<Option<Running>>,
}

impl Endpoint {
    /// The unix control socket endpoint. The socket file is created at
    /// bind time with mode 0660, owned by `group_gid` when given.
    pub fn control_socket(router: Router, path: PathBuf, group_gid: Option<u32>) -> Self {
        Self {
            name: "control".to_string(),
            kind: EndpointKind::ControlSocket,
            router,
            target: Target::Unix { path, group_gid },
            running: Mutex::new(None),
        }
    }

    /// A TLS network endpoint presenting `cert`.
    pub fn network(
        name: &str,
        router: Router,
        addr: AddrPort,
        cert: &KeyPairInfo,
    ) -> Result<Self, EndpointError> {
        let config = Arc::new(cert.server_config()?);
        Ok(Self {
            name: name.to_string(),
            kind: EndpointKind::Network,
            router,
            target: Target::Network {
                addr,
                tls: Arc::new(RwLock::new(TlsAcceptor::from(config))),
            },
            running: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// The bound socket address of a running network endpoint. Useful
    /// when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().and_then(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    async fn start(&self) -> Result<(), EndpointError> {
        if self.is_running() {
            return Err(EndpointError::AlreadyRunning(self.name.clone()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = match &self.target {
            Target::Unix { path, group_gid } => {
                let listener = bind_unix(path, *group_gid)?;
                info!(socket = %path.display(), "control socket listening");
                let handle = tokio::spawn(serve_unix_loop(
                    listener,
                    self.router.clone(),
                    shutdown_rx,
                ));
                Running { shutdown: shutdown_tx, handle, local_addr: None }
            }
            Target::Network { addr, tls } => {
                let listener = bind_network(&self.name, addr)?;
                let local_addr = listener.local_addr().ok();
                info!(name = %self.name, address = %addr, "network endpoint listening");
                let handle = tokio::spawn(serve_tls_loop(
                    listener,
                    self.router.clone(),
                    Arc::clone(tls),
                    shutdown_rx,
                ));
                Running { shutdown: shutdown_tx, handle, local_addr }
            }
        };

        *self.running.lock() = Some(running);
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else { return };
        let _ = running.shutdown.send(true);
        let _ = running.handle.await;

        if let Target::Unix { path, .. } = &self.target {
            let _ = std::fs::remove_file(path);
        }

        info!(name = %self.name, "endpoint stopped");
    }

    fn swap_tls(&self, config: Arc<rustls::ServerConfig>) {
        if let Target::Network { tls, .. } = &self.target {
            *tls.write() = TlsAcceptor::from(config);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MANAGER
// ════════════════════════════════════════════════════════════════════════════

/// Owns the endpoint set. Add/remove/swap are serialized; accepted
/// connections are not.
#[derive(Default)]
pub struct EndpointManager {
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

impl EndpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends endpoints and starts them. If one fails to bind, the
    /// ones started by this call are stopped again before the error
    /// surfaces.
    pub async fn add(&self, endpoints: Vec<Endpoint>) -> Result<(), EndpointError> {
        let mut started: Vec<Arc<Endpoint>> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let endpoint = Arc::new(endpoint);
            if let Err(err) = endpoint.start().await {
                for ep in &started {
                    ep.stop().await;
                }

                return Err(err);
            }

            started.push(endpoint);
        }

        self.endpoints.lock().extend(started);
        Ok(())
    }

    /// Starts every endpoint that is not yet running.
    pub async fn up(&self) -> Result<(), EndpointError> {
        let pending: Vec<Arc<Endpoint>> = self
            .endpoints
            .lock()
            .iter()
            .filter(|e| !e.is_running())
            .cloned()
            .collect();

        for endpoint in pending {
            endpoint.start().await?;
        }

        Ok(())
    }

    /// Stops and removes all endpoints, or only those of one kind.
    pub async fn down(&self, kind: Option<EndpointKind>) -> Result<(), EndpointError> {
        let victims: Vec<Arc<Endpoint>> = {
            let mut endpoints = self.endpoints.lock();
            let (matching, rest) = endpoints
                .drain(..)
                .partition(|e| kind.is_none() || Some(e.kind()) == kind);
            *endpoints = rest;
            matching
        };

        for endpoint in victims {
            endpoint.stop().await;
        }

        Ok(())
    }

    /// Stops and removes the endpoints with the given name (the core
    /// listener and each extension server carry distinct names), so
    /// one listener can be cycled without touching the others.
    pub async fn down_named(&self, name: &str) -> Result<(), EndpointError> {
        let victims: Vec<Arc<Endpoint>> = {
            let mut endpoints = self.endpoints.lock();
            let (matching, rest) = endpoints.drain(..).partition(|e| e.name() == name);
            *endpoints = rest;
            matching
        };

        for endpoint in victims {
            endpoint.stop().await;
        }

        Ok(())
    }

    /// Swaps the TLS configuration on every network endpoint. New
    /// connections use `cert`; connections already accepted keep the
    /// old one.
    pub fn update_tls(&self, cert: &KeyPairInfo) -> Result<(), EndpointError> {
        let config = Arc::new(cert.server_config()?);
        for endpoint in self.endpoints.lock().iter() {
            endpoint.swap_tls(Arc::clone(&config));
        }

        Ok(())
    }

    /// Bound addresses of running network endpoints, in set order.
    pub fn network_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints
            .lock()
            .iter()
            .filter(|e| e.kind() == EndpointKind::Network)
            .filter_map(|e| e.local_addr())
            .collect()
    }

    pub fn count(&self, kind: EndpointKind) -> usize {
        self.endpoints
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// BINDING
// ════════════════════════════════════════════════════════════════════════════

fn bind_unix(path: &PathBuf, group_gid: Option<u32>) -> Result<UnixListener, EndpointError> {
    let socket_err = |message: String| EndpointError::Socket {
        path: path.clone(),
        message,
    };

    // A stale socket from an unclean exit would fail the bind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(socket_err(e.to_string())),
    }

    let listener = UnixListener::bind(path).map_err(|e| socket_err(e.to_string()))?;

    if let Some(gid) = group_gid {
        nix::unistd::chown(path.as_path(), None, Some(nix::unistd::Gid::from_raw(gid)))
            .map_err(|e| socket_err(e.to_string()))?;
    }

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))
        .map_err(|e| socket_err(e.to_string()))?;

    Ok(listener)
}

/// Binds with `SO_REUSEADDR` so a restart does not trip over sockets
/// in TIME_WAIT.
fn bind_network(name: &str, addr: &AddrPort) -> Result<TcpListener, EndpointError> {
    let bind_err = |message: String| EndpointError::Bind {
        name: name.to_string(),
        target: addr.to_string(),
        message,
    };

    let sock_addr: SocketAddr = addr
        .to_string()
        .to_socket_addrs()
        .map_err(|e| bind_err(e.to_string()))?
        .next()
        .ok_or_else(|| bind_err("address resolved to nothing".into()))?;

    let domain = if sock_addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(|e| bind_err(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| bind_err(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| bind_err(e.to_string()))?;
    socket
        .bind(&sock_addr.into())
        .map_err(|e| bind_err(e.to_string()))?;
    socket.listen(1024).map_err(|e| bind_err(e.to_string()))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| bind_err(e.to_string()))
}

// ════════════════════════════════════════════════════════════════════════════
// SERVE LOOPS
// ════════════════════════════════════════════════════════════════════════════

async fn serve_unix_loop(
    listener: UnixListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let router = router.clone();
                    tokio::spawn(serve_connection(stream, router, ConnectionInfo::unix()));
                }
                Err(err) => {
                    warn!(error = %err, "control socket accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_tls_loop(
    listener: TcpListener,
    router: Router,
    tls: Arc<RwLock<TlsAcceptor>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    // Snapshot the acceptor so a concurrent TLS swap
                    // does not affect this connection.
                    let acceptor = tls.read().clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let fingerprint = tls_stream
                                    .get_ref()
                                    .1
                                    .peer_certificates()
                                    .and_then(|certs| certs.first())
                                    .map(|cert| fingerprint_hex(cert.as_ref()));
                                let info = ConnectionInfo {
                                    kind: EndpointKind::Network,
                                    peer_fingerprint: fingerprint,
                                };
                                serve_connection(tls_stream, router, info).await;
                            }
                            Err(err) => {
                                debug!(peer = %peer_addr, error = %err, "TLS handshake failed");
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "network accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_connection<S>(stream: S, router: Router, info: ConnectionInfo)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = hyper::service::service_fn(move |mut request: hyper::Request<hyper::body::Incoming>| {
        request.extensions_mut().insert(info.clone());
        let router = router.clone();
        async move { router.oneshot(request.map(axum::body::Body::new)).await }
    });

    let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await;
    if let Err(err) = result {
        debug!(error = %err, "connection closed with error");
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::install_crypto_provider;
    use axum::routing::get;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_router() -> Router {
        Router::new().route("/ping", get(|| async { "pong" }))
    }

    fn make_cert(dir: &std::path::Path) -> KeyPairInfo {
        KeyPairInfo::generate(
            "test",
            &["test".into(), "127.0.0.1".into()],
            &dir.join("test.crt"),
            &dir.join("test.key"),
        )
        .expect("generate")
    }

    #[tokio::test]
    async fn control_socket_serves_http() {
        let tmp = TempDir::new().expect("tempdir");
        let socket_path = tmp.path().join("control.socket");

        let manager = EndpointManager::new();
        manager
            .add(vec![Endpoint::control_socket(
                test_router(),
                socket_path.clone(),
                None,
            )])
            .await
            .expect("add");

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&socket_path)
            .expect("socket meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o660);

        let mut stream = tokio::net::UnixStream::connect(&socket_path)
            .await
            .expect("connect");
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));

        manager.down(None).await.expect("down");
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn network_endpoint_binds_ephemeral_port() {
        install_crypto_provider();
        let tmp = TempDir::new().expect("tempdir");
        let cert = make_cert(tmp.path());

        let manager = EndpointManager::new();
        manager
            .add(vec![Endpoint::network(
                "core",
                test_router(),
                AddrPort::new("127.0.0.1", 0),
                &cert,
            )
            .expect("endpoint")])
            .await
            .expect("add");

        let addrs = manager.network_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);

        manager.down(Some(EndpointKind::Network)).await.expect("down");
        assert!(manager.network_addrs().is_empty());
    }

    #[tokio::test]
    async fn down_by_kind_keeps_other_endpoints() {
        install_crypto_provider();
        let tmp = TempDir::new().expect("tempdir");
        let cert = make_cert(tmp.path());
        let socket_path = tmp.path().join("control.socket");

        let manager = EndpointManager::new();
        manager
            .add(vec![Endpoint::control_socket(
                test_router(),
                socket_path.clone(),
                None,
            )])
            .await
            .expect("add control");
        manager
            .add(vec![Endpoint::network(
                "core",
                test_router(),
                AddrPort::new("127.0.0.1", 0),
                &cert,
            )
            .expect("endpoint")])
            .await
            .expect("add network");

        manager.down(Some(EndpointKind::Network)).await.expect("down");

        assert_eq!(manager.count(EndpointKind::ControlSocket), 1);
        assert_eq!(manager.count(EndpointKind::Network), 0);
        assert!(socket_path.exists());

        manager.down(None).await.expect("down all");
    }

    #[tokio::test]
    async fn update_tls_swaps_without_dropping_listener() {
        install_crypto_provider();
        let tmp = TempDir::new().expect("tempdir");
        let cert = make_cert(tmp.path());

        let manager = EndpointManager::new();
        manager
            .add(vec![Endpoint::network(
                "core",
                test_router(),
                AddrPort::new("127.0.0.1", 0),
                &cert,
            )
            .expect("endpoint")])
            .await
            .expect("add");

        let before = manager.network_addrs();
        let rotated = KeyPairInfo::generate(
            "rotated",
            &["rotated".into()],
            &tmp.path().join("rotated.crt"),
            &tmp.path().join("rotated.key"),
        )
        .expect("generate");
        manager.update_tls(&rotated).expect("swap");

        assert_eq!(manager.network_addrs(), before);
        manager.down(None).await.expect("down");
    }
}
