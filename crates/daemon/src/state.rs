//! # State Handle
//!
//! The view of the daemon handed to request handlers and hooks. Its
//! fields are **accessors, not snapshots**: `remotes()` re-reads the
//! trust store, `cluster_cert()` returns the certificate current at
//! call time, and so on. A handler holding a `State` across a
//! certificate rotation observes the rotated certificate.
//!
//! Operations that re-enter the orchestrator (`start_api`, `stop`,
//! `reload_cluster_cert`, `stop_listeners`) go through the [`Control`]
//! trait, implemented by the daemon and held here as a weak reference;
//! the handle never owns the daemon, and the hook set is threaded
//! through by value rather than parked in process-wide slots.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use syndic_common::{AddrPort, Extensions};
use tokio::sync::watch;
use tracing::warn;

use crate::certs::{CertHolder, KeyPairInfo};
use crate::client::Cluster;
use crate::db::Db;
use crate::endpoints::EndpointManager;
use crate::error::DaemonError;
use crate::hooks::{Hooks, InitConfig};
use crate::layout::OsLayout;
use crate::trust::{Location, Remotes, TrustStore};

/// The node's configured name and listen address. The name defaults
/// to the hostname and both freeze after the first successful
/// configuration.
pub struct Identity {
    name: RwLock<String>,
    address: RwLock<Option<AddrPort>>,
}

impl Identity {
    pub(crate) fn new(default_name: String) -> Self {
        Self { name: RwLock::new(default_name), address: RwLock::new(None) }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn address(&self) -> Option<AddrPort> {
        self.address.read().clone()
    }

    /// Sets the default (hostname-derived) name before configuration.
    pub(crate) fn set_name(&self, name: String) {
        *self.name.write() = name;
    }

    pub(crate) fn configure(&self, location: &Location) {
        *self.name.write() = location.name.clone();
        *self.address.write() = Some(location.address.clone());
    }
}

/// Orchestrator operations reachable from handlers and hooks.
#[async_trait]
pub trait Control: Send + Sync {
    async fn start_api(
        &self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
    ) -> Result<(), DaemonError>;

    async fn stop(&self) -> Result<(), DaemonError>;

    /// Hands the shutdown result to the run loop; `run` returns with
    /// it. Used by the graceful-stop handler after responding.
    fn post_shutdown(&self, result: Result<(), DaemonError>);

    async fn reload_cluster_cert(&self) -> Result<(), DaemonError>;

    /// Closes the filesystem watcher and brings every endpoint down.
    async fn stop_listeners(&self) -> Result<(), DaemonError>;
}

pub(crate) struct StateInner {
    pub os: Arc<OsLayout>,
    pub identity: Arc<Identity>,
    pub certs: Arc<CertHolder>,
    pub trust: TrustStore,
    pub endpoints: Arc<EndpointManager>,
    pub db: Arc<Db>,
    pub extensions: Extensions,
    pub hooks: Arc<dyn Hooks>,
    pub ready: watch::Receiver<bool>,
    pub control: Weak<dyn Control>,
}

/// Live view of the daemon. Cheap to clone.
#[derive(Clone)]
pub struct State {
    inner: Arc<StateInner>,
}

impl State {
    pub(crate) fn new(inner: StateInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    pub fn name(&self) -> String {
        self.inner.identity.name()
    }

    pub fn address(&self) -> Option<AddrPort> {
        self.inner.identity.address()
    }

    pub fn os(&self) -> &OsLayout {
        &self.inner.os
    }

    pub fn server_cert(&self) -> Arc<KeyPairInfo> {
        self.inner.certs.server()
    }

    pub fn cluster_cert(&self) -> Result<Arc<KeyPairInfo>, DaemonError> {
        Ok(self.inner.certs.cluster()?)
    }

    pub fn trust(&self) -> &TrustStore {
        &self.inner.trust
    }

    pub fn remotes(&self) -> Remotes {
        self.inner.trust.remotes()
    }

    pub fn endpoints(&self) -> &EndpointManager {
        &self.inner.endpoints
    }

    pub fn database(&self) -> &Db {
        &self.inner.db
    }

    pub fn extensions(&self) -> &Extensions {
        &self.inner.extensions
    }

    pub(crate) fn hooks(&self) -> Arc<dyn Hooks> {
        Arc::clone(&self.inner.hooks)
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Waits until `on_start` has completed and the daemon is serving.
    pub async fn ready(&self) {
        let mut ready = self.inner.ready.clone();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Builds the mTLS client set for the current remotes, excluding
    /// this node unless `include_self`.
    pub fn cluster_clients(&self, include_self: bool) -> Result<Cluster, DaemonError> {
        let cluster_cert = self.inner.certs.cluster()?;
        let local = self.address();
        let exclude = if include_self { None } else { local.as_ref() };
        Ok(Cluster::from_remotes(
            &self.remotes(),
            exclude,
            &self.server_cert(),
            &cluster_cert,
        )?)
    }

    fn control(&self) -> Result<Arc<dyn Control>, DaemonError> {
        self.inner.control.upgrade().ok_or(DaemonError::NotRunning)
    }

    pub fn start_api<'a>(
        &'a self,
        bootstrap: bool,
        init_config: InitConfig,
        new_config: Option<Location>,
        join_addresses: Vec<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DaemonError>> + Send + 'a>> {
        Box::pin(async move {
            self.control()?
                .start_api(bootstrap, init_config, new_config, join_addresses)
                .await
        })
    }

    pub async fn stop(&self) -> Result<(), DaemonError> {
        self.control()?.stop().await
    }

    pub fn post_shutdown(&self, result: Result<(), DaemonError>) {
        match self.control() {
            Ok(control) => control.post_shutdown(result),
            Err(err) => warn!(error = %err, "cannot post shutdown result"),
        }
    }

    pub async fn reload_cluster_cert(&self) -> Result<(), DaemonError> {
        self.control()?.reload_cluster_cert().await
    }

    pub async fn stop_listeners(&self) -> Result<(), DaemonError> {
        self.control()?.stop_listeners().await
    }

    // Hook dispatch helpers. Fatality is the caller's decision; these
    // only add the hook name to the error.

    pub(crate) fn dispatch_init_hook<'a>(
        &'a self,
        hook: InitHook,
        init_config: &'a InitConfig,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), DaemonError>> + Send + 'a>> {
        Box::pin(async move {
            let hooks = self.hooks();
            let result = match hook {
                InitHook::PreBootstrap => hooks.pre_bootstrap(self, init_config).await,
                InitHook::PostBootstrap => hooks.post_bootstrap(self, init_config).await,
                InitHook::PreJoin => hooks.pre_join(self, init_config).await,
                InitHook::PostJoin => hooks.post_join(self, init_config).await,
            };
            result.map_err(|e| DaemonError::Hook { hook: hook.name(), message: e.to_string() })
        })
    }

    pub(crate) async fn dispatch_remove_hook(
        &self,
        pre: bool,
        force: bool,
    ) -> Result<(), DaemonError> {
        let hooks = self.hooks();
        let (name, result) = if pre {
            ("pre-remove", hooks.pre_remove(self, force).await)
        } else {
            ("post-remove", hooks.post_remove(self, force).await)
        };
        result.map_err(|e| DaemonError::Hook { hook: name, message: e.to_string() })
    }

    pub(crate) async fn dispatch_new_member(&self, member: &str) {
        if let Err(err) = self.hooks().on_new_member(self, member).await {
            warn!(member, error = %err, "on_new_member hook failed");
        }
    }
}

/// The four init-config hook slots, for shared dispatch plumbing.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InitHook {
    PreBootstrap,
    PostBootstrap,
    PreJoin,
    PostJoin,
}

impl InitHook {
    fn name(self) -> &'static str {
        match self {
            Self::PreBootstrap => "pre-bootstrap",
            Self::PostBootstrap => "post-bootstrap",
            Self::PreJoin => "pre-join",
            Self::PostJoin => "post-join",
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name())
            .field("address", &self.address())
            .field("ready", &self.is_ready())
            .finish()
    }
}

// The handle is shared into every router and hook.
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<State>();
    }
    let _ = check;
};
