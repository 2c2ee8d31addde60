//! # Syndic Daemon Kernel
//!
//! A library-shaped runtime that turns an ordinary single-node service
//! into a member of a symmetric, Raft-replicated cluster. The embedder
//! supplies a replicated-table schema, the HTTP resource groups it
//! wants mounted, lifecycle hooks, and a [`ClusterEngine`] binding to
//! its replication layer; the kernel supplies bootstrap, join,
//! membership trust, certificate rotation, multi-listener serving, and
//! graceful shutdown.
//!
//! ## Composition
//!
//! ```text
//! ┌──────────────────────── Daemon ────────────────────────┐
//! │                                                        │
//! │  OsLayout        state directory, socket paths         │
//! │  FsWatcher  ◀──  trust directory changes               │
//! │  TrustStore      who is a member (name/address/cert)   │
//! │  CertHolder      server cert + hot-swapped cluster cert│
//! │  Endpoints       control socket + TLS listeners        │
//! │  Db facade       drives the embedder's ClusterEngine   │
//! │  Hooks           embedder callbacks at each transition │
//! │                                                        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! These four subsystems are mutually dependent: the database will not
//! start without trusted peers, peers will not trust a joiner before
//! the accepting leader records it, listeners cannot bind TLS before
//! the cluster certificate exists, and hooks run at points where any
//! of them may be half-initialized. The [`Daemon`] orders every
//! transition so each dependency is satisfied before it is needed.
//!
//! ## Minimal Embedding
//!
//! ```no_run
//! use std::sync::Arc;
//! use syndic_daemon::{Daemon, RunOptions, SchemaUpdate};
//!
//! # async fn example(engine: Arc<dyn syndic_daemon::ClusterEngine>) -> Result<(), syndic_daemon::DaemonError> {
//! let daemon = Daemon::new("myproject", engine);
//! let options = RunOptions {
//!     listen_port: Some(7000),
//!     state_dir: Some("/var/lib/myproject".into()),
//!     schema: vec![SchemaUpdate::new(
//!         "create_widgets",
//!         "CREATE TABLE widgets (name TEXT PRIMARY KEY)",
//!     )],
//!     ..RunOptions::default()
//! };
//! daemon.run(options, std::future::pending()).await
//! # }
//! ```

pub mod certs;
pub mod client;
mod config;
pub mod daemon;
pub mod db;
pub mod endpoints;
pub mod error;
pub mod hooks;
pub mod layout;
pub mod rest;
mod revert;
pub mod state;
pub mod trust;
pub mod watcher;

pub use daemon::{Daemon, RunOptions};
pub use db::{ClusterEngine, Db, EngineEnv, Member, Role, SchemaUpdate, SchemaVersion};
pub use error::{
    CertError, ClientError, DaemonError, DbError, EndpointError, LayoutError, TrustError,
    WatchError,
};
pub use hooks::{Hooks, InitConfig, NoopHooks};
pub use layout::{OsLayout, STATE_DIR_ENV};
pub use rest::{Resources, Server};
pub use state::{Control, State};
pub use trust::{Location, Remote, Remotes, TrustStore};
