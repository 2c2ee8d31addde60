//! # Syndic Common Types
//!
//! Shared types that cross the wire (or the state directory) between
//! cluster members and between the daemon kernel and its embedder:
//!
//! - [`AddrPort`] — canonical `host:port` listen address.
//! - [`Envelope`] — the JSON response envelope every endpoint speaks.
//! - [`Extensions`] — the ordered API-extension registry.
//! - Request/response payloads for the internal cluster endpoints
//!   ([`ClusterMemberLocal`], [`HookNewMemberOptions`], [`ControlPost`],
//!   [`ServerStatus`]).
//!
//! Everything here is plain data: no I/O, no locking, no async. The
//! daemon crate owns all behavior.

pub mod address;
pub mod envelope;
pub mod extensions;
pub mod types;

pub use address::{AddrPort, AddressError};
pub use envelope::{Envelope, ResponseKind};
pub use extensions::{ExtensionError, Extensions};
pub use types::{
    ClusterMemberLocal, ControlPost, HookNewMemberOptions, ServerStatus,
    DATABASE_VERSION_HEADER,
};

/// The API version prefix served by every syndic daemon.
pub const API_VERSION: &str = "1.0";

/// All supported API version paths, as reported on `GET /`.
pub const API_VERSIONS: &[&str] = &["/1.0"];
