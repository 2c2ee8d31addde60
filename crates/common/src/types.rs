//! Request and response payloads for the kernel's own endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::AddrPort;
use crate::extensions::Extensions;

/// Header carrying the sender's replication wire version on the
/// database upgrade notification (`PATCH /1.0/internal/database`).
pub const DATABASE_VERSION_HEADER: &str = "X-Dqlite-Version";

/// A cluster member as recorded in (and exchanged between) trust
/// stores: logical name, listen address, and PEM server certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMemberLocal {
    pub name: String,
    pub address: AddrPort,
    pub certificate: String,
}

/// Body of `POST /1.0/internal/hooks/newmember`: asks a peer to run its
/// `on_new_member` hook for the named joiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookNewMemberOptions {
    pub name: String,
}

/// Body of `POST /1.0/control` on the unix socket: transitions an
/// unconfigured daemon into a bootstrapped or joining member.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlPost {
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub init_config: HashMap<String, String>,
    /// New daemon name; required on first configuration.
    #[serde(default)]
    pub name: Option<String>,
    /// New listen address; required on first configuration.
    #[serde(default)]
    pub address: Option<AddrPort>,
    #[serde(default)]
    pub join_addresses: Vec<String>,
}

/// Metadata of `GET /1.0`: the daemon's public status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    #[serde(default)]
    pub address: Option<AddrPort>,
    pub ready: bool,
    pub extensions: Extensions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_post_defaults() {
        let body: ControlPost = serde_json::from_str("{}").expect("parse");
        assert!(!body.bootstrap);
        assert!(body.init_config.is_empty());
        assert!(body.join_addresses.is_empty());
        assert!(body.name.is_none());
    }

    #[test]
    fn member_local_round_trip() {
        let member = ClusterMemberLocal {
            name: "alpha".into(),
            address: "10.0.0.1:7000".parse().expect("addr"),
            certificate: "-----BEGIN CERTIFICATE-----\n...".into(),
        };
        let json = serde_json::to_string(&member).expect("serialize");
        let back: ClusterMemberLocal = serde_json::from_str(&json).expect("parse");
        assert_eq!(member, back);
    }
}
