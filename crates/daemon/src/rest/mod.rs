//! # REST Surface
//!
//! Resource groups (kernel-internal and embedder-supplied), router
//! assembly, and the kernel's own endpoint handlers.
//!
//! A [`Resources`] is a mountable group: a declared path prefix plus a
//! builder that produces an [`axum::Router`] over the daemon's
//! [`State`](crate::state::State). Builders register routes by
//! absolute path; the prefix exists for collision validation between
//! groups sharing a listener.
//!
//! A [`Server`] is an embedder extension server: one or more resource
//! groups, an optional dedicated address and certificate, and the
//! placement flags (`core_api`, `serve_unix`, `pre_init`).

pub mod resources;
pub mod router;

use std::sync::Arc;

use axum::Router;
use syndic_common::AddrPort;

use crate::certs::KeyPairInfo;
use crate::error::EndpointError;
use crate::state::State;

/// Builds a resource group's router over the daemon state.
pub type ResourceBuilder = Arc<dyn Fn(State) -> Router + Send + Sync>;

/// A mountable group of HTTP resources.
#[derive(Clone)]
pub struct Resources {
    prefix: String,
    builder: ResourceBuilder,
}

impl Resources {
    /// `prefix` is the group's path root without leading/trailing
    /// slashes, e.g. `1.0/zones`.
    pub fn new<F>(prefix: &str, builder: F) -> Self
    where
        F: Fn(State) -> Router + Send + Sync + 'static,
    {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            builder: Arc::new(builder),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn build(&self, state: State) -> Router {
        (self.builder)(state)
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources").field("prefix", &self.prefix).finish()
    }
}

/// An embedder-supplied extension server.
///
/// Placement follows the address-matching rule: a server with no
/// address (or whose address string-equals the core listen address)
/// starts with the core listener; any other address gets a dedicated
/// listener, using `certificate` or falling back to the core
/// certificate.
#[derive(Clone, Debug)]
pub struct Server {
    pub name: String,
    /// Merge these resources into the core API router instead of a
    /// separate listener.
    pub core_api: bool,
    /// Start before `start_api` configures the daemon (served under
    /// the server certificate until then).
    pub pre_init: bool,
    /// Additionally serve these resources on the unix control socket.
    pub serve_unix: bool,
    pub address: Option<AddrPort>,
    pub certificate: Option<Arc<KeyPairInfo>>,
    pub resources: Vec<Resources>,
}

impl Server {
    pub fn new(name: &str, resources: Vec<Resources>) -> Self {
        Self {
            name: name.to_string(),
            core_api: false,
            pre_init: false,
            serve_unix: false,
            address: None,
            certificate: None,
            resources,
        }
    }

    /// Whether this server shares the core listener at `core_address`.
    pub(crate) fn shares_core_listener(&self, core_address: Option<&AddrPort>) -> bool {
        match (&self.address, core_address) {
            (None, _) => true,
            (Some(addr), Some(core)) => addr.to_string() == core.to_string(),
            (Some(_), None) => false,
        }
    }
}

/// Path prefixes owned by the kernel. Extension resources must stay
/// clear of these on any shared listener.
const RESERVED_PREFIXES: &[&str] = &["1.0", "1.0/internal", "1.0/control", "1.0/daemon", "1.0/ready"];

/// Validates extension-server resource prefixes: none may shadow the
/// kernel's path tree, and no two groups sharing a listener may nest
/// within each other.
pub fn validate_endpoints(
    servers: &[Server],
    core_address: Option<&AddrPort>,
) -> Result<(), EndpointError> {
    // Group prefixes by the listener they will share. The core
    // listener also carries the kernel tree and everything flagged
    // serve_unix rides the control socket with it, so those all land
    // in one bucket.
    let mut buckets: Vec<(String, Vec<(String, String)>)> = Vec::new();

    let mut push = |listener: String, server: &Server| {
        let entries: Vec<(String, String)> = server
            .resources
            .iter()
            .map(|r| (server.name.clone(), r.prefix().to_string()))
            .collect();
        if let Some((_, existing)) = buckets.iter_mut().find(|(l, _)| *l == listener) {
            existing.extend(entries);
        } else {
            buckets.push((listener, entries));
        }
    };

    for server in servers {
        if server.name.is_empty() {
            return Err(EndpointError::Collision(
                "extension server has no name".into(),
            ));
        }

        let shared = server.shares_core_listener(core_address);
        if shared || server.serve_unix || server.core_api {
            push("core".to_string(), server);
        }

        if !shared {
            if let Some(addr) = &server.address {
                push(addr.to_string(), server);
            }
        }
    }

    for (_, entries) in &buckets {
        for (i, (name, prefix)) in entries.iter().enumerate() {
            if prefix.is_empty() {
                return Err(EndpointError::Collision(format!(
                    "server {name:?} declares an empty resource prefix"
                )));
            }

            for reserved in RESERVED_PREFIXES {
                if prefix == reserved || prefix.starts_with(&format!("{reserved}/")) {
                    // Nested under the public tree is fine; shadowing
                    // the internal tree or the kernel's own routes is
                    // not.
                    if *reserved != "1.0" || prefix == reserved {
                        return Err(EndpointError::Collision(format!(
                            "server {name:?} resource {prefix:?} shadows reserved path {reserved:?}"
                        )));
                    }
                }
            }

            for (other_name, other) in entries.iter().skip(i + 1) {
                let nested = prefix == other
                    || prefix.starts_with(&format!("{other}/"))
                    || other.starts_with(&format!("{prefix}/"));
                if nested {
                    return Err(EndpointError::Collision(format!(
                        "server {name:?} resource {prefix:?} overlaps {other:?} from server {other_name:?}"
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(prefix: &str) -> Resources {
        Resources::new(prefix, |_| Router::new())
    }

    fn server(name: &str, prefixes: &[&str]) -> Server {
        Server::new(name, prefixes.iter().map(|p| group(p)).collect())
    }

    #[test]
    fn disjoint_prefixes_pass() {
        let servers = vec![server("zones", &["1.0/zones"]), server("alerts", &["1.0/alerts"])];
        validate_endpoints(&servers, None).expect("valid");
    }

    #[test]
    fn internal_tree_is_reserved() {
        let servers = vec![server("evil", &["1.0/internal/zones"])];
        let err = validate_endpoints(&servers, None).unwrap_err();
        assert!(matches!(err, EndpointError::Collision(_)));

        let servers = vec![server("evil", &["1.0"])];
        assert!(validate_endpoints(&servers, None).is_err());

        let servers = vec![server("evil", &["1.0/control"])];
        assert!(validate_endpoints(&servers, None).is_err());
    }

    #[test]
    fn nested_prefixes_collide_on_shared_listener() {
        let servers = vec![
            server("zones", &["1.0/zones"]),
            server("subzones", &["1.0/zones/sub"]),
        ];
        assert!(validate_endpoints(&servers, None).is_err());
    }

    #[test]
    fn distinct_addresses_do_not_collide() {
        let mut a = server("zones", &["1.0/zones"]);
        a.address = Some(AddrPort::new("127.0.0.1", 9001));
        let mut b = server("subzones", &["1.0/zones/sub"]);
        b.address = Some(AddrPort::new("127.0.0.1", 9002));
        validate_endpoints(&[a, b], None).expect("valid");
    }

    #[test]
    fn address_matching_is_string_equality() {
        let core: AddrPort = "localhost:7000".parse().expect("addr");

        let mut same = server("zones", &["1.0/zones"]);
        same.address = Some("localhost:7000".parse().expect("addr"));
        assert!(same.shares_core_listener(Some(&core)));

        // The same socket by IP is a *different* listener by rule.
        let mut by_ip = server("zones", &["1.0/zones"]);
        by_ip.address = Some("127.0.0.1:7000".parse().expect("addr"));
        assert!(!by_ip.shares_core_listener(Some(&core)));

        let empty = server("zones", &["1.0/zones"]);
        assert!(empty.shares_core_listener(Some(&core)));
        assert!(empty.shares_core_listener(None));
    }
}
