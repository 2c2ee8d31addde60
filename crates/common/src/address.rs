//! # Listen Addresses
//!
//! Provides [`AddrPort`], the canonical `host:port` value used for
//! member listen addresses, join targets, and extension-server binds.
//!
//! ## Why Not `SocketAddr`
//!
//! Join addresses may carry hostnames (`alpha:7000`) that are only
//! resolvable on the joiner's network, and the kernel compares listen
//! addresses by **string equality on `host:port`**, not by resolved IP.
//! An extension server bound to `localhost:7000` is therefore distinct
//! from one bound to `127.0.0.1:7000`, matching the address-matching
//! rule for core-listener sharing.
//!
//! ## Canonical Form
//!
//! - An empty host canonicalizes to `0.0.0.0` (listen on all
//!   interfaces), so `:7000` and `0.0.0.0:7000` compare equal.
//! - IPv6 hosts keep their brackets: `[::1]:7000`.
//! - The port is mandatory.
//!
//! Serialized as a plain string in both JSON and YAML.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error type for address parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The value has no `:port` suffix.
    #[error("address {0:?} has no port")]
    MissingPort(String),
    /// The port suffix is not a valid u16.
    #[error("address {0:?} has an invalid port")]
    InvalidPort(String),
    /// An IPv6 host is missing its closing bracket.
    #[error("address {0:?} has an unterminated IPv6 host")]
    UnterminatedV6(String),
}

/// A `host:port` listen address.
///
/// Equality and hashing operate on the canonical string form, which is
/// what every address comparison in the kernel relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddrPort {
    host: String,
    port: u16,
}

impl AddrPort {
    /// Builds an address from already-split parts. An empty host is
    /// canonicalized to `0.0.0.0`.
    pub fn new(host: &str, port: u16) -> Self {
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Self { host: host.to_string(), port }
    }

    /// An all-interfaces address for the given port.
    pub fn any(port: u16) -> Self {
        Self::new("", port)
    }

    /// The host part, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `true` when the host is a wildcard (`0.0.0.0` or `::`).
    pub fn is_wildcard_host(&self) -> bool {
        self.host == "0.0.0.0" || self.host == "::"
    }
}

impl fmt::Display for AddrPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for AddrPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Bracketed IPv6: [host]:port
        if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| AddressError::UnterminatedV6(s.to_string()))?;
            let host = &rest[..end];
            let tail = &rest[end + 1..];
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
            return Ok(Self::new(host, port));
        }

        // Bare IPv6 without a port would contain multiple colons; treat
        // the final colon as the host/port split in every other case.
        let idx = s
            .rfind(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        let (host, port) = s.split_at(idx);
        let port: u16 = port[1..]
            .parse()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        if host.contains(':') {
            // More than one colon outside brackets: an IPv6 host with
            // no port would land here.
            return Err(AddressError::MissingPort(s.to_string()));
        }

        Ok(Self::new(host, port))
    }
}

impl Serialize for AddrPort {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AddrPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port() {
        let a: AddrPort = "alpha:7000".parse().expect("parse");
        assert_eq!(a.host(), "alpha");
        assert_eq!(a.port(), 7000);
        assert_eq!(a.to_string(), "alpha:7000");
    }

    /// `:7000` and `0.0.0.0:7000` are the same listen address.
    #[test]
    fn empty_host_canonicalizes_to_wildcard() {
        let a: AddrPort = ":7000".parse().expect("parse");
        let b: AddrPort = "0.0.0.0:7000".parse().expect("parse");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "0.0.0.0:7000");
        assert!(a.is_wildcard_host());
    }

    #[test]
    fn parse_ipv6_bracketed() {
        let a: AddrPort = "[::1]:9443".parse().expect("parse");
        assert_eq!(a.host(), "::1");
        assert_eq!(a.port(), 9443);
        assert_eq!(a.to_string(), "[::1]:9443");
    }

    #[test]
    fn reject_missing_port() {
        assert!(matches!(
            "alpha".parse::<AddrPort>(),
            Err(AddressError::MissingPort(_))
        ));
        assert!(matches!(
            "::1".parse::<AddrPort>(),
            Err(AddressError::MissingPort(_))
        ));
    }

    #[test]
    fn reject_bad_port() {
        assert!(matches!(
            "alpha:port".parse::<AddrPort>(),
            Err(AddressError::InvalidPort(_))
        ));
        assert!(matches!(
            "alpha:99999".parse::<AddrPort>(),
            Err(AddressError::InvalidPort(_))
        ));
    }

    /// Hostname and resolved IP are distinct addresses: the kernel
    /// compares strings, never resolutions.
    #[test]
    fn string_equality_not_ip_equality() {
        let a: AddrPort = "localhost:7000".parse().expect("parse");
        let b: AddrPort = "127.0.0.1:7000".parse().expect("parse");
        assert_ne!(a, b);
    }

    #[test]
    fn serde_round_trip_as_string() {
        let a: AddrPort = "10.0.0.5:7443".parse().expect("parse");
        let json = serde_json::to_string(&a).expect("serialize");
        assert_eq!(json, "\"10.0.0.5:7443\"");
        let back: AddrPort = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(a, back);
    }

    #[test]
    fn yaml_round_trip() {
        let a: AddrPort = "0.0.0.0:7000".parse().expect("parse");
        let yaml = serde_yaml::to_string(&a).expect("serialize");
        let back: AddrPort = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(a, back);
    }
}
