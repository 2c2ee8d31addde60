//! # API Extension Registry
//!
//! Extensions are opaque capability tags the embedder registers once at
//! startup. The replicated database records them per member, and
//! handlers use them to gate features across mixed-version clusters.
//!
//! ## Ordering
//!
//! The registry is an **ordered** list: internal kernel extensions
//! first, then embedder extensions in exactly the order provided. The
//! extension count doubles as the API-extension version reported next
//! to the schema versions.
//!
//! ## Naming Rules
//!
//! Embedder tags must be non-empty, lowercase `a-z0-9_`, and unique.
//! The `internal:` prefix is reserved for kernel tags.

use serde::{Deserialize, Serialize};

/// Kernel-owned extensions, always registered before any embedder tag.
pub const INTERNAL_EXTENSIONS: &[&str] = &["internal:member_handover_v1"];

/// Reserved prefix for kernel extensions.
const INTERNAL_PREFIX: &str = "internal:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtensionError {
    #[error("extension name is empty")]
    Empty,
    #[error("extension {0:?} uses the reserved {INTERNAL_PREFIX:?} prefix")]
    ReservedPrefix(String),
    #[error("extension {0:?} contains invalid characters (want lowercase a-z0-9_)")]
    InvalidName(String),
    #[error("extension {0:?} is already registered")]
    Duplicate(String),
}

/// Ordered set of extension tags supported by this daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(Vec<String>);

impl Extensions {
    /// An empty registry, without the internal extensions. Only useful
    /// in tests; daemons start from [`Extensions::with_internal`].
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A registry pre-populated with the kernel's internal extensions.
    pub fn with_internal() -> Self {
        Self(INTERNAL_EXTENSIONS.iter().map(|s| s.to_string()).collect())
    }

    /// Registers embedder extensions, preserving their order.
    ///
    /// Each tag is validated and appended; on error the registry is
    /// left unchanged.
    pub fn register<I, S>(&mut self, tags: I) -> Result<(), ExtensionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pending: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.as_ref();
            Self::validate(tag)?;
            if self.has(tag) || pending.iter().any(|p| p == tag) {
                return Err(ExtensionError::Duplicate(tag.to_string()));
            }

            pending.push(tag.to_string());
        }

        self.0.extend(pending);
        Ok(())
    }

    fn validate(tag: &str) -> Result<(), ExtensionError> {
        if tag.is_empty() {
            return Err(ExtensionError::Empty);
        }

        if tag.starts_with(INTERNAL_PREFIX) {
            return Err(ExtensionError::ReservedPrefix(tag.to_string()));
        }

        if !tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ExtensionError::InvalidName(tag.to_string()));
        }

        Ok(())
    }

    pub fn has(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// The API-extension version: the number of registered tags.
    pub fn version(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
