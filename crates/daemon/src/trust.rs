//! # Trust Store
//!
//! The authoritative local view of cluster membership. Each remote is
//! two files in the trust directory:
//!
//! ```text
//! truststore/
//! ├── alpha.crt    # PEM server certificate of the remote
//! └── alpha.yaml   # {name: alpha, address: 10.0.0.1:7000}
//! ```
//!
//! The in-memory map is a name-sorted snapshot of that directory,
//! rebuilt by [`TrustStore::refresh`] — called at startup, after every
//! database start operation, and whenever the filesystem watcher sees
//! a `.crt`/`.yaml` change (the replication layer delivers peers'
//! entries by writing files, not by calling us).
//!
//! ## Invariants
//!
//! - `(name, address)` is unique across the store.
//! - The local node appears exactly once iff bootstrap succeeded.
//! - Writes are atomic: temp file, fsync, rename, then memory update.
//!   A crash mid-add leaves either no entry or a complete one.
//! - Re-adding an identical entry is a no-op, so the leader (whose
//!   replication layer already recorded a joiner) accepts that
//!   joiner's confirmation request idempotently.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use syndic_common::{AddrPort, ClusterMemberLocal};
use tracing::{info, warn};

use crate::certs::{fingerprint_hex, leaf_der_from_pem};
use crate::error::TrustError;
use crate::watcher::FsWatcher;

/// A member's logical name and listen address — the sidecar YAML
/// payload, also reused as the persisted daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub address: AddrPort,
}

/// A recorded cluster peer.
#[derive(Debug, Clone)]
pub struct Remote {
    pub location: Location,
    cert_pem: String,
    fingerprint: String,
}

impl Remote {
    /// Validates the certificate PEM and computes its fingerprint.
    pub fn new(name: &str, address: AddrPort, cert_pem: &str) -> Result<Self, TrustError> {
        validate_name(name)?;
        let der = leaf_der_from_pem(cert_pem)?;
        Ok(Self {
            location: Location { name: name.to_string(), address },
            cert_pem: cert_pem.to_string(),
            fingerprint: fingerprint_hex(&der),
        })
    }

    pub fn name(&self) -> &str {
        &self.location.name
    }

    pub fn address(&self) -> &AddrPort {
        &self.location.address
    }

    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The wire form exchanged during trust confirmation.
    pub fn to_member_local(&self) -> ClusterMemberLocal {
        ClusterMemberLocal {
            name: self.location.name.clone(),
            address: self.location.address.clone(),
            certificate: self.cert_pem.clone(),
        }
    }
}

impl TryFrom<&ClusterMemberLocal> for Remote {
    type Error = TrustError;

    fn try_from(member: &ClusterMemberLocal) -> Result<Self, TrustError> {
        Remote::new(&member.name, member.address.clone(), &member.certificate)
    }
}

fn validate_name(name: &str) -> Result<(), TrustError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(TrustError::InvalidName(name.to_string()));
    }

    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ════════════════════════════════════════════════════════════════════════════

/// An immutable, name-sorted snapshot of the store.
#[derive(Debug, Clone)]
pub struct Remotes(Vec<Remote>);

impl Remotes {
    pub fn iter(&self) -> impl Iterator<Item = &Remote> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.0.iter().find(|r| r.name() == name)
    }

    pub fn remote_by_address(&self, address: &AddrPort) -> Option<&Remote> {
        self.0.iter().find(|r| r.address() == address)
    }

    pub fn addresses(&self) -> Vec<AddrPort> {
        self.0.iter().map(|r| r.address().clone()).collect()
    }

    /// Whether a presented client certificate belongs to a member.
    pub fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        self.0.iter().any(|r| r.fingerprint() == fingerprint)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORE
// ════════════════════════════════════════════════════════════════════════════

struct StoreInner {
    dir: PathBuf,
    remotes: RwLock<BTreeMap<String, Remote>>,
}

/// Directory-backed trust store. Cheap to clone; all clones share the
/// same state.
#[derive(Clone)]
pub struct TrustStore {
    inner: Arc<StoreInner>,
}

impl TrustStore {
    /// Loads the store from `dir` and subscribes to the watcher so
    /// external file changes trigger a refresh.
    pub fn init(watcher: &FsWatcher, dir: PathBuf) -> Result<Self, TrustError> {
        let store = Self {
            inner: Arc::new(StoreInner { dir, remotes: RwLock::new(BTreeMap::new()) }),
        };
        store.refresh()?;

        let weak: Weak<StoreInner> = Arc::downgrade(&store.inner);
        for suffix in [".crt", ".yaml"] {
            let weak = weak.clone();
            watcher.watch_suffix(
                suffix,
                Arc::new(move |path, _event| {
                    let Some(inner) = weak.upgrade() else { return };
                    if path.parent() != Some(inner.dir.as_path()) {
                        return;
                    }

                    let store = TrustStore { inner };
                    if let Err(err) = store.refresh() {
                        warn!(error = %err, "trust store refresh failed");
                    }
                }),
            );
        }

        Ok(store)
    }

    /// A store without watcher wiring. Used by unit tests.
    #[cfg(test)]
    pub(crate) fn open(dir: PathBuf) -> Result<Self, TrustError> {
        let store = Self {
            inner: Arc::new(StoreInner { dir, remotes: RwLock::new(BTreeMap::new()) }),
        };
        store.refresh()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Rescans the trust directory and rebuilds the in-memory list.
    /// Incomplete entries (a sidecar without its certificate, or the
    /// reverse) are skipped with a warning: they are either mid-write
    /// or damaged, and the next refresh will see the final state.
    pub fn refresh(&self) -> Result<(), TrustError> {
        let dir = &self.inner.dir;
        let entries = fs::read_dir(dir)
            .map_err(|e| TrustError::Io { path: dir.clone(), message: e.to_string() })?;

        let mut fresh = BTreeMap::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| TrustError::Io { path: dir.clone(), message: e.to_string() })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }

            match load_remote(&path) {
                Ok(remote) => {
                    fresh.insert(remote.name().to_string(), remote);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping trust entry");
                }
            }
        }

        *self.inner.remotes.write() = fresh;
        Ok(())
    }

    pub fn remotes(&self) -> Remotes {
        Remotes(self.inner.remotes.read().values().cloned().collect())
    }

    /// Writes the remote's certificate and sidecar atomically, then
    /// updates memory. Re-adding an identical entry succeeds without
    /// touching disk; a name collision with different data is an
    /// error.
    pub fn add(&self, remote: &Remote) -> Result<(), TrustError> {
        validate_name(remote.name())?;

        {
            let remotes = self.inner.remotes.read();
            if let Some(existing) = remotes.get(remote.name()) {
                let identical = existing.address() == remote.address()
                    && existing.fingerprint() == remote.fingerprint();
                if identical {
                    return Ok(());
                }

                return Err(TrustError::Duplicate(remote.name().to_string()));
            }

            if remotes.values().any(|r| r.address() == remote.address()) {
                return Err(TrustError::Duplicate(remote.address().to_string()));
            }
        }

        let cert_path = self.inner.dir.join(format!("{}.crt", remote.name()));
        let yaml_path = self.inner.dir.join(format!("{}.yaml", remote.name()));

        let sidecar = serde_yaml::to_string(&remote.location).map_err(|e| {
            TrustError::Invalid { path: yaml_path.clone(), message: e.to_string() }
        })?;

        write_atomic(&cert_path, remote.certificate_pem().as_bytes())?;
        write_atomic(&yaml_path, sidecar.as_bytes())?;

        info!(name = remote.name(), address = %remote.address(), "trust store entry added");
        self.inner
            .remotes
            .write()
            .insert(remote.name().to_string(), remote.clone());
        Ok(())
    }

    /// Removes the remote's files (sidecar first, so a partial remove
    /// never looks like a valid entry), then updates memory.
    pub fn remove(&self, name: &str) -> Result<(), TrustError> {
        validate_name(name)?;
        if self.inner.remotes.read().get(name).is_none() {
            return Err(TrustError::Unknown(name.to_string()));
        }

        for file in [format!("{name}.yaml"), format!("{name}.crt")] {
            let path = self.inner.dir.join(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(TrustError::Io { path, message: e.to_string() });
                }
            }
        }

        info!(name, "trust store entry removed");
        self.inner.remotes.write().remove(name);
        Ok(())
    }
}

fn load_remote(yaml_path: &Path) -> Result<Remote, TrustError> {
    let raw = fs::read_to_string(yaml_path)
        .map_err(|e| TrustError::Io { path: yaml_path.to_path_buf(), message: e.to_string() })?;
    let location: Location = serde_yaml::from_str(&raw).map_err(|e| {
        TrustError::Invalid { path: yaml_path.to_path_buf(), message: e.to_string() }
    })?;

    let cert_path = yaml_path.with_extension("crt");
    let cert_pem = fs::read_to_string(&cert_path)
        .map_err(|e| TrustError::Io { path: cert_path.clone(), message: e.to_string() })?;

    let remote = Remote::new(&location.name, location.address, &cert_pem)?;

    let stem = yaml_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if stem != remote.name() {
        return Err(TrustError::Invalid {
            path: yaml_path.to_path_buf(),
            message: format!("file stem {stem:?} does not match name {:?}", remote.name()),
        });
    }

    Ok(remote)
}

/// Temp file in the same directory, fsync, rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), TrustError> {
    let tmp = path.with_extension("tmp");
    let io_err =
        |p: &Path, e: std::io::Error| TrustError::Io { path: p.to_path_buf(), message: e.to_string() };

    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| io_err(&tmp, e))?;
    file.write_all(contents).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
