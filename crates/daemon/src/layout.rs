//! # OS Layout
//!
//! Resolves and owns the daemon's state directory tree:
//!
//! ```text
//! <state>/
//! ├── server.crt / server.key     # this node's identity keypair
//! ├── cluster.crt / cluster.key   # shared cluster keypair
//! ├── daemon.yaml                 # persisted {name, address}
//! ├── control.socket              # unix control socket (0660, group-owned)
//! ├── truststore/                 # one .crt + .yaml pair per remote
//! └── database/                   # opaque to the kernel; info.yaml
//!                                 # presence means "bootstrapped or joined"
//! ```
//!
//! The layout is created once at startup (0755 directories) and every
//! other subsystem derives its paths from here. The socket group is
//! resolved eagerly so a typo fails the daemon before anything binds.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::Group;

use crate::error::LayoutError;

/// Environment variable consulted when no state directory argument is
/// given.
pub const STATE_DIR_ENV: &str = "SYNDIC_STATE_DIR";

/// File names under the state directory.
pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const CLUSTER_CERT_FILE: &str = "cluster.crt";
pub const CLUSTER_KEY_FILE: &str = "cluster.key";
pub const DAEMON_CONFIG_FILE: &str = "daemon.yaml";
pub const CONTROL_SOCKET_FILE: &str = "control.socket";
pub const TRUST_DIR: &str = "truststore";
pub const DATABASE_DIR: &str = "database";
pub const DATABASE_INFO_FILE: &str = "info.yaml";

/// Resolved state-directory layout plus socket-group ownership.
#[derive(Debug)]
pub struct OsLayout {
    state_dir: PathBuf,
    socket_group: Option<(String, u32)>,
}

impl OsLayout {
    /// Validates `state_dir`, creates the directory tree, and resolves
    /// the socket group to a gid.
    pub fn new(
        state_dir: impl Into<PathBuf>,
        socket_group: Option<&str>,
    ) -> Result<Self, LayoutError> {
        let state_dir = state_dir.into();

        match fs::metadata(&state_dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(LayoutError::NotADirectory(state_dir));
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(LayoutError::io(
                    format!("failed to inspect state directory {state_dir:?}"),
                    &err,
                ));
            }
        }

        let socket_group = match socket_group {
            None => None,
            Some(name) => {
                let group = Group::from_name(name)
                    .map_err(|e| LayoutError::Io {
                        context: format!("failed to look up group {name:?}"),
                        message: e.to_string(),
                    })?
                    .ok_or_else(|| LayoutError::UnknownGroup(name.to_string()))?;
                Some((name.to_string(), group.gid.as_raw()))
            }
        };

        let layout = Self { state_dir, socket_group };
        for dir in [layout.state_dir.clone(), layout.trust_dir(), layout.database_dir()] {
            mkdir_0755(&dir)?;
        }

        Ok(layout)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn trust_dir(&self) -> PathBuf {
        self.state_dir.join(TRUST_DIR)
    }

    pub fn database_dir(&self) -> PathBuf {
        self.state_dir.join(DATABASE_DIR)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.state_dir.join(CONTROL_SOCKET_FILE)
    }

    pub fn daemon_config(&self) -> PathBuf {
        self.state_dir.join(DAEMON_CONFIG_FILE)
    }

    /// `database/info.yaml`; its presence marks a bootstrapped or
    /// joined node.
    pub fn database_info(&self) -> PathBuf {
        self.database_dir().join(DATABASE_INFO_FILE)
    }

    pub fn socket_group_name(&self) -> Option<&str> {
        self.socket_group.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn socket_group_gid(&self) -> Option<u32> {
        self.socket_group.as_ref().map(|(_, gid)| *gid)
    }
}

fn mkdir_0755(dir: &Path) -> Result<(), LayoutError> {
    fs::create_dir_all(dir)
        .map_err(|e| LayoutError::io(format!("failed to create {dir:?}"), &e))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
        .map_err(|e| LayoutError::io(format!("failed to set mode on {dir:?}"), &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_directory_tree() {
        let tmp = TempDir::new().expect("tempdir");
        let state = tmp.path().join("state");
        let layout = OsLayout::new(&state, None).expect("layout");

        assert!(layout.trust_dir().is_dir());
        assert!(layout.database_dir().is_dir());
        assert_eq!(layout.control_socket(), state.join("control.socket"));
        assert_eq!(layout.daemon_config(), state.join("daemon.yaml"));
        assert_eq!(
            layout.database_info(),
            state.join("database").join("info.yaml")
        );
    }

    #[test]
    fn rejects_file_as_state_dir() {
        let tmp = TempDir::new().expect("tempdir");
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"x").expect("write");

        assert!(matches!(
            OsLayout::new(&file, None),
            Err(LayoutError::NotADirectory(_))
        ));
    }

    #[test]
    fn rejects_unknown_group() {
        let tmp = TempDir::new().expect("tempdir");
        let err = OsLayout::new(tmp.path(), Some("syndic-no-such-group")).unwrap_err();
        assert!(matches!(err, LayoutError::UnknownGroup(_)));
    }

    #[test]
    fn idempotent_over_existing_tree() {
        let tmp = TempDir::new().expect("tempdir");
        OsLayout::new(tmp.path(), None).expect("first");
        OsLayout::new(tmp.path(), None).expect("second");
    }
}
