//! # Persisted Daemon Configuration
//!
//! `<state>/daemon.yaml` holds the node's `{name, address}` — written
//! on bootstrap/join (and on address change), read back on every
//! restart. Written atomically so a crash never leaves a truncated
//! config behind.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::DaemonError;
use crate::trust::Location;

pub(crate) fn read_location(path: &Path) -> Result<Location, DaemonError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        DaemonError::Config(format!("Failed to find daemon configuration: {e}"))
    })?;
    let location: Location = serde_yaml::from_str(&raw).map_err(|e| {
        DaemonError::Config(format!("Failed to parse daemon config from yaml: {e}"))
    })?;

    if location.name.is_empty() {
        return Err(DaemonError::Config(
            "Daemon configuration has an empty name".into(),
        ));
    }

    Ok(location)
}

pub(crate) fn write_location(path: &Path, location: &Location) -> Result<(), DaemonError> {
    if location.name.is_empty() {
        return Err(DaemonError::Config(
            "Daemon configuration requires a name".into(),
        ));
    }

    let yaml = serde_yaml::to_string(location).map_err(|e| {
        DaemonError::Config(format!("Failed to encode daemon config to yaml: {e}"))
    })?;

    let write_err =
        |e: std::io::Error| DaemonError::Config(format!("Failed to write daemon configuration: {e}"));

    let tmp = path.with_extension("yaml.tmp");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(write_err)?;
    file.write_all(yaml.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(write_err)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("daemon.yaml");

        let location = Location {
            name: "alpha".into(),
            address: "0.0.0.0:7000".parse().expect("addr"),
        };
        write_location(&path, &location).expect("write");

        let back = read_location(&path).expect("read");
        assert_eq!(back, location);

        // No temp file left behind.
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let tmp = TempDir::new().expect("tempdir");
        let err = read_location(&tmp.path().join("daemon.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to find daemon configuration"));
    }

    #[test]
    fn empty_name_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("daemon.yaml");
        std::fs::write(&path, "name: \"\"\naddress: 0.0.0.0:7000\n").expect("write");
        assert!(read_location(&path).is_err());
    }
}
