//! Optional TOML configuration file for the `tftpd` binary (`--config`).
//!
//! Scoped to this crate's surface only: root, bind endpoint, timeout,
//! retries, default blksize, and whether WRQ may overwrite existing files.
//! No multicast or batching/zero-copy knobs — those name features this
//! spec's Non-goals exclude outright.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerFileConfig {
    pub root: PathBuf,
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    pub timeout: Option<u8>,
    pub retries: u32,
    pub default_blksize: Option<u16>,
    pub allow_overwrite: bool,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        ServerFileConfig {
            root: PathBuf::from("."),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 69,
            timeout: None,
            retries: 3,
            default_blksize: None,
            allow_overwrite: false,
        }
    }
}

/// Reads and parses `path` as a [`ServerFileConfig`]. Unknown fields in the
/// file are rejected by `toml` the normal way (an `Err` here), rather than
/// silently ignored.
pub fn load(path: &Path) -> Result<ServerFileConfig, Error> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tftpd.toml");
        std::fs::write(&path, "root = \"/srv/tftp\"\nbind_port = 6969\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(PathBuf::from("/srv/tftp"), config.root);
        assert_eq!(6969, config.bind_port);
        assert_eq!(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.bind_addr);
        assert_eq!(3, config.retries);
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tftpd.toml");
        std::fs::write(&path, "root = \n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.toml")).is_err());
    }
}
