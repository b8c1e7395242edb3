//! Validated startup configuration.
//!
//! Everything here is read once before mounting and is immutable afterwards.
//! Any malformed value is a [`ConfigError`] and aborts startup.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use snafu::ResultExt;
use snafu::ensure;

use crate::constants::BYTES_PER_MIB;
use crate::constants::SYNC_INTERVAL;
use crate::constants::SYNC_TIMEOUT;
use crate::error::ConfigError;
use crate::error::InvalidIdentitySnafu;
use crate::error::InvalidPortSnafu;
use crate::error::QuotaOverflowSnafu;
use crate::error::RootDirSnafu;
use crate::error::RootNotDirectorySnafu;

/// Tenant and node identity used to address the remote counter store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Tenant (filesystem service instance) id, the hash field.
    pub tenant_id: String,
    /// Node id, suffix of the hash key.
    pub node_id: String,
}

impl Identity {
    /// Build an identity, rejecting ids that cannot travel as a single protocol token.
    pub fn new(tenant_id: impl Into<String>, node_id: impl Into<String>) -> Result<Self, ConfigError> {
        let tenant_id = tenant_id.into();
        let node_id = node_id.into();
        validate_id("tenant id", &tenant_id)?;
        validate_id("node id", &node_id)?;
        Ok(Self { tenant_id, node_id })
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), ConfigError> {
    ensure!(
        !value.is_empty() && !value.chars().any(char::is_whitespace),
        InvalidIdentitySnafu { field, value }
    );
    Ok(())
}

/// Connection parameters for the remote counter store.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteStoreConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Shared secret sent with `AUTH`.
    pub secret: String,
}

// Hand-written so the secret never reaches a log line.
impl fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Timing of the usage sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTiming {
    /// Interval between ticks.
    pub interval: Duration,
    /// Bound on connect and on each command round-trip.
    pub timeout: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            interval: SYNC_INTERVAL,
            timeout: SYNC_TIMEOUT,
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct QuotaFsConfig {
    /// Canonical path of the directory exposed through the mount.
    pub root_dir: PathBuf,
    /// Quota limit in bytes.
    pub limit_bytes: u64,
    /// Tenant/node identity.
    pub identity: Identity,
    /// Remote counter store.
    pub remote: RemoteStoreConfig,
    /// Sync task timing.
    pub sync: SyncTiming,
}

impl QuotaFsConfig {
    /// Validate raw startup parameters.
    ///
    /// `quota_mib` is converted to bytes; the root directory is canonicalized.
    pub fn new(
        root_dir: &Path,
        quota_mib: u64,
        identity: Identity,
        remote: RemoteStoreConfig,
        sync: SyncTiming,
    ) -> Result<Self, ConfigError> {
        let root_dir = std::fs::canonicalize(root_dir).context(RootDirSnafu { path: root_dir })?;
        ensure!(root_dir.is_dir(), RootNotDirectorySnafu { path: &root_dir });
        ensure!(remote.port != 0, InvalidPortSnafu);

        let limit_bytes = mib_to_bytes(quota_mib)?;

        Ok(Self {
            root_dir,
            limit_bytes,
            identity,
            remote,
            sync,
        })
    }
}

/// Convert a quota in whole MiB to bytes.
pub fn mib_to_bytes(quota_mib: u64) -> Result<u64, ConfigError> {
    quota_mib.checked_mul(BYTES_PER_MIB).ok_or_else(|| QuotaOverflowSnafu { quota_mib }.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> RemoteStoreConfig {
        RemoteStoreConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            secret: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_mib_to_bytes() {
        assert_eq!(mib_to_bytes(0).unwrap(), 0);
        assert_eq!(mib_to_bytes(10).unwrap(), 10 * 1024 * 1024);
        assert!(matches!(mib_to_bytes(u64::MAX), Err(ConfigError::QuotaOverflow { .. })));
    }

    #[test]
    fn test_identity_validation() {
        assert!(Identity::new("tenant-1", "node-1").is_ok());
        assert!(matches!(
            Identity::new("", "node-1"),
            Err(ConfigError::InvalidIdentity { field: "tenant id", .. })
        ));
        assert!(matches!(
            Identity::new("tenant-1", "node 1"),
            Err(ConfigError::InvalidIdentity { field: "node id", .. })
        ));
    }

    #[test]
    fn test_config_canonicalizes_root() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let dotted = dir.path().join("a/../a");

        let identity = Identity::new("t", "n").unwrap();
        let config = QuotaFsConfig::new(&dotted, 10, identity, remote(), SyncTiming::default()).unwrap();

        assert_eq!(config.root_dir, std::fs::canonicalize(&nested).unwrap());
        assert_eq!(config.limit_bytes, 10 * BYTES_PER_MIB);
    }

    #[test]
    fn test_config_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let identity = Identity::new("t", "n").unwrap();

        let err = QuotaFsConfig::new(&missing, 10, identity, remote(), SyncTiming::default()).unwrap_err();
        assert!(matches!(err, ConfigError::RootDir { .. }));
    }

    #[test]
    fn test_config_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let identity = Identity::new("t", "n").unwrap();

        let err = QuotaFsConfig::new(&file, 10, identity, remote(), SyncTiming::default()).unwrap_err();
        assert!(matches!(err, ConfigError::RootNotDirectory { .. }));
    }

    #[test]
    fn test_config_rejects_port_zero() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::new("t", "n").unwrap();
        let mut remote = remote();
        remote.port = 0;

        let err = QuotaFsConfig::new(dir.path(), 10, identity, remote, SyncTiming::default()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn test_remote_debug_redacts_secret() {
        let rendered = format!("{:?}", remote());
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
