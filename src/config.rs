//! Configuration persistence
//!
//! The config file is `$DATA/config.json`. A missing or unreadable file
//! yields defaults, so a fresh install works without one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::core::adapter::FirewallAdapter;
use crate::core::nft::{self, NftablesAdapter};
use crate::core::proxy::ProxyAdapter;
use crate::utils::get_data_dir;

/// Which OS forwarding engine applies the mappings
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Kernel DNAT rules in a dedicated nftables table (needs elevation)
    #[strum(serialize = "nftables")]
    Nftables,
    /// Userspace TCP relay
    #[default]
    #[strum(serialize = "proxy")]
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,
    /// nftables table owned by ipf (nftables backend only)
    #[serde(default = "default_table")]
    pub nft_table: String,
    /// Record every nftables apply in `$STATE/audit.log`
    #[serde(default = "default_true")]
    pub audit: bool,
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            nft_table: default_table(),
            audit: true,
            log_to_file: false,
        }
    }
}

fn default_table() -> String {
    nft::DEFAULT_TABLE.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid nftables table name '{0}'")]
    InvalidTableName(String),

    #[error("Failed to start {backend} backend: {source}")]
    Backend {
        backend: Backend,
        #[source]
        source: std::io::Error,
    },
}

/// Builds the adapter selected by `config`.
///
/// # Errors
///
/// Returns `Err` for an invalid table name or if the backend's runtime
/// cannot be started.
pub fn build_adapter(config: &Config) -> Result<Box<dyn FirewallAdapter>, ConfigError> {
    let backend_err = |source| ConfigError::Backend {
        backend: config.backend,
        source,
    };

    match config.backend {
        Backend::Nftables => {
            if !nft::is_valid_table_name(&config.nft_table) {
                return Err(ConfigError::InvalidTableName(config.nft_table.clone()));
            }
            let audit = if config.audit {
                AuditLog::new()
                    .inspect_err(|e| warn!("Audit log disabled: {e}"))
                    .ok()
            } else {
                None
            };
            let adapter = NftablesAdapter::new(config.nft_table.clone(), audit).map_err(backend_err)?;
            info!("Using nftables backend (table inet {})", config.nft_table);
            Ok(Box::new(adapter))
        }
        Backend::Proxy => {
            let adapter = ProxyAdapter::new().map_err(backend_err)?;
            info!("Using userspace proxy backend");
            Ok(Box::new(adapter))
        }
    }
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|mut path| {
        path.push("config.json");
        path
    })
}

/// Saves the config to `$DATA/config.json`; does nothing if there is no data dir.
pub async fn save_config(config: &Config) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(&path, config).await,
        None => Ok(()),
    }
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0o600.
/// 2. Syncs it to disk.
/// 3. Atomically renames to the target path.
pub async fn save_config_to(path: &Path, config: &Config) -> std::io::Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("json.tmp");

    // Permissions are set at creation so the file is never world-readable
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;

    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from disk, or returns default if not found.
pub async fn load_config() -> Config {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => Config::default(),
    }
}

pub async fn load_config_from(path: &Path) -> Config {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => parse_or_default(&json, path),
        Err(_) => Config::default(),
    }
}

/// Synchronous `load_config()` for callers outside any async context.
///
/// Inside a tokio runtime the file is read with blocking `std::fs` instead,
/// since blocking on the current runtime would panic.
pub fn load_config_blocking() -> Config {
    if tokio::runtime::Handle::try_current().is_ok() {
        return config_path()
            .and_then(|path| {
                std::fs::read_to_string(&path)
                    .ok()
                    .map(|json| parse_or_default(&json, &path))
            })
            .unwrap_or_default();
    }

    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(load_config()),
        Err(e) => {
            warn!("Cannot build runtime to load config, using defaults: {e}");
            Config::default()
        }
    }
}

fn parse_or_default(json: &str, path: &Path) -> Config {
    serde_json::from_str(json).unwrap_or_else(|e| {
        warn!("Ignoring corrupt config {}: {e}", path.display());
        Config::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_backend_names() {
        assert_eq!(Backend::from_str("nftables").unwrap(), Backend::Nftables);
        assert_eq!(Backend::Proxy.to_string(), "proxy");
        assert_eq!(serde_json::to_string(&Backend::Nftables).unwrap(), "\"nftables\"");
        assert!(Backend::from_str("iptables").is_err());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"backend":"nftables"}"#).unwrap();
        assert_eq!(config.backend, Backend::Nftables);
        assert_eq!(config.nft_table, "ipf");
        assert!(config.audit);
        assert!(!config.log_to_file);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            backend: Backend::Nftables,
            nft_table: "ipf_home".to_string(),
            audit: false,
            log_to_file: true,
        };

        save_config_to(&path, &config).await.unwrap();
        assert_eq!(load_config_from(&path).await, config);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_or_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(load_config_from(&path).await, Config::default());

        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert_eq!(load_config_from(&path).await, Config::default());
    }

    #[test]
    fn test_build_adapter_rejects_bad_table() {
        let config = Config {
            backend: Backend::Nftables,
            nft_table: "bad name".to_string(),
            ..Config::default()
        };
        assert!(matches!(build_adapter(&config), Err(ConfigError::InvalidTableName(_))));
    }

    #[test]
    fn test_nftables_apply_audited_in_fresh_state_dir() {
        use crate::core::test_helpers::{ENV_VAR_MUTEX, isolate_home, mapping, setup_mock_nft};

        let _guard = ENV_VAR_MUTEX.lock().unwrap();
        setup_mock_nft();
        isolate_home();

        let config = Config {
            backend: Backend::Nftables,
            nft_table: "ipf_cfg_audit".to_string(),
            ..Config::default()
        };
        let adapter = build_adapter(&config).unwrap();
        adapter.install(&mapping("10.0.0.5", 8000, 9000), false).unwrap();

        let log_path = crate::utils::get_state_dir().unwrap().join("audit.log");
        let content = std::fs::read_to_string(&log_path).expect("audit log was written");
        assert!(content.contains("ipf_cfg_audit"));
    }

    #[test]
    fn test_build_proxy_adapter() {
        let adapter = build_adapter(&Config::default()).unwrap();
        assert_eq!(adapter.name(), "proxy");
    }
}
