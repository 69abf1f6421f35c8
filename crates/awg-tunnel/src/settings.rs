//! Manager Settings
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration.
//!
//! ```toml
//! config_dir = "/etc/amnezia/amneziawg"
//! state_file = "/var/lib/awg-manager/state.json"
//! sort_order = "insertion"
//! restore_on_boot = true
//! operation_timeout_ms = 30000
//! backend = "quick"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Order of [`TunnelManager::get_tunnels`](crate::TunnelManager::get_tunnels)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Order in which tunnels entered the registry
    #[default]
    Insertion,
    /// Case-insensitive by name
    Alphabetical,
}

/// Which backend the front-end should build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `awg-quick` and `awg` on the host
    #[default]
    Quick,
    /// In-process, for tests and dry runs only. Nothing reaches the host
    /// and running tunnels are forgotten when the process exits.
    Memory,
}

/// Tunnel manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Directory holding one `<name>.conf` per tunnel
    pub config_dir: PathBuf,
    /// Where the running set and last-used tunnel are remembered
    pub state_file: Option<PathBuf>,
    /// Scratch directory for configs handed to `awg-quick`
    pub runtime_dir: PathBuf,
    pub sort_order: SortOrder,
    /// Bring previously running tunnels back up on the first restore
    pub restore_on_boot: bool,
    /// Upper bound for every backend and store call
    pub operation_timeout_ms: u64,
    pub backend: BackendKind,
    pub awg_quick_path: PathBuf,
    pub awg_path: PathBuf,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/amnezia/amneziawg"),
            state_file: Some(PathBuf::from("/var/lib/awg-manager/state.json")),
            runtime_dir: PathBuf::from("/run/awg-manager"),
            sort_order: SortOrder::default(),
            restore_on_boot: false,
            operation_timeout_ms: 30_000,
            backend: BackendKind::default(),
            awg_quick_path: PathBuf::from("awg-quick"),
            awg_path: PathBuf::from("awg"),
        }
    }
}

impl ManagerSettings {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    Io(String),

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(ManagerSettings::from_toml("").unwrap(), ManagerSettings::default());
    }

    #[test]
    fn test_partial_toml() {
        let settings = ManagerSettings::from_toml(
            r#"
            config_dir = "/tmp/tunnels"
            sort_order = "alphabetical"
            restore_on_boot = true
            operation_timeout_ms = 500
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(settings.config_dir, PathBuf::from("/tmp/tunnels"));
        assert_eq!(settings.sort_order, SortOrder::Alphabetical);
        assert!(settings.restore_on_boot);
        assert_eq!(settings.operation_timeout(), Duration::from_millis(500));
        assert_eq!(settings.backend, BackendKind::Memory);
        assert_eq!(settings.awg_path, PathBuf::from("awg"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = ManagerSettings::default();
        let text = settings.to_toml();
        assert_eq!(ManagerSettings::from_toml(&text).unwrap(), settings);
    }

    #[test]
    fn test_bad_value() {
        let result = ManagerSettings::from_toml("sort_order = \"random\"");
        assert!(matches!(result, Err(SettingsError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "restore_on_boot = true\n").unwrap();

        assert!(ManagerSettings::from_toml_file(&path).unwrap().restore_on_boot);
        assert!(matches!(
            ManagerSettings::from_toml_file(&dir.path().join("missing.toml")),
            Err(SettingsError::Io(_))
        ));
    }
}
