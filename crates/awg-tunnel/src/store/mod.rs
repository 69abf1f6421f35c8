//! Config Store
//!
//! Persistence for tunnel configurations, keyed by tunnel name, plus the
//! small state file that remembers which tunnels were running.

mod file;
mod memory;
mod state;

pub use file::FileConfigStore;
pub use memory::MemoryConfigStore;
pub use state::{SavedState, StateFile};

use crate::config::{Config, ConfigError};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Persistent tunnel configurations
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Config, StoreError>;

    /// Create or overwrite the config stored under `name`
    async fn save(&self, name: &str, config: &Config) -> Result<(), StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Names of every stored config
    async fn enumerate(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Move a config to a new name. Fails if `new` already exists.
    async fn rename(&self, old: &str, new: &str) -> Result<(), StoreError>;
}

/// Config store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No stored config named {0}")]
    NotFound(String),

    #[error("A config named {0} already exists")]
    AlreadyExists(String),

    #[error("I/O error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Stored config {name} is invalid: {source}")]
    Parse {
        name: String,
        #[source]
        source: ConfigError,
    },

    #[error("State file is corrupt: {0}")]
    StateFormat(#[from] serde_json::Error),

    #[error("Store timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub(crate) fn io(name: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            name: name.into(),
            source,
        }
    }
}

/// Write a file readable only by its owner, atomically
///
/// Contents go to a hidden sibling first and are renamed over `path`, so
/// readers see either the old file or the new one.
pub(crate) async fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await
}
