use super::{StoreError, write_private};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manager state that outlives a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedState {
    /// Tunnels that were up when the state was saved
    #[serde(default)]
    pub running: BTreeSet<String>,
    /// Tunnel most recently brought up
    #[serde(default)]
    pub last_used: Option<String>,
}

/// JSON file holding a [`SavedState`]
///
/// Without a path the state is not persisted: loads return the default and
/// saves succeed without writing.
#[derive(Debug, Clone, Default)]
pub struct StateFile {
    path: Option<PathBuf>,
}

impl StateFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn load(&self) -> Result<SavedState, StoreError> {
        let Some(path) = &self.path else {
            return Ok(SavedState::default());
        };

        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}", path.display());
                Ok(SavedState::default())
            }
            Err(e) => Err(StoreError::io(path.display().to_string(), e)),
        }
    }

    pub async fn save(&self, state: &SavedState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(state)?;
        write_private(path, json.as_bytes())
            .await
            .map_err(|e| StoreError::io(path.display().to_string(), e))
    }
}
