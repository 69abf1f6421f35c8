use super::{ConfigStore, StoreError};
use crate::config::Config;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryStore {
    configs: BTreeMap<String, Config>,
    fail_next_save: bool,
    fail_next_delete: bool,
    fail_next_rename: bool,
    fail_save_for: HashSet<String>,
}

/// Map-backed config store with failure injection
#[derive(Default)]
pub struct MemoryConfigStore {
    inner: Mutex<MemoryStore>,
}

fn injected(name: &str) -> StoreError {
    StoreError::io(name, io::Error::other("injected failure"))
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `save` fail
    pub async fn fail_next_save(&self) {
        self.inner.lock().await.fail_next_save = true;
    }

    /// Make the next `delete` fail
    pub async fn fail_next_delete(&self) {
        self.inner.lock().await.fail_next_delete = true;
    }

    /// Make the next `rename` fail
    pub async fn fail_next_rename(&self) {
        self.inner.lock().await.fail_next_rename = true;
    }

    /// Make every `save` of `name` fail until cleared
    pub async fn fail_save_for(&self, name: &str) {
        self.inner.lock().await.fail_save_for.insert(name.to_string());
    }

    pub async fn clear_failures(&self) {
        let mut inner = self.inner.lock().await;
        inner.fail_next_save = false;
        inner.fail_next_delete = false;
        inner.fail_next_rename = false;
        inner.fail_save_for.clear();
    }

    /// Stored config, bypassing failure injection
    pub async fn get(&self, name: &str) -> Option<Config> {
        self.inner.lock().await.configs.get(name).cloned()
    }

    pub async fn names(&self) -> BTreeSet<String> {
        self.inner.lock().await.configs.keys().cloned().collect()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self, name: &str) -> Result<Config, StoreError> {
        self.inner
            .lock()
            .await
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn save(&self, name: &str, config: &Config) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if std::mem::take(&mut inner.fail_next_save) || inner.fail_save_for.contains(name) {
            return Err(injected(name));
        }
        inner.configs.insert(name.to_string(), config.clone());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if std::mem::take(&mut inner.fail_next_delete) {
            return Err(injected(name));
        }
        inner
            .configs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn enumerate(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.names().await)
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if std::mem::take(&mut inner.fail_next_rename) {
            return Err(injected(old));
        }
        if inner.configs.contains_key(new) {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }
        let config = inner
            .configs
            .remove(old)
            .ok_or_else(|| StoreError::NotFound(old.to_string()))?;
        inner.configs.insert(new.to_string(), config);
        Ok(())
    }
}
