use super::{ConfigStore, StoreError, write_private};
use crate::config::Config;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const EXTENSION: &str = "conf";

/// One wg-quick file per tunnel in a directory
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, EXTENSION))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self, name: &str) -> Result<Config, StoreError> {
        let text = tokio::fs::read_to_string(self.path(name))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
                _ => StoreError::io(name, e),
            })?;

        Config::parse_wg_quick(&text).map_err(|source| StoreError::Parse {
            name: name.to_string(),
            source,
        })
    }

    async fn save(&self, name: &str, config: &Config) -> Result<(), StoreError> {
        let path = self.path(name);
        debug!("Saving {} to {}", name, path.display());
        write_private(&path, config.to_wg_quick().as_bytes())
            .await
            .map_err(|e| StoreError::io(name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        tokio::fs::remove_file(self.path(name))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
                _ => StoreError::io(name, e),
            })
    }

    async fn enumerate(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(StoreError::io(self.dir.display().to_string(), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(self.dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.insert(stem.to_string());
                }
            }
        }

        Ok(names)
    }

    async fn rename(&self, old: &str, new: &str) -> Result<(), StoreError> {
        let from = self.path(old);
        let to = self.path(new);

        if tokio::fs::try_exists(&to)
            .await
            .map_err(|e| StoreError::io(new, e))?
        {
            return Err(StoreError::AlreadyExists(new.to_string()));
        }

        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotFound(old.to_string()),
                _ => StoreError::io(old, e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Interface, Peer};
    use crate::keys::{KeyPair, PrivateKey};

    fn config() -> Config {
        let mut peer = Peer::new(KeyPair::generate().public);
        peer.endpoint = Some("203.0.113.5:51820".parse().unwrap());
        Config::new(Interface::new(PrivateKey::generate()), vec![peer])
    }

    #[tokio::test]
    async fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        let config = config();

        store.save("home", &config).await.unwrap();
        assert_eq!(store.load("home").await.unwrap(), config);
        assert!(dir.path().join("home.conf").exists());
    }

    #[tokio::test]
    async fn test_enumerate_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());

        store.save("home", &config()).await.unwrap();
        store.save("work", &config()).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let names = store.enumerate().await.unwrap();
        assert_eq!(names, BTreeSet::from(["home".to_string(), "work".to_string()]));
    }

    #[tokio::test]
    async fn test_enumerate_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path().join("absent"));
        assert!(store.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());

        store.save("home", &config()).await.unwrap();
        store.delete("home").await.unwrap();

        assert!(matches!(store.load("home").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("home").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::new(dir.path());
        let config = config();

        store.save("home", &config).await.unwrap();
        store.save("work", &config).await.unwrap();

        assert!(matches!(
            store.rename("home", "work").await,
            Err(StoreError::AlreadyExists(_))
        ));

        store.rename("home", "cabin").await.unwrap();
        assert_eq!(store.load("cabin").await.unwrap(), config);
        assert!(matches!(
            store.rename("home", "lake").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.conf"), "[Interface]\nPrivateKey = nope\n").unwrap();

        let store = FileConfigStore::new(dir.path());
        assert!(matches!(store.load("bad").await, Err(StoreError::Parse { .. })));
    }
}
