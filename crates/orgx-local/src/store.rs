//! Generic JSON-file-backed store: read-modify-write with
//! rollback-on-persist-failure, the same shape as the teacher's
//! shared-resource persistence. Every persisted state file under
//! `$HOME/.config/useorgx/openclaw-plugin/` uses this.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A single JSON document at a fixed path, held in memory and persisted on
/// every mutation. Mirrors `AppState::{load,persist}_shared_resources`: on
/// a persist failure the in-memory copy is rolled back to what was last
/// durably written, so readers never observe state that didn't make it to
/// disk.
pub struct JsonFileStore<T> {
    path: PathBuf,
    state: RwLock<T>,
}

impl<T> JsonFileStore<T>
where
    T: Default + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path).await.unwrap_or_default();
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    pub async fn get(&self) -> T {
        self.state.read().await.clone()
    }

    /// Applies `mutate` to an in-memory clone, persists it, and only then
    /// commits it as the new in-memory state. If the persist fails, the
    /// in-memory state is left untouched and the error is returned.
    pub async fn update<F>(&self, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut T),
    {
        let mut candidate = self.state.read().await.clone();
        mutate(&mut candidate);
        persist(&self.path, &candidate).await?;
        *self.state.write().await = candidate.clone();
        Ok(candidate)
    }
}

async fn load<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = fs::read_to_string(path)
        .await
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&raw).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

async fn persist<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Write {
                path: path.to_path_buf(),
                source,
            })?;
    }
    let payload = serde_json::to_string_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, payload)
        .await
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("orgx-store-test-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn update_persists_and_is_visible_to_get() {
        let path = temp_path();
        let store: JsonFileStore<Counter> = JsonFileStore::open(&path).await;
        store.update(|c| c.value += 1).await.unwrap();
        assert_eq!(store.get().await.value, 1);

        let reopened: JsonFileStore<Counter> = JsonFileStore::open(&path).await;
        assert_eq!(reopened.get().await.value, 1);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_file_yields_default_state() {
        let path = temp_path();
        let store: JsonFileStore<Counter> = JsonFileStore::open(&path).await;
        assert_eq!(store.get().await, Counter::default());
    }
}
