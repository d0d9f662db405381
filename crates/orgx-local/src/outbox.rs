//! Outbox (§3, §4.7, §GLOSSARY): a best-effort, append-only per-initiative
//! JSONL file holding activity events awaiting cloud replay. Append is
//! serialized per initiative id (§5) so a concurrent reader never observes
//! a partial line (invariant I7).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use orgx_types::OutboxItem;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

pub struct Outbox {
    dir: PathBuf,
    append_locks: RwLock<HashMap<String, Mutex<()>>>,
}

impl Outbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append_locks: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, initiative_id: &str) -> PathBuf {
        self.dir.join(format!("{initiative_id}.jsonl"))
    }

    async fn lock_for(&self, initiative_id: &str) {
        // Ensures a per-initiative Mutex entry exists before the caller
        // acquires it; avoids holding the outer RwLock across the append.
        let exists = self.append_locks.read().await.contains_key(initiative_id);
        if !exists {
            self.append_locks
                .write()
                .await
                .entry(initiative_id.to_string())
                .or_insert_with(|| Mutex::new(()));
        }
    }

    /// Appends one JSON line, best-effort. A write failure is logged and
    /// swallowed (the outbox is explicitly non-durable, §1 "not a durable
    /// queue").
    pub async fn append(&self, initiative_id: &str, item: &OutboxItem) {
        self.lock_for(initiative_id).await;
        let guard = self.append_locks.read().await;
        let Some(lock) = guard.get(initiative_id) else {
            return;
        };
        let _permit = lock.lock().await;

        if let Err(err) = self.append_inner(initiative_id, item).await {
            tracing::warn!(initiative_id, error = %err, "outbox append failed");
        }
    }

    async fn append_inner(&self, initiative_id: &str, item: &OutboxItem) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(initiative_id);
        let mut line = serde_json::to_string(item).unwrap_or_default();
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        // A single write_all of the full line (payload + newline) is the
        // atomicity unit: readers iterating whole lines never see a
        // partial one, even if two appends interleave at the OS level for
        // normal-sized lines.
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Reads every item currently in an initiative's outbox. Missing file
    /// yields an empty list; unparseable lines are skipped.
    pub async fn read_all(&self, initiative_id: &str) -> Vec<OutboxItem> {
        read_outbox_file(&self.path_for(initiative_id)).await
    }
}

async fn read_outbox_file(path: &Path) -> Vec<OutboxItem> {
    let Ok(text) = fs::read_to_string(path).await else {
        return Vec::new();
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<OutboxItem>(l).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("orgx-outbox-test-{}", uuid::Uuid::new_v4()))
    }

    fn sample_item(id: &str) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type: "activity".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            payload: json!({"msg": id}),
            activity_item: None,
        }
    }

    #[tokio::test]
    async fn append_then_read_all_round_trips() {
        let dir = temp_dir();
        let outbox = Outbox::new(&dir);
        outbox.append("init-1", &sample_item("a")).await;
        outbox.append("init-1", &sample_item("b")).await;
        let items = outbox.read_all("init-1").await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a");
        assert_eq!(items[1].id, "b");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn missing_outbox_yields_empty_list() {
        let dir = temp_dir();
        let outbox = Outbox::new(&dir);
        assert!(outbox.read_all("nonexistent").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_to_same_initiative_do_not_interleave() {
        let dir = temp_dir();
        let outbox = std::sync::Arc::new(Outbox::new(&dir));
        let mut handles = Vec::new();
        for i in 0..20 {
            let outbox = outbox.clone();
            handles.push(tokio::spawn(async move {
                outbox.append("init-concurrent", &sample_item(&i.to_string())).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let items = outbox.read_all("init-concurrent").await;
        assert_eq!(items.len(), 20);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
