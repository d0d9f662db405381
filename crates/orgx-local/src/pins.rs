//! Persisted next-up pins (§3 "Pins", §6 `next-up-pins.json`): an ordered
//! operator preference list consulted by the next-up ranker.

use orgx_types::Pin;
use serde::{Deserialize, Serialize};

use crate::store::JsonFileStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PinsFile {
    #[serde(default)]
    pub pins: Vec<Pin>,
}

pub struct PinStore {
    file: JsonFileStore<PinsFile>,
}

impl PinStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            file: JsonFileStore::open(path).await,
        }
    }

    pub async fn list(&self) -> Vec<Pin> {
        self.file.get().await.pins
    }

    pub async fn pin(&self, new_pin: Pin) -> Vec<Pin> {
        self.file
            .update(|state| {
                state.pins.retain(|p| {
                    !(p.initiative_id == new_pin.initiative_id && p.workstream_id == new_pin.workstream_id)
                });
                state.pins.push(new_pin.clone());
            })
            .await
            .map(|state| state.pins)
            .unwrap_or_default()
    }

    pub async fn unpin(&self, initiative_id: &str, workstream_id: &str) -> Vec<Pin> {
        self.file
            .update(|state| {
                state
                    .pins
                    .retain(|p| !(p.initiative_id == initiative_id && p.workstream_id == workstream_id));
            })
            .await
            .map(|state| state.pins)
            .unwrap_or_default()
    }

    pub async fn reorder(&self, ordered_keys: &[(String, String)]) -> Vec<Pin> {
        self.file
            .update(|state| {
                let mut reordered = Vec::with_capacity(state.pins.len());
                for (initiative_id, workstream_id) in ordered_keys {
                    if let Some(idx) = state
                        .pins
                        .iter()
                        .position(|p| &p.initiative_id == initiative_id && &p.workstream_id == workstream_id)
                    {
                        reordered.push(state.pins.remove(idx));
                    }
                }
                reordered.extend(state.pins.drain(..));
                state.pins = reordered;
            })
            .await
            .map(|state| state.pins)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("orgx-pins-{}.json", uuid::Uuid::new_v4()))
    }

    fn pin(initiative: &str, workstream: &str) -> Pin {
        Pin {
            initiative_id: initiative.to_string(),
            workstream_id: workstream.to_string(),
            preferred_task_id: None,
            preferred_milestone_id: None,
        }
    }

    #[tokio::test]
    async fn pin_then_unpin_round_trips() {
        let store = PinStore::open(temp_path()).await;
        store.pin(pin("init-1", "ws-1")).await;
        assert_eq!(store.list().await.len(), 1);
        store.unpin("init-1", "ws-1").await;
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn reorder_moves_named_keys_to_the_front_in_order() {
        let store = PinStore::open(temp_path()).await;
        store.pin(pin("a", "1")).await;
        store.pin(pin("b", "2")).await;
        store.pin(pin("c", "3")).await;
        let reordered = store
            .reorder(&[("c".to_string(), "3".to_string()), ("a".to_string(), "1".to_string())])
            .await;
        assert_eq!(reordered[0].initiative_id, "c");
        assert_eq!(reordered[1].initiative_id, "a");
        assert_eq!(reordered[2].initiative_id, "b");
    }
}
