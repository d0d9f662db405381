//! Local Initiative Status Override (§3, §4.7): installed when a cloud
//! mutation to an initiative returns unauthorized, overlayed onto every
//! subsequent initiative read until a successful cloud mutation clears it.
//! Process-local only, in-memory, single mutex (§5).

use chrono::Utc;
use orgx_types::LocalInitiativeStatusOverride;
use tokio::sync::RwLock;

use std::collections::HashMap;

#[derive(Default)]
pub struct OverrideTable {
    entries: RwLock<HashMap<String, LocalInitiativeStatusOverride>>,
}

impl OverrideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, initiative_id: &str, status: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            initiative_id.to_string(),
            LocalInitiativeStatusOverride {
                status: status.to_string(),
                updated_at: Utc::now().to_rfc3339(),
            },
        );
    }

    pub async fn clear(&self, initiative_id: &str) {
        self.entries.write().await.remove(initiative_id);
    }

    pub async fn get(&self, initiative_id: &str) -> Option<LocalInitiativeStatusOverride> {
        self.entries.read().await.get(initiative_id).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, LocalInitiativeStatusOverride> {
        self.entries.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_then_clear_round_trips() {
        let table = OverrideTable::new();
        assert!(table.get("init-1").await.is_none());
        table.install("init-1", "archived").await;
        assert_eq!(table.get("init-1").await.unwrap().status, "archived");
        table.clear("init-1").await;
        assert!(table.get("init-1").await.is_none());
    }
}
