use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orgx_types::{Entity, EntityType};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::{BillingPlan, CloudClient, CloudError, EntityFilter, SpawnGuardResult};

/// In-memory double used by tests that don't want a live cloud plane.
/// Configure failure injection via [`FakeCloudClient::fail_next`] /
/// [`FakeCloudClient::unauthorize_next`] before exercising the fallback
/// paths in `orgx-local`.
#[derive(Clone, Default)]
pub struct FakeCloudClient {
    entities: Arc<RwLock<HashMap<EntityType, Vec<Entity>>>>,
    activity: Arc<RwLock<Vec<Value>>>,
    spawn_guard: Arc<RwLock<Option<SpawnGuardResult>>>,
    billing_plan: Arc<RwLock<BillingPlan>>,
    fail_next: Arc<RwLock<bool>>,
    unauthorized_next: Arc<RwLock<bool>>,
}

impl FakeCloudClient {
    pub fn new() -> Self {
        Self {
            billing_plan: Arc::new(RwLock::new(BillingPlan::Paid)),
            ..Default::default()
        }
    }

    pub async fn seed_entities(&self, entity_type: EntityType, entities: Vec<Entity>) {
        self.entities.write().await.insert(entity_type, entities);
    }

    pub async fn set_spawn_guard(&self, result: SpawnGuardResult) {
        *self.spawn_guard.write().await = Some(result);
    }

    pub async fn set_billing_plan(&self, plan: BillingPlan) {
        *self.billing_plan.write().await = plan;
    }

    pub async fn fail_next(&self) {
        *self.fail_next.write().await = true;
    }

    pub async fn unauthorize_next(&self) {
        *self.unauthorized_next.write().await = true;
    }

    async fn maybe_fail(&self) -> Result<(), CloudError> {
        if std::mem::take(&mut *self.unauthorized_next.write().await) {
            return Err(CloudError::Unauthorized("fake: unauthorized".to_string()));
        }
        if std::mem::take(&mut *self.fail_next.write().await) {
            return Err(CloudError::Transport("fake: injected failure".to_string()));
        }
        Ok(())
    }

    pub async fn emitted_activity(&self) -> Vec<Value> {
        self.activity.read().await.clone()
    }
}

#[async_trait]
impl CloudClient for FakeCloudClient {
    async fn list_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>, CloudError> {
        self.maybe_fail().await?;
        let all = self
            .entities
            .read()
            .await
            .get(&entity_type)
            .cloned()
            .unwrap_or_default();
        Ok(match &filter.initiative_id {
            Some(id) => all
                .into_iter()
                .filter(|e| {
                    e.get("initiative_id").and_then(|v| v.as_str()) == Some(id.as_str())
                        || e.get("id").and_then(|v| v.as_str()) == Some(id.as_str())
                })
                .collect(),
            None => all,
        })
    }

    async fn list_sessions(&self, _filter: &EntityFilter) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "items": [] }))
    }

    async fn list_activity(&self, _filter: &EntityFilter) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "items": self.activity.read().await.clone() }))
    }

    async fn list_agents(&self, _initiative_id: Option<&str>) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "items": [] }))
    }

    async fn list_decisions(&self, _filter: &EntityFilter) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "items": [] }))
    }

    async fn list_handoffs(&self, _filter: &EntityFilter) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "items": [] }))
    }

    async fn dashboard_bundle(&self, _initiative_id: Option<&str>) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({}))
    }

    async fn update_entity_status(
        &self,
        entity_type: EntityType,
        id: &str,
        status: &str,
    ) -> Result<(), CloudError> {
        self.maybe_fail().await?;
        let mut entities = self.entities.write().await;
        if let Some(list) = entities.get_mut(&entity_type) {
            if let Some(entity) = list.iter_mut().find(|e| e.get("id").and_then(|v| v.as_str()) == Some(id)) {
                entity.insert("status".to_string(), json!(status));
            }
        }
        Ok(())
    }

    async fn apply_changeset(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: Value,
        _idempotency_key: &str,
    ) -> Result<(), CloudError> {
        self.maybe_fail().await?;
        let mut entities = self.entities.write().await;
        if let Some(list) = entities.get_mut(&entity_type) {
            if let Some(entity) = list.iter_mut().find(|e| e.get("id").and_then(|v| v.as_str()) == Some(id)) {
                if let Some(patch_obj) = patch.as_object() {
                    for (k, v) in patch_obj {
                        entity.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_spawn_guard(&self, _domain: &str, _task_id: &str) -> Result<SpawnGuardResult, CloudError> {
        self.maybe_fail().await?;
        Ok(self.spawn_guard.read().await.clone().unwrap_or(SpawnGuardResult {
            allowed: true,
            checks: crate::SpawnGuardChecks {
                rate_limit: crate::RateLimitCheck { passed: true },
            },
            blocked_reason: None,
            tier: None,
        }))
    }

    async fn emit_activity(&self, event: Value) -> Result<(), CloudError> {
        self.maybe_fail().await?;
        self.activity.write().await.push(event);
        Ok(())
    }

    async fn request_decision(&self, title: &str, body: Value) -> Result<Value, CloudError> {
        self.maybe_fail().await?;
        Ok(json!({ "title": title, "body": body, "id": "fake-decision" }))
    }

    async fn billing_plan(&self) -> Result<BillingPlan, CloudError> {
        self.maybe_fail().await?;
        Ok(*self.billing_plan.read().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seeded_entities_are_filtered_by_initiative() {
        let client = FakeCloudClient::new();
        client
            .seed_entities(
                EntityType::Task,
                vec![
                    json!({"id": "t1", "initiative_id": "init-1"}).as_object().unwrap().clone(),
                    json!({"id": "t2", "initiative_id": "init-2"}).as_object().unwrap().clone(),
                ],
            )
            .await;
        let filter = EntityFilter {
            initiative_id: Some("init-1".to_string()),
            limit: None,
        };
        let result = client.list_entities(EntityType::Task, &filter).await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn fail_next_is_one_shot() {
        let client = FakeCloudClient::new();
        client.fail_next().await;
        let filter = EntityFilter::default();
        assert!(client.list_entities(EntityType::Task, &filter).await.is_err());
        assert!(client.list_entities(EntityType::Task, &filter).await.is_ok());
    }

    #[tokio::test]
    async fn unauthorize_next_yields_unauthorized_error() {
        let client = FakeCloudClient::new();
        client.unauthorize_next().await;
        let err = client
            .update_entity_status(EntityType::Initiative, "init-1", "archived")
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }
}
