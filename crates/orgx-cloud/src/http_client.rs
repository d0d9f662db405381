use async_trait::async_trait;
use orgx_types::{Entity, EntityType};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::{BillingPlan, CloudClient, CloudError, EntityFilter, SpawnGuardResult};

/// `reqwest`-backed cloud-plane client. Every request carries a bearer
/// token; a `401`/`403` response maps to [`CloudError::Unauthorized`] so
/// callers (the local fallback mediator) can install a status override
/// instead of surfacing a transport error.
#[derive(Clone)]
pub struct HttpCloudClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCloudClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, CloudError> {
        let req = self.authed(self.client.get(self.url(path))).query(query);
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        handle_response(resp).await
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, CloudError> {
        let req = self.authed(self.client.post(self.url(path))).json(&body);
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value, CloudError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let detail = resp.text().await.unwrap_or_default();
        return Err(CloudError::Unauthorized(detail));
    }
    if status.is_client_error() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(CloudError::Validation(detail));
    }
    if !status.is_success() {
        let detail = resp.text().await.unwrap_or_default();
        return Err(CloudError::Other(format!("{status}: {detail}")));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| CloudError::Transport(e.to_string()))
}

fn entity_path(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Initiative => "/entities/initiatives",
        EntityType::Workstream => "/entities/workstreams",
        EntityType::Milestone => "/entities/milestones",
        EntityType::Task => "/entities/tasks",
        EntityType::Decision => "/entities/decisions",
        EntityType::Artifact => "/entities/artifacts",
        EntityType::Agent => "/entities/agents",
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn list_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>, CloudError> {
        let mut query = Vec::new();
        if let Some(initiative_id) = &filter.initiative_id {
            query.push(("initiative_id", initiative_id.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        let value = self.get_json(entity_path(entity_type), &query).await?;
        let items = value
            .get("items")
            .or(Some(&value))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect())
    }

    async fn list_sessions(&self, filter: &EntityFilter) -> Result<Value, CloudError> {
        let query = filter
            .initiative_id
            .as_ref()
            .map(|id| vec![("initiative_id", id.clone())])
            .unwrap_or_default();
        self.get_json("/sessions", &query).await
    }

    async fn list_activity(&self, filter: &EntityFilter) -> Result<Value, CloudError> {
        let query = filter
            .initiative_id
            .as_ref()
            .map(|id| vec![("initiative_id", id.clone())])
            .unwrap_or_default();
        self.get_json("/activity", &query).await
    }

    async fn list_agents(&self, initiative_id: Option<&str>) -> Result<Value, CloudError> {
        let query = initiative_id
            .map(|id| vec![("initiative_id", id.to_string())])
            .unwrap_or_default();
        self.get_json("/agents", &query).await
    }

    async fn list_decisions(&self, filter: &EntityFilter) -> Result<Value, CloudError> {
        let query = filter
            .initiative_id
            .as_ref()
            .map(|id| vec![("initiative_id", id.clone())])
            .unwrap_or_default();
        self.get_json("/decisions", &query).await
    }

    async fn list_handoffs(&self, filter: &EntityFilter) -> Result<Value, CloudError> {
        let query = filter
            .initiative_id
            .as_ref()
            .map(|id| vec![("initiative_id", id.clone())])
            .unwrap_or_default();
        self.get_json("/handoffs", &query).await
    }

    async fn dashboard_bundle(&self, initiative_id: Option<&str>) -> Result<Value, CloudError> {
        let query = initiative_id
            .map(|id| vec![("initiative_id", id.to_string())])
            .unwrap_or_default();
        self.get_json("/dashboard/bundle", &query).await
    }

    async fn update_entity_status(
        &self,
        entity_type: EntityType,
        id: &str,
        status: &str,
    ) -> Result<(), CloudError> {
        let path = format!("{}/{}", entity_path(entity_type), id);
        self.post_json(&path, json!({ "status": status })).await?;
        Ok(())
    }

    async fn apply_changeset(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: Value,
        idempotency_key: &str,
    ) -> Result<(), CloudError> {
        let req = self
            .authed(self.client.post(self.url("/changesets")))
            .header("Idempotency-Key", idempotency_key)
            .json(&json!({
                "entityType": entity_type.as_str(),
                "id": id,
                "patch": patch,
            }));
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        handle_response(resp).await?;
        Ok(())
    }

    async fn check_spawn_guard(&self, domain: &str, task_id: &str) -> Result<SpawnGuardResult, CloudError> {
        let value = self
            .post_json(
                "/spawn-guard/check",
                json!({ "domain": domain, "taskId": task_id }),
            )
            .await?;
        serde_json::from_value(value).map_err(|e| CloudError::Transport(e.to_string()))
    }

    async fn emit_activity(&self, event: Value) -> Result<(), CloudError> {
        self.post_json("/activity/emit", event).await?;
        Ok(())
    }

    async fn request_decision(&self, title: &str, body: Value) -> Result<Value, CloudError> {
        self.post_json("/decisions", json!({ "title": title, "body": body })).await
    }

    async fn billing_plan(&self) -> Result<BillingPlan, CloudError> {
        let value = self.get_json("/billing/plan", &[]).await?;
        let plan = value.get("plan").and_then(|v| v.as_str()).unwrap_or("paid");
        Ok(if plan == "free" {
            BillingPlan::Free
        } else {
            BillingPlan::Paid
        })
    }
}
