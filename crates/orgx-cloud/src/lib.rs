//! Cloud-plane client: the abstract boundary every read/write in the
//! control plane ultimately calls through. [`CloudClient`] is consulted
//! first by the local fallback mediator (`orgx-local`) on every read and
//! write path; implementations here are `HttpClient` (the real thing) and
//! `FakeCloudClient` (an in-memory double used by tests).

mod fake;
mod http_client;

pub use fake::FakeCloudClient;
pub use http_client::HttpCloudClient;

use async_trait::async_trait;
use orgx_types::{Entity, EntityType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("cloud transport error: {0}")]
    Transport(String),
    #[error("cloud plane returned unauthorized: {0}")]
    Unauthorized(String),
    #[error("cloud plane rejected the request: {0}")]
    Validation(String),
    #[error("cloud plane error: {0}")]
    Other(String),
}

impl CloudError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CloudError::Unauthorized(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityFilter {
    pub initiative_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitCheck {
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnGuardChecks {
    #[serde(rename = "rateLimit")]
    pub rate_limit: RateLimitCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnGuardResult {
    pub allowed: bool,
    pub checks: SpawnGuardChecks,
    #[serde(rename = "blockedReason")]
    pub blocked_reason: Option<String>,
    /// Model tier suggested by the guard, surfaced in the dispatch prompt
    /// when present (§4.5 step 3).
    pub tier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPlan {
    #[default]
    Free,
    Paid,
}

/// The cloud-plane boundary. Every method suspends (§5 "all cloud-plane
/// calls suspend"); callers in `orgx-local` are expected to race these
/// against a fallback path rather than block indefinitely.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn list_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
    ) -> Result<Vec<Entity>, CloudError>;

    async fn list_sessions(&self, filter: &EntityFilter) -> Result<Value, CloudError>;

    async fn list_activity(&self, filter: &EntityFilter) -> Result<Value, CloudError>;

    async fn list_agents(&self, initiative_id: Option<&str>) -> Result<Value, CloudError>;

    async fn list_decisions(&self, filter: &EntityFilter) -> Result<Value, CloudError>;

    async fn list_handoffs(&self, filter: &EntityFilter) -> Result<Value, CloudError>;

    async fn dashboard_bundle(&self, initiative_id: Option<&str>) -> Result<Value, CloudError>;

    async fn update_entity_status(
        &self,
        entity_type: EntityType,
        id: &str,
        status: &str,
    ) -> Result<(), CloudError>;

    /// Milestone/workstream rollup mutation via a batch changeset, keyed by
    /// an idempotency key so retried ticks don't double-apply (§4.5 step 6,
    /// §GLOSSARY "changeset").
    async fn apply_changeset(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: Value,
        idempotency_key: &str,
    ) -> Result<(), CloudError>;

    async fn check_spawn_guard(&self, domain: &str, task_id: &str) -> Result<SpawnGuardResult, CloudError>;

    async fn emit_activity(&self, event: Value) -> Result<(), CloudError>;

    async fn request_decision(&self, title: &str, body: Value) -> Result<Value, CloudError>;

    async fn billing_plan(&self) -> Result<BillingPlan, CloudError>;
}
