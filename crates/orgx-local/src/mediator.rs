//! Local Fallback Mediator (§4.7): the read/write template every cloud call
//! in the control plane goes through. Reads try the cloud plane first,
//! enrich with local agent-launch context, and on failure fall back to a
//! payload synthesized from on-disk transcripts and the outbox. Writes to
//! an initiative that come back unauthorized install a
//! [`crate::overrides::OverrideTable`] entry and report synthetic success.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use orgx_cloud::{CloudClient, CloudError, EntityFilter};
use orgx_types::{Entity, EntityType, OutboxItem};
use serde_json::{json, Value};

use crate::launch_context::LaunchContextStore;
use crate::outbox::Outbox;
use crate::overrides::OverrideTable;

pub struct Mediator {
    cloud: Arc<dyn CloudClient>,
    launch_contexts: Arc<LaunchContextStore>,
    outbox: Arc<Outbox>,
    overrides: Arc<OverrideTable>,
    transcripts_dir: PathBuf,
}

/// A read result annotated with whether it came from the cloud plane or was
/// synthesized locally, matching the `degraded`/`localFallback` marker §4.7
/// requires on every fallback response.
#[derive(Debug, Clone)]
pub struct MediatedRead {
    pub payload: Value,
    pub degraded: bool,
    pub local_fallback: bool,
    pub error: Option<String>,
}

impl Mediator {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        launch_contexts: Arc<LaunchContextStore>,
        outbox: Arc<Outbox>,
        overrides: Arc<OverrideTable>,
        transcripts_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cloud,
            launch_contexts,
            outbox,
            overrides,
            transcripts_dir: transcripts_dir.into(),
        }
    }

    /// §4.7 step 1/2: entity list read, with transcript-derived fallback.
    pub async fn list_entities(&self, entity_type: EntityType, filter: &EntityFilter) -> MediatedRead {
        match self.cloud.list_entities(entity_type, filter).await {
            Ok(entities) => {
                let enriched = self.enrich_entities(entities).await;
                MediatedRead {
                    payload: json!(enriched),
                    degraded: false,
                    local_fallback: false,
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(?entity_type, error = %err, "cloud list_entities failed, falling back to local state");
                let synthesized = self.synthesize_entities(entity_type, filter).await;
                MediatedRead {
                    payload: json!(synthesized),
                    degraded: true,
                    local_fallback: true,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// §4.7 step 1/2/3: activity read, merged with unreplayed outbox entries
    /// for the initiative named in `filter`.
    pub async fn list_activity(&self, filter: &EntityFilter) -> MediatedRead {
        let (payload, degraded, local_fallback, error) = match self.cloud.list_activity(filter).await {
            Ok(payload) => (payload, false, false, None),
            Err(err) => {
                tracing::warn!(error = %err, "cloud list_activity failed, synthesizing from transcripts");
                (self.synthesize_activity(filter).await, true, true, Some(err.to_string()))
            }
        };

        let merged = self.merge_outbox_into_activity(payload, filter).await;
        MediatedRead {
            payload: merged,
            degraded,
            local_fallback,
            error,
        }
    }

    /// §4.7 unauthorized-write path: on cloud unauthorized for an initiative
    /// update, install a local override and report synthetic success.
    pub async fn update_initiative_status(&self, id: &str, status: &str) -> Result<Value, CloudError> {
        match self.cloud.update_entity_status(EntityType::Initiative, id, status).await {
            Ok(()) => {
                self.overrides.clear(id).await;
                Ok(json!({"ok": true, "localFallback": false}))
            }
            Err(err) if err.is_unauthorized() => {
                self.overrides.install(id, status).await;
                Ok(json!({"ok": true, "localFallback": true}))
            }
            Err(err) => Err(err),
        }
    }

    /// Overlays any installed [`crate::overrides::OverrideTable`] entry onto
    /// a cloud-sourced initiative entity's `status` field. Called on every
    /// initiative read, cloud or synthesized.
    pub async fn apply_initiative_override(&self, mut entity: Entity) -> Entity {
        let Some(id) = entity.get("id").and_then(Value::as_str).map(str::to_string) else {
            return entity;
        };
        if let Some(over) = self.overrides.get(&id).await {
            entity.insert("status".to_string(), json!(over.status));
        }
        entity
    }

    async fn enrich_entities(&self, entities: Vec<Entity>) -> Vec<Entity> {
        let mut out = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity = self.apply_initiative_override(entity).await;
            out.push(self.enrich_one(entity).await);
        }
        out
    }

    /// Injects `initiativeId`/`workstreamId`/`orgx_context` onto a session or
    /// activity item derived from the agent-launch-context store, when the
    /// item names an `agentId`/`runId` we have a recorded context for.
    async fn enrich_one(&self, mut entity: Entity) -> Entity {
        let agent_id = entity.get("agentId").and_then(Value::as_str).map(str::to_string);
        let Some(agent_id) = agent_id else {
            return entity;
        };
        if let Some(context) = self.launch_contexts.agent(&agent_id).await {
            if let Some(initiative_id) = &context.initiative_id {
                entity.entry("initiativeId").or_insert(json!(initiative_id));
            }
            if let Some(workstream_id) = &context.workstream_id {
                entity.entry("workstreamId").or_insert(json!(workstream_id));
            }
            entity.insert(
                "orgx_context".to_string(),
                json!({
                    "agentId": context.agent_id,
                    "runId": context.run_id,
                    "domain": context.domain,
                    "requiredSkills": context.required_skills,
                }),
            );
        }
        entity
    }

    async fn synthesize_entities(&self, entity_type: EntityType, filter: &EntityFilter) -> Vec<Entity> {
        if entity_type == EntityType::Initiative {
            return self.synthesize_initiatives(filter).await;
        }
        if entity_type != EntityType::Agent {
            // Only agent/session-shaped entities have a local transcript
            // counterpart; everything else has no local source of truth.
            return Vec::new();
        }
        let contexts = self.launch_contexts.all().await;
        let mut out: Vec<Entity> = Vec::new();
        for (agent_id, context) in contexts.agents {
            if let Some(initiative_id) = &filter.initiative_id {
                if context.initiative_id.as_deref() != Some(initiative_id.as_str()) {
                    continue;
                }
            }
            let mut entity = Entity::new();
            entity.insert("id".to_string(), json!(agent_id));
            entity.insert("agentId".to_string(), json!(context.agent_id));
            if let Some(initiative_id) = &context.initiative_id {
                entity.insert("initiativeId".to_string(), json!(initiative_id));
            }
            if let Some(workstream_id) = &context.workstream_id {
                entity.insert("workstreamId".to_string(), json!(workstream_id));
            }
            entity.insert("domain".to_string(), json!(context.domain));
            out.push(self.enrich_one(entity).await);
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// §4.7 / §8 Scenario 5: when the cloud plane can't be reached, every
    /// installed [`OverrideTable`] entry becomes its own synthetic initiative
    /// row instead of being silently dropped, so the override stays visible
    /// on the fallback path and not just on a cloud-success read.
    async fn synthesize_initiatives(&self, filter: &EntityFilter) -> Vec<Entity> {
        let overrides = self.overrides.snapshot().await;
        let mut out: Vec<Entity> = Vec::new();
        for (initiative_id, over) in overrides {
            if let Some(wanted) = &filter.initiative_id {
                if &initiative_id != wanted {
                    continue;
                }
            }
            let mut entity = Entity::new();
            entity.insert("id".to_string(), json!(initiative_id));
            entity.insert("status".to_string(), json!(over.status));
            entity.insert("localFallback".to_string(), json!(true));
            out.push(entity);
        }
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    async fn synthesize_activity(&self, filter: &EntityFilter) -> Value {
        let contexts = self.launch_contexts.all().await;
        let mut items: Vec<Value> = Vec::new();
        for run in contexts.runs.values() {
            if let Some(initiative_id) = &filter.initiative_id {
                if run.initiative_id.as_deref() != Some(initiative_id.as_str()) {
                    continue;
                }
            }
            let path = self
                .transcripts_dir
                .join(&run.agent_id)
                .join("sessions")
                .join(format!("{}.jsonl", run.session_id));
            let events = read_transcript_events(&path).await;
            for event in events {
                items.push(json!({
                    "runId": run.run_id,
                    "agentId": run.agent_id,
                    "initiativeId": run.initiative_id,
                    "taskId": run.task_id,
                    "event": event,
                }));
            }
        }
        json!({"items": items})
    }

    async fn merge_outbox_into_activity(&self, payload: Value, filter: &EntityFilter) -> Value {
        let Some(initiative_id) = &filter.initiative_id else {
            return payload;
        };
        let outbox_items = self.outbox.read_all(initiative_id).await;
        if outbox_items.is_empty() {
            return payload;
        }

        let mut items: Vec<Value> = payload
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut seen_ids: std::collections::HashSet<String> = items
            .iter()
            .filter_map(|v| v.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        for item in outbox_items.into_iter().rev() {
            if seen_ids.contains(&item.id) {
                continue;
            }
            seen_ids.insert(item.id.clone());
            items.push(outbox_item_to_value(item));
        }

        items.sort_by(|a, b| {
            let a_ts = a.get("timestamp").and_then(Value::as_str).unwrap_or_default();
            let b_ts = b.get("timestamp").and_then(Value::as_str).unwrap_or_default();
            b_ts.cmp(a_ts)
        });

        let mut out = payload;
        out["items"] = json!(items);
        out
    }
}

fn outbox_item_to_value(item: OutboxItem) -> Value {
    json!({
        "id": item.id,
        "type": item.item_type,
        "timestamp": item.timestamp,
        "payload": item.payload,
        "activityItem": item.activity_item,
    })
}

async fn read_transcript_events(path: &std::path::Path) -> Vec<Value> {
    let Ok(text) = tokio::fs::read_to_string(path).await else {
        return Vec::new();
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .collect()
}

/// Stamps the synthetic-success timestamp used by the write-path override
/// (kept as a standalone helper so tests can assert freshness without
/// constructing a full [`Mediator`]).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_cloud::FakeCloudClient;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("orgx-mediator-{label}-{}", uuid::Uuid::new_v4()))
    }

    async fn build_mediator() -> (Mediator, Arc<FakeCloudClient>) {
        let cloud = Arc::new(FakeCloudClient::new());
        let launch_contexts = Arc::new(LaunchContextStore::open(temp_dir("ctx").join("agent-contexts.json")).await);
        let outbox = Arc::new(Outbox::new(temp_dir("outbox")));
        let overrides = Arc::new(OverrideTable::new());
        let mediator = Mediator::new(
            cloud.clone(),
            launch_contexts,
            outbox,
            overrides,
            temp_dir("transcripts"),
        );
        (mediator, cloud)
    }

    #[tokio::test]
    async fn unauthorized_initiative_update_installs_override_and_reports_success() {
        let (mediator, cloud) = build_mediator().await;
        cloud.unauthorize_next().await;
        let result = mediator.update_initiative_status("init-1", "archived").await.unwrap();
        assert_eq!(result["localFallback"], json!(true));

        let entity = Entity::new();
        let mut entity = entity;
        entity.insert("id".to_string(), json!("init-1"));
        let overlaid = mediator.apply_initiative_override(entity).await;
        assert_eq!(overlaid["status"], json!("archived"));
    }

    #[tokio::test]
    async fn cloud_failure_falls_back_to_local_synthesis_with_degraded_marker() {
        let (mediator, cloud) = build_mediator().await;
        cloud.fail_next().await;
        let result = mediator
            .list_entities(EntityType::Agent, &EntityFilter::default())
            .await;
        assert!(result.degraded);
        assert!(result.local_fallback);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn cloud_failure_surfaces_override_as_synthetic_initiative_row() {
        let (mediator, cloud) = build_mediator().await;
        mediator.overrides.install("init-42", "archived").await;
        cloud.fail_next().await;

        let filter = EntityFilter {
            initiative_id: Some("init-42".to_string()),
            limit: None,
        };
        let result = mediator.list_entities(EntityType::Initiative, &filter).await;
        assert!(result.degraded);
        assert!(result.local_fallback);

        let rows = result.payload.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("init-42"));
        assert_eq!(rows[0]["status"], json!("archived"));
        assert_eq!(rows[0]["localFallback"], json!(true));
    }

    #[tokio::test]
    async fn outbox_entries_are_merged_into_activity_and_deduped() {
        let (mediator, _cloud) = build_mediator().await;
        let filter = EntityFilter {
            initiative_id: Some("init-1".to_string()),
            limit: None,
        };
        let item = OutboxItem {
            id: "act-1".to_string(),
            item_type: "activity".to_string(),
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            payload: json!({"msg": "hi"}),
            activity_item: None,
        };
        mediator.outbox.append("init-1", &item).await;
        let result = mediator.list_activity(&filter).await;
        let items = result.payload["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], json!("act-1"));
    }

}
