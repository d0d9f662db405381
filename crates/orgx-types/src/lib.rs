//! Shared domain types for the OrgX local control plane.
//!
//! Everything here is a plain data type with `serde` derives; no I/O, no
//! business logic. Field names follow the bit-exact JSON contract in the
//! spec (`camelCase`, with a handful of explicit renames for acronyms).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A loosely-typed record from the cloud plane, identified by `id` and
/// `type`. Field encodings are heterogeneous (snake_case and camelCase both
/// carry meaning); see `orgx-normalize` for tolerant extraction.
pub type Entity = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Initiative,
    Workstream,
    Milestone,
    Task,
    Decision,
    Artifact,
    Agent,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Initiative => "initiative",
            EntityType::Workstream => "workstream",
            EntityType::Milestone => "milestone",
            EntityType::Task => "task",
            EntityType::Decision => "decision",
            EntityType::Artifact => "artifact",
            EntityType::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Normalized projection of one entity, produced by the Entity Normalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionControlNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: EntityType,
    pub title: String,
    /// Lowercase status string. Canonical subsets are checked via
    /// `StatusClass` helpers rather than encoded in the type.
    pub status: String,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "initiativeId", skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    #[serde(rename = "workstreamId", skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    #[serde(rename = "milestoneId", skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    #[serde(rename = "priorityNum")]
    pub priority_num: u32,
    #[serde(rename = "priorityLabel")]
    pub priority_label: String,
    #[serde(rename = "dependencyIds")]
    pub dependency_ids: Vec<String>,
    #[serde(rename = "dueDate", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(rename = "etaEndAt", skip_serializing_if = "Option::is_none")]
    pub eta_end_at: Option<String>,
    #[serde(rename = "expectedDurationHours")]
    pub expected_duration_hours: f64,
    #[serde(rename = "expectedBudgetUsd")]
    pub expected_budget_usd: f64,
    #[serde(rename = "assignedAgents")]
    pub assigned_agents: Vec<AssignedAgent>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Coarse status classification used by graph/ranker logic. Never
/// serialized directly; derived from `MissionControlNode::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Todo,
    InProgress,
    Done,
    Blocked,
    Paused,
    Other,
}

impl StatusClass {
    pub fn classify(status: &str) -> Self {
        let lowered = status.to_ascii_lowercase();
        match lowered.as_str() {
            "todo" | "backlog" | "open" | "not_started" | "pending" => StatusClass::Todo,
            "in_progress" | "in-progress" | "active" | "doing" | "running" => {
                StatusClass::InProgress
            }
            "done" | "complete" | "completed" | "closed" | "shipped" => StatusClass::Done,
            "blocked" => StatusClass::Blocked,
            "paused" => StatusClass::Paused,
            _ => StatusClass::Other,
        }
    }

    pub fn is_done_like(status: &str) -> bool {
        matches!(Self::classify(status), StatusClass::Done)
    }

    pub fn is_todo_like(status: &str) -> bool {
        matches!(Self::classify(status), StatusClass::Todo)
    }

    pub fn is_in_progress_like(status: &str) -> bool {
        matches!(Self::classify(status), StatusClass::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionControlGraph {
    pub initiative: MissionControlNode,
    pub nodes: Vec<MissionControlNode>,
    pub edges: Vec<GraphEdge>,
    #[serde(rename = "recentTodos")]
    pub recent_todos: Vec<String>,
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoContinueStatus {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    Blocked,
    Completed,
    Stopped,
    Error,
}

/// Per-initiative auto-continue state. Owned exclusively by the scheduler's
/// tick for that initiative; see `orgx-scheduler`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoContinueRun {
    #[serde(rename = "initiativeId")]
    pub initiative_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "includeVerification")]
    pub include_verification: bool,
    #[serde(
        rename = "allowedWorkstreamIds",
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_workstream_ids: Option<Vec<String>>,
    #[serde(rename = "tokenBudget")]
    pub token_budget: u64,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: u64,
    pub status: AutoContinueStatus,
    #[serde(rename = "stopReason", skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(rename = "stopRequested")]
    pub stop_requested: bool,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "stoppedAt", skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "lastTaskId", skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<String>,
    #[serde(rename = "lastRunId", skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    #[serde(rename = "activeTaskId", skip_serializing_if = "Option::is_none")]
    pub active_task_id: Option<String>,
    #[serde(rename = "activeRunId", skip_serializing_if = "Option::is_none")]
    pub active_run_id: Option<String>,
    #[serde(rename = "activeTaskTokenEstimate", skip_serializing_if = "Option::is_none")]
    pub active_task_token_estimate: Option<u64>,
}

impl AutoContinueRun {
    /// Invariant A1: at most one (activeTaskId, activeRunId) pair may be
    /// non-nil at a time.
    pub fn has_active_task(&self) -> bool {
        self.active_task_id.is_some() || self.active_run_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeInstanceState {
    Running,
    Idle,
    Stale,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInstance {
    pub key: String,
    pub state: RuntimeInstanceState,
    #[serde(rename = "sourceClient")]
    pub source_client: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "initiativeId", skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    #[serde(rename = "workstreamId", skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "agentId", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(rename = "progressPct", skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f64>,
    #[serde(rename = "lastHeartbeatAt")]
    pub last_heartbeat_at: i64,
    #[serde(rename = "lastEventAt")]
    pub last_event_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The five-tuple used to suppress no-op SSE updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeFingerprint {
    pub state: String,
    pub last_heartbeat_at: i64,
    pub last_event_at: i64,
    pub progress_pct_bits: Option<u64>,
    pub phase: Option<String>,
}

impl RuntimeInstance {
    pub fn fingerprint(&self) -> RuntimeFingerprint {
        RuntimeFingerprint {
            state: format!("{:?}", self.state),
            last_heartbeat_at: self.last_heartbeat_at,
            last_event_at: self.last_event_at,
            progress_pct_bits: self.progress_pct.map(|p| p.to_bits()),
            phase: self.phase.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Running,
    Queued,
    Blocked,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextUpQueueItem {
    #[serde(rename = "initiativeId")]
    pub initiative_id: String,
    #[serde(rename = "initiativeTitle")]
    pub initiative_title: String,
    #[serde(rename = "workstreamId")]
    pub workstream_id: String,
    #[serde(rename = "workstreamTitle")]
    pub workstream_title: String,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "queueState")]
    pub queue_state: QueueState,
    #[serde(rename = "blockReason", skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(rename = "runnerAgentId")]
    pub runner_agent_id: String,
    #[serde(rename = "runnerSource")]
    pub runner_source: String,
    #[serde(rename = "pinnedRank", skip_serializing_if = "Option::is_none")]
    pub pinned_rank: Option<u32>,
    #[serde(rename = "priorityNum")]
    pub priority_num: u32,
    #[serde(rename = "dueDate", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    #[serde(rename = "initiativeId")]
    pub initiative_id: String,
    #[serde(rename = "workstreamId")]
    pub workstream_id: String,
    #[serde(rename = "preferredTaskId", skip_serializing_if = "Option::is_none")]
    pub preferred_task_id: Option<String>,
    #[serde(
        rename = "preferredMilestoneId",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_milestone_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub timestamp: String,
    pub payload: Value,
    #[serde(rename = "activityItem", skip_serializing_if = "Option::is_none")]
    pub activity_item: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalInitiativeStatusOverride {
    pub status: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

pub type LocalInitiativeOverrides = HashMap<String, LocalInitiativeStatusOverride>;

/// Context recorded at agent-launch time; consulted by the local fallback
/// mediator to enrich session/activity reads when the cloud is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLaunchContext {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "initiativeId", skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    #[serde(rename = "workstreamId", skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub domain: String,
    #[serde(rename = "requiredSkills")]
    pub required_skills: Vec<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_class_handles_canonical_subsets() {
        assert!(StatusClass::is_done_like("Done"));
        assert!(StatusClass::is_todo_like("TODO"));
        assert!(StatusClass::is_in_progress_like("in_progress"));
        assert!(matches!(
            StatusClass::classify("blocked"),
            StatusClass::Blocked
        ));
    }

    #[test]
    fn auto_continue_run_active_task_invariant_helper() {
        let mut run = sample_run();
        assert!(!run.has_active_task());
        run.active_run_id = Some("run-1".to_string());
        assert!(run.has_active_task());
    }

    fn sample_run() -> AutoContinueRun {
        AutoContinueRun {
            initiative_id: "init-1".to_string(),
            agent_id: "agent-1".to_string(),
            include_verification: false,
            allowed_workstream_ids: None,
            token_budget: 10_000,
            tokens_used: 0,
            status: AutoContinueStatus::Running,
            stop_reason: None,
            stop_requested: false,
            started_at: "2025-01-01T00:00:00Z".to_string(),
            stopped_at: None,
            updated_at: "2025-01-01T00:00:00Z".to_string(),
            last_error: None,
            last_task_id: None,
            last_run_id: None,
            active_task_id: None,
            active_run_id: None,
            active_task_token_estimate: None,
        }
    }
}
