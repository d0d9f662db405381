//! `Dispatch(task)` (§4.5): the sequence that turns a ready graph node into
//! a running detached agent process. Ties together execution-policy
//! derivation, the cloud-plane spawn guard, prompt construction, process
//! supervision, and the local launch-context/outbox records.

use orgx_cloud::{CloudClient, CloudError};
use orgx_local::{LaunchContextStore, Outbox, RunContext};
use orgx_types::{AgentLaunchContext, EntityType, MissionControlNode, OutboxItem, StatusClass};
use serde_json::json;
use uuid::Uuid;

use crate::policy;
use crate::process;
use crate::prompt;
use crate::spawn_guard::{self, SpawnGuardOutcome};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("failed to spawn agent runtime process: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct DispatchRequest<'a> {
    pub task: &'a MissionControlNode,
    pub workstream: Option<&'a MissionControlNode>,
    pub initiative: &'a MissionControlNode,
    pub agent_id: String,
    pub model: Option<String>,
    pub base_message: String,
    pub program: String,
    pub program_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Launched {
        session_id: String,
        pid: u32,
        domain: &'static str,
        required_skill: String,
    },
    UpgradeRequired,
    HardBlocked {
        reason: String,
    },
    RateLimited {
        reason: String,
    },
}

/// Executes §4.5 steps 1-6. Returns `Ok` for every outcome short of a
/// transport/validation failure against the cloud plane, which the caller
/// maps to a 4xx/5xx response per §7.
pub async fn dispatch(
    cloud: &dyn CloudClient,
    launch_contexts: &LaunchContextStore,
    outbox: &Outbox,
    req: DispatchRequest<'_>,
) -> Result<DispatchOutcome, DispatchError> {
    if !policy::is_valid_agent_id(&req.agent_id) {
        return Err(DispatchError::InvalidAgentId(req.agent_id));
    }

    // Step 1: execution policy.
    let domain = policy::derive_domain(req.task, req.workstream, req.initiative);
    let required_skill = policy::required_skill(domain);

    // Billing gate.
    if let Some(model) = &req.model {
        if policy::implies_byok(model) && cloud.billing_plan().await? == orgx_cloud::BillingPlan::Free {
            return Ok(DispatchOutcome::UpgradeRequired);
        }
    }

    // Step 2: spawn guard.
    let guard_result = cloud.check_spawn_guard(domain, &req.task.id).await;
    let tier = guard_result.as_ref().ok().and_then(|g| g.tier.clone());
    match spawn_guard::evaluate(guard_result) {
        SpawnGuardOutcome::HardBlock { reason } => {
            cloud
                .update_entity_status(EntityType::Task, &req.task.id, "blocked")
                .await?;
            sync_rollups(cloud, req.task, req.workstream).await?;
            cloud
                .request_decision(&format!("Unblock {}", req.task.title), json!({"taskId": req.task.id}))
                .await?;
            emit_or_outbox(
                cloud,
                outbox,
                &req.initiative.id,
                json!({"type": "blocked", "taskId": req.task.id, "reason": reason}),
            )
            .await;
            return Ok(DispatchOutcome::HardBlocked { reason });
        }
        SpawnGuardOutcome::RateLimited { reason } => {
            emit_or_outbox(
                cloud,
                outbox,
                &req.initiative.id,
                json!({"type": "blocked", "level": "warn", "taskId": req.task.id, "reason": reason}),
            )
            .await;
            return Ok(DispatchOutcome::RateLimited { reason });
        }
        SpawnGuardOutcome::Proceed { degraded } => {
            if degraded {
                tracing::warn!(task_id = %req.task.id, "spawn guard check failed, proceeding degraded");
            }
        }
    }

    // Step 3: prompt.
    let prompt_text = prompt::build_prompt(domain, &required_skill, tier.as_deref(), &req.base_message);

    // Step 4: launch.
    let session_id = Uuid::new_v4().to_string();
    cloud
        .update_entity_status(EntityType::Initiative, &req.initiative.id, "active")
        .await?;
    cloud
        .update_entity_status(EntityType::Task, &req.task.id, "in_progress")
        .await?;
    if let Some(workstream) = req.workstream {
        if !StatusClass::is_in_progress_like(&workstream.status) {
            cloud
                .update_entity_status(EntityType::Workstream, &workstream.id, "active")
                .await?;
        }
    }

    // stdin is closed on a detached process (§5), so the prompt travels as
    // the final CLI argument, the way a locally-invoked agent runtime takes
    // its instruction.
    let mut program_args = req.program_args.clone();
    program_args.push(prompt_text);
    let child = process::spawn_detached(&req.program, &program_args)?;
    let pid = child.id().unwrap_or(0);
    drop(child); // detached: lifetime is not bound to this process (§5).

    let run_id = Uuid::new_v4().to_string();
    launch_contexts
        .record_run(RunContext {
            run_id: run_id.clone(),
            agent_id: req.agent_id.clone(),
            session_id: session_id.clone(),
            initiative_id: Some(req.initiative.id.clone()),
            task_id: Some(req.task.id.clone()),
            pid,
            updated_at: now_rfc3339(),
        })
        .await;
    launch_contexts
        .record_agent(AgentLaunchContext {
            agent_id: req.agent_id.clone(),
            run_id: run_id.clone(),
            session_id: session_id.clone(),
            initiative_id: Some(req.initiative.id.clone()),
            workstream_id: req.workstream.map(|w| w.id.clone()),
            task_id: Some(req.task.id.clone()),
            domain: domain.to_string(),
            required_skills: vec![required_skill.clone()],
            updated_at: now_rfc3339(),
        })
        .await;

    // Step 5: execution-started activity, outbox fallback on failure.
    emit_or_outbox(
        cloud,
        outbox,
        &req.initiative.id,
        json!({
            "type": "execution_started",
            "taskId": req.task.id,
            "agentId": req.agent_id,
            "runId": run_id,
            "sessionId": session_id,
        }),
    )
    .await;

    // Step 6: rollups.
    sync_rollups(cloud, req.task, req.workstream).await?;

    Ok(DispatchOutcome::Launched {
        session_id,
        pid,
        domain,
        required_skill,
    })
}

async fn emit_or_outbox(cloud: &dyn CloudClient, outbox: &Outbox, initiative_id: &str, event: serde_json::Value) {
    if cloud.emit_activity(event.clone()).await.is_err() {
        let item = OutboxItem {
            id: Uuid::new_v4().to_string(),
            item_type: "activity".to_string(),
            timestamp: now_rfc3339(),
            payload: event,
            activity_item: None,
        };
        outbox.append(initiative_id, &item).await;
    }
}

/// Recomputes milestone/workstream rollup status from a task's own status
/// (§4.5 step 6). Milestone rollups go through a changeset keyed by task id
/// so a retried tick doesn't double-apply; workstream rollups are a direct
/// status update.
async fn sync_rollups(
    cloud: &dyn CloudClient,
    task: &MissionControlNode,
    workstream: Option<&MissionControlNode>,
) -> Result<(), CloudError> {
    if let Some(milestone_id) = &task.milestone_id {
        let idempotency_key = format!("rollup-{milestone_id}-{}", task.id);
        cloud
            .apply_changeset(
                EntityType::Milestone,
                milestone_id,
                json!({"status": "active"}),
                &idempotency_key,
            )
            .await?;
    }
    if let Some(workstream) = workstream {
        if !StatusClass::is_in_progress_like(&workstream.status) {
            cloud
                .update_entity_status(EntityType::Workstream, &workstream.id, "active")
                .await?;
        }
    }
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_cloud::FakeCloudClient;
    use orgx_types::EntityType as ET;

    fn node(id: &str, status: &str) -> MissionControlNode {
        MissionControlNode {
            id: id.to_string(),
            node_type: ET::Task,
            title: "Write the docs".to_string(),
            status: status.to_string(),
            parent_id: None,
            initiative_id: Some("init-1".to_string()),
            workstream_id: Some("ws-1".to_string()),
            milestone_id: None,
            priority_num: 50,
            priority_label: "medium".to_string(),
            dependency_ids: vec![],
            due_date: None,
            eta_end_at: None,
            expected_duration_hours: 2.0,
            expected_budget_usd: 0.0,
            assigned_agents: vec![],
            updated_at: None,
        }
    }

    async fn harness() -> (FakeCloudClient, LaunchContextStore, Outbox) {
        let cloud = FakeCloudClient::new();
        let launch_contexts = LaunchContextStore::open(
            std::env::temp_dir().join(format!("orgx-dispatch-ctx-{}.json", Uuid::new_v4())),
        )
        .await;
        let outbox = Outbox::new(std::env::temp_dir().join(format!("orgx-dispatch-outbox-{}", Uuid::new_v4())));
        (cloud, launch_contexts, outbox)
    }

    #[tokio::test]
    async fn invalid_agent_id_is_rejected_before_any_cloud_call() {
        let (cloud, launch_contexts, outbox) = harness().await;
        let task = node("task-1", "todo");
        let initiative = node("init-1", "active");
        let req = DispatchRequest {
            task: &task,
            workstream: None,
            initiative: &initiative,
            agent_id: "bad id with spaces".to_string(),
            model: None,
            base_message: "go".to_string(),
            program: "true".to_string(),
            program_args: vec![],
        };
        let err = dispatch(&cloud, &launch_contexts, &outbox, req).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidAgentId(_)));
    }

    #[tokio::test]
    async fn hard_block_marks_task_blocked_and_does_not_launch() {
        let (cloud, launch_contexts, outbox) = harness().await;
        cloud
            .set_spawn_guard(orgx_cloud::SpawnGuardResult {
                allowed: false,
                checks: orgx_cloud::SpawnGuardChecks {
                    rate_limit: orgx_cloud::RateLimitCheck { passed: true },
                },
                blocked_reason: Some("policy".to_string()),
                tier: None,
            })
            .await;
        cloud
            .seed_entities(EntityType::Task, vec![json!({"id": "task-1", "status": "todo"}).as_object().unwrap().clone()])
            .await;
        let task = node("task-1", "todo");
        let initiative = node("init-1", "active");
        let req = DispatchRequest {
            task: &task,
            workstream: None,
            initiative: &initiative,
            agent_id: "agent-1".to_string(),
            model: None,
            base_message: "go".to_string(),
            program: "true".to_string(),
            program_args: vec![],
        };
        let outcome = dispatch(&cloud, &launch_contexts, &outbox, req).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::HardBlocked { .. }));
    }

    #[tokio::test]
    async fn byok_model_on_free_plan_requires_upgrade() {
        let (cloud, launch_contexts, outbox) = harness().await;
        cloud.set_billing_plan(orgx_cloud::BillingPlan::Free).await;
        let task = node("task-1", "todo");
        let initiative = node("init-1", "active");
        let req = DispatchRequest {
            task: &task,
            workstream: None,
            initiative: &initiative,
            agent_id: "agent-1".to_string(),
            model: Some("anthropic/claude".to_string()),
            base_message: "go".to_string(),
            program: "true".to_string(),
            program_args: vec![],
        };
        let outcome = dispatch(&cloud, &launch_contexts, &outbox, req).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::UpgradeRequired));
    }

    #[tokio::test]
    async fn built_prompt_is_passed_to_the_spawned_process() {
        let (cloud, launch_contexts, outbox) = harness().await;
        let task = node("task-1", "todo");
        let initiative = node("init-1", "active");
        let capture_path = std::env::temp_dir().join(format!("orgx-dispatch-prompt-{}.txt", Uuid::new_v4()));
        let req = DispatchRequest {
            task: &task,
            workstream: None,
            initiative: &initiative,
            agent_id: "agent-1".to_string(),
            model: None,
            base_message: "Ship the release notes".to_string(),
            program: "sh".to_string(),
            program_args: vec![
                "-c".to_string(),
                format!("printf '%s' \"$1\" > {}", capture_path.display()),
                "sh".to_string(),
            ],
        };
        let outcome = dispatch(&cloud, &launch_contexts, &outbox, req).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Launched { .. }));

        // The detached child writes asynchronously; give it a moment.
        let mut captured = String::new();
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            if let Ok(text) = tokio::fs::read_to_string(&capture_path).await {
                if !text.is_empty() {
                    captured = text;
                    break;
                }
            }
        }
        let _ = tokio::fs::remove_file(&capture_path).await;

        assert!(captured.contains("Ship the release notes"), "captured: {captured:?}");
        assert!(captured.contains("Execution policy:"));
    }

    #[tokio::test]
    async fn clean_dispatch_launches_and_records_context() {
        let (cloud, launch_contexts, outbox) = harness().await;
        let task = node("task-1", "todo");
        let initiative = node("init-1", "active");
        let req = DispatchRequest {
            task: &task,
            workstream: None,
            initiative: &initiative,
            agent_id: "agent-1".to_string(),
            model: None,
            base_message: "go".to_string(),
            program: "true".to_string(),
            program_args: vec![],
        };
        let outcome = dispatch(&cloud, &launch_contexts, &outbox, req).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Launched { .. }));
        assert!(launch_contexts.agent("agent-1").await.is_some());
        assert_eq!(cloud.emitted_activity().await.len(), 1);
    }
}
