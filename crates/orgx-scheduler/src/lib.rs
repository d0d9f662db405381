//! Auto-Continue Scheduler (§4.6): a per-initiative state machine
//! (`running -> stopping -> stopped`) advanced by a single process-wide
//! tick loop, grounded on the teacher's `run_routine_scheduler` background
//! task shape (`tandem-server/src/lib.rs`) generalized from per-routine
//! misfire state to per-initiative run state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orgx_cloud::CloudClient;
use orgx_graph::BudgetConstants;
use orgx_local::{LaunchContextStore, Outbox};
use orgx_runtime::{self, DispatchOutcome, DispatchRequest};
use orgx_types::{
    AutoContinueRun, AutoContinueStatus, EntityType, MissionControlGraph, MissionControlNode, StatusClass,
    StopReason,
};
use tokio::sync::{Mutex, RwLock};

pub const TICK_INTERVAL: Duration = Duration::from_millis(2500);

fn node_by_id<'a>(graph: &'a MissionControlGraph, id: &str) -> Option<&'a MissionControlNode> {
    graph.nodes.iter().find(|n| n.id == id)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub struct SchedulerConfig {
    pub program: String,
    pub program_args: Vec<String>,
    pub transcripts_dir: PathBuf,
    pub budget: BudgetConstants,
}

/// Owns the whole AutoContinueRun table (§5 "single mutex guarding the
/// map") plus a per-initiative tick mutex so two ticks never overlap for
/// the same initiative.
pub struct Scheduler {
    runs: RwLock<HashMap<String, AutoContinueRun>>,
    tick_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    cloud: Arc<dyn CloudClient>,
    launch_contexts: Arc<LaunchContextStore>,
    outbox: Arc<Outbox>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        launch_contexts: Arc<LaunchContextStore>,
        outbox: Arc<Outbox>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            tick_locks: RwLock::new(HashMap::new()),
            cloud,
            launch_contexts,
            outbox,
            config,
        }
    }

    pub async fn status(&self, initiative_id: &str) -> Option<AutoContinueRun> {
        self.runs.read().await.get(initiative_id).cloned()
    }

    /// `Start(initiative, agent, budget, includeVerification, workstreams?)`.
    pub async fn start(
        &self,
        initiative_id: &str,
        agent_id: String,
        token_budget: u64,
        include_verification: bool,
        allowed_workstream_ids: Option<Vec<String>>,
    ) -> Result<AutoContinueRun, orgx_cloud::CloudError> {
        self.cloud
            .update_entity_status(EntityType::Initiative, initiative_id, "active")
            .await?;
        let now = now_rfc3339();
        let run = AutoContinueRun {
            initiative_id: initiative_id.to_string(),
            agent_id,
            include_verification,
            allowed_workstream_ids,
            token_budget,
            tokens_used: 0,
            status: AutoContinueStatus::Running,
            stop_reason: None,
            stop_requested: false,
            started_at: now.clone(),
            stopped_at: None,
            updated_at: now,
            last_error: None,
            last_task_id: None,
            last_run_id: None,
            active_task_id: None,
            active_run_id: None,
            active_task_token_estimate: None,
        };
        self.runs.write().await.insert(initiative_id.to_string(), run.clone());
        Ok(run)
    }

    /// `Stop`: request stop; transitions to `stopped` immediately if there
    /// is no active task, else waits for the active run's child to exit.
    pub async fn stop(&self, initiative_id: &str) -> Option<AutoContinueRun> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(initiative_id)?;
        run.stop_requested = true;
        if !run.has_active_task() {
            finalize_stop(run, StopReason::Stopped);
        } else {
            run.status = AutoContinueStatus::Stopping;
        }
        run.updated_at = now_rfc3339();
        Some(run.clone())
    }

    async fn tick_lock_for(&self, initiative_id: &str) -> Arc<Mutex<()>> {
        let exists = self.tick_locks.read().await.get(initiative_id).cloned();
        if let Some(lock) = exists {
            return lock;
        }
        self.tick_locks
            .write()
            .await
            .entry(initiative_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs one tick for `initiative_id`, holding its tick mutex for the
    /// whole call (§5). No-op if there is no run registered or it is
    /// already `stopped`.
    pub async fn tick_once(&self, initiative_id: &str, graph: &MissionControlGraph) {
        let lock = self.tick_lock_for(initiative_id).await;
        let _guard = lock.lock().await;

        let should_run = matches!(
            self.runs.read().await.get(initiative_id).map(|r| r.status),
            Some(AutoContinueStatus::Running) | Some(AutoContinueStatus::Stopping)
        );
        if !should_run {
            return;
        }

        if let Err(err) = self.tick_inner(initiative_id, graph).await {
            let mut runs = self.runs.write().await;
            if let Some(run) = runs.get_mut(initiative_id) {
                finalize_stop(run, StopReason::Error);
                run.last_error = Some(err.to_string());
                run.updated_at = now_rfc3339();
            }
        }
    }

    async fn tick_inner(&self, initiative_id: &str, graph: &MissionControlGraph) -> Result<(), orgx_cloud::CloudError> {
        // Step 1: poll the active run, if any.
        let active_run_id = self.runs.read().await.get(initiative_id).and_then(|r| r.active_run_id.clone());
        if let Some(run_id) = active_run_id {
            let Some(run_context) = self.launch_contexts.run(&run_id).await else {
                return Ok(());
            };
            if orgx_runtime::is_pid_alive(run_context.pid as i32) {
                return Ok(());
            }
            let session_path = orgx_runtime::transcript_path(
                &self.config.transcripts_dir,
                &run_context.agent_id,
                &run_context.session_id,
            )
            .ok();
            let summary = session_path
                .map(|p| orgx_runtime::summarize_transcript_file(&p))
                .unwrap_or_default();

            let mut runs = self.runs.write().await;
            let run = runs.get_mut(initiative_id).expect("run exists, checked by caller");
            let pre_estimate = run.active_task_token_estimate.unwrap_or(0);
            run.tokens_used += summary.tokens.max(pre_estimate);

            if let Some(task_id) = run.active_task_id.clone() {
                let new_status = if summary.had_error { "blocked" } else { "done" };
                drop(runs);
                self.cloud.update_entity_status(EntityType::Task, &task_id, new_status).await?;
                let event = serde_json::json!({
                    "type": if summary.had_error { "blocked" } else { "completed" },
                    "taskId": task_id,
                    "initiativeId": initiative_id,
                });
                if self.cloud.emit_activity(event.clone()).await.is_err() {
                    self.outbox
                        .append(
                            initiative_id,
                            &orgx_types::OutboxItem {
                                id: uuid::Uuid::new_v4().to_string(),
                                item_type: "activity".to_string(),
                                timestamp: now_rfc3339(),
                                payload: event,
                                activity_item: None,
                            },
                        )
                        .await;
                }
                if summary.had_error {
                    self.cloud
                        .request_decision(&format!("Unblock {task_id}"), serde_json::json!({"taskId": task_id}))
                        .await?;
                }
                runs = self.runs.write().await;
                let run = runs.get_mut(initiative_id).expect("run exists");
                run.last_task_id = Some(task_id);
            }

            let run = runs.get_mut(initiative_id).expect("run exists");
            run.last_run_id = Some(run_id);
            run.active_run_id = None;
            run.active_task_id = None;
            run.active_task_token_estimate = None;
            run.updated_at = now_rfc3339();
            if run.stop_requested {
                finalize_stop(run, StopReason::Stopped);
                return Ok(());
            }
        }

        let mut runs = self.runs.write().await;
        let run = runs.get_mut(initiative_id).expect("run exists, checked by caller");

        // Step 2: stop request with no active task.
        if run.stop_requested {
            finalize_stop(run, StopReason::Stopped);
            return Ok(());
        }

        // Step 3: budget guard.
        if run.tokens_used >= run.token_budget {
            finalize_stop(run, StopReason::BudgetExhausted);
            return Ok(());
        }

        // Step 4: no todo tasks left.
        let has_todo = graph
            .recent_todos
            .iter()
            .filter_map(|id| node_by_id(graph, id))
            .any(|n| StatusClass::is_todo_like(&n.status));
        if !has_todo {
            finalize_stop(run, StopReason::Completed);
            return Ok(());
        }

        // Step 5: select the next task.
        let allowed = run.allowed_workstream_ids.clone();
        let include_verification = run.include_verification;
        let Some(task) = select_next_task(graph, allowed.as_deref(), include_verification) else {
            finalize_stop(run, StopReason::Blocked);
            return Ok(());
        };

        // Step 6: pre-estimate tokens.
        let estimate = (task.expected_duration_hours * self.config.budget.tokens_per_hour * self.config.budget.contingency).round() as u64;
        if run.tokens_used + estimate > run.token_budget {
            finalize_stop(run, StopReason::BudgetExhausted);
            return Ok(());
        }

        let task = task.clone();
        let workstream = task.workstream_id.as_deref().and_then(|id| node_by_id(graph, id)).cloned();
        let initiative = graph.initiative.clone();
        let agent_id = run.agent_id.clone();
        drop(runs);

        // Step 7: dispatch.
        let outcome = orgx_runtime::dispatch(
            self.cloud.as_ref(),
            &self.launch_contexts,
            &self.outbox,
            DispatchRequest {
                task: &task,
                workstream: workstream.as_ref(),
                initiative: &initiative,
                agent_id,
                model: None,
                base_message: format!("Continue work on: {}", task.title),
                program: self.config.program.clone(),
                program_args: self.config.program_args.clone(),
            },
        )
        .await
        .map_err(|err| orgx_cloud::CloudError::Other(err.to_string()))?;

        let mut runs = self.runs.write().await;
        let run = runs.get_mut(initiative_id).expect("run exists");
        if let DispatchOutcome::Launched { session_id, .. } = outcome {
            let _ = session_id;
            run.active_task_id = Some(task.id.clone());
            run.active_task_token_estimate = Some(estimate);
            // The dispatch engine records its own run id in the launch
            // context store; the scheduler tracks it by the most recent
            // entry for this agent.
            if let Some(context) = self.launch_contexts.agent(&run.agent_id).await {
                run.active_run_id = Some(context.run_id);
            }
        }
        run.updated_at = now_rfc3339();
        Ok(())
    }
}

fn finalize_stop(run: &mut AutoContinueRun, reason: StopReason) {
    run.status = AutoContinueStatus::Stopped;
    run.stop_reason = Some(reason);
    run.stopped_at = Some(now_rfc3339());
}

/// §4.6 step 5 selection predicate: todo-like, honors verification/
/// workstream-allowlist filters, ready (deps done-like), workstream
/// dispatchable, and no blocked parent.
fn select_next_task<'a>(
    graph: &'a MissionControlGraph,
    allowed_workstream_ids: Option<&[String]>,
    include_verification: bool,
) -> Option<&'a MissionControlNode> {
    graph.recent_todos.iter().filter_map(|id| node_by_id(graph, id)).find(|task| {
        if !StatusClass::is_todo_like(&task.status) {
            return false;
        }
        if !include_verification && task.title.starts_with("Verification scenario") {
            return false;
        }
        if let Some(allowed) = allowed_workstream_ids {
            if !task.workstream_id.as_deref().map(|id| allowed.iter().any(|a| a == id)).unwrap_or(false) {
                return false;
            }
        }
        if let Some(workstream) = task.workstream_id.as_deref().and_then(|id| node_by_id(graph, id)) {
            if StatusClass::classify(&workstream.status) == orgx_types::StatusClass::Blocked {
                return false;
            }
        }
        let deps_done = task
            .dependency_ids
            .iter()
            .all(|dep_id| node_by_id(graph, dep_id).map(|d| StatusClass::is_done_like(&d.status)).unwrap_or(true));
        if !deps_done {
            return false;
        }
        if let Some(parent_id) = &task.parent_id {
            if let Some(parent) = node_by_id(graph, parent_id) {
                if StatusClass::classify(&parent.status) == orgx_types::StatusClass::Blocked {
                    return false;
                }
            }
        }
        true
    })
}

/// The process-wide tick timer (§5 "one timer for the auto-continue
/// tick"). Ticks every initiative that currently has a run registered.
pub async fn run_tick_loop<F, Fut>(scheduler: Arc<Scheduler>, graph_for: F)
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = Option<MissionControlGraph>>,
{
    loop {
        tokio::time::sleep(TICK_INTERVAL).await;
        let initiative_ids: Vec<String> = scheduler.runs.read().await.keys().cloned().collect();
        for initiative_id in initiative_ids {
            if let Some(graph) = graph_for(initiative_id.clone()).await {
                scheduler.tick_once(&initiative_id, &graph).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_types::{EntityType as ET, GraphEdge};

    fn task(id: &str, status: &str, deps: Vec<String>) -> MissionControlNode {
        MissionControlNode {
            id: id.to_string(),
            node_type: ET::Task,
            title: "Some task".to_string(),
            status: status.to_string(),
            parent_id: None,
            initiative_id: Some("init-1".to_string()),
            workstream_id: None,
            milestone_id: None,
            priority_num: 50,
            priority_label: "medium".to_string(),
            dependency_ids: deps,
            due_date: None,
            eta_end_at: None,
            expected_duration_hours: 2.0,
            expected_budget_usd: 0.0,
            assigned_agents: vec![],
            updated_at: None,
        }
    }

    #[test]
    fn select_next_task_skips_blocked_deps_and_verification_tasks() {
        let initiative = task("init-1", "active", vec![]);
        let done_dep = task("dep-1", "done", vec![]);
        let blocked_candidate = task("t1", "todo", vec!["missing-dep".to_string()]);
        let verification = {
            let mut t = task("t2", "todo", vec![]);
            t.title = "Verification scenario: smoke test".to_string();
            t
        };
        let ready = task("t3", "todo", vec!["dep-1".to_string()]);

        let graph = MissionControlGraph {
            initiative: initiative.clone(),
            nodes: vec![initiative, done_dep, blocked_candidate, verification, ready.clone()],
            edges: vec![GraphEdge {
                from: "dep-1".to_string(),
                to: "t3".to_string(),
            }],
            recent_todos: vec!["t1".to_string(), "t2".to_string(), "t3".to_string()],
            degraded: vec![],
        };

        let selected = select_next_task(&graph, None, false).unwrap();
        assert_eq!(selected.id, "t3");
        let _ = ready;
    }

    async fn build_scheduler() -> Scheduler {
        let cloud: Arc<dyn CloudClient> = Arc::new(orgx_cloud::FakeCloudClient::new());
        let launch_contexts = Arc::new(
            LaunchContextStore::open(std::env::temp_dir().join(format!("orgx-sched-ctx-{}.json", uuid::Uuid::new_v4())))
                .await,
        );
        let outbox = Arc::new(Outbox::new(
            std::env::temp_dir().join(format!("orgx-sched-outbox-{}", uuid::Uuid::new_v4())),
        ));
        Scheduler::new(
            cloud,
            launch_contexts,
            outbox,
            SchedulerConfig {
                program: "true".to_string(),
                program_args: vec![],
                transcripts_dir: std::env::temp_dir(),
                budget: BudgetConstants::test_default(),
            },
        )
    }

    #[tokio::test]
    async fn stop_with_no_active_task_transitions_immediately_to_stopped() {
        let scheduler = build_scheduler().await;
        scheduler.start("init-1", "agent-1".to_string(), 1000, false, None).await.unwrap();
        let run = scheduler.stop("init-1").await.unwrap();
        assert_eq!(run.status, AutoContinueStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::Stopped));
    }

    #[tokio::test]
    async fn tick_stops_with_completed_when_no_todo_tasks_remain() {
        let scheduler = build_scheduler().await;
        scheduler.start("init-1", "agent-1".to_string(), 1000, false, None).await.unwrap();
        let initiative = task("init-1", "active", vec![]);
        let done_task = task("t1", "done", vec![]);
        let graph = MissionControlGraph {
            initiative: initiative.clone(),
            nodes: vec![initiative, done_task],
            edges: vec![],
            recent_todos: vec!["t1".to_string()],
            degraded: vec![],
        };
        scheduler.tick_once("init-1", &graph).await;
        let run = scheduler.status("init-1").await.unwrap();
        assert_eq!(run.status, AutoContinueStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::Completed));
    }

    #[tokio::test]
    async fn tick_stops_with_blocked_when_no_task_is_selectable() {
        let scheduler = build_scheduler().await;
        scheduler.start("init-1", "agent-1".to_string(), 1000, false, None).await.unwrap();
        let initiative = task("init-1", "active", vec![]);
        let unready = task("t1", "todo", vec!["missing-dep".to_string()]);
        let graph = MissionControlGraph {
            initiative: initiative.clone(),
            nodes: vec![initiative, unready],
            edges: vec![],
            recent_todos: vec!["t1".to_string()],
            degraded: vec![],
        };
        scheduler.tick_once("init-1", &graph).await;
        let run = scheduler.status("init-1").await.unwrap();
        assert_eq!(run.status, AutoContinueStatus::Stopped);
        assert_eq!(run.stop_reason, Some(StopReason::Blocked));
    }
}
