//! Next-Up Ranker (§4.3): derives a ranked queue of dispatchable
//! `(initiative, workstream, task)` triples from one or more mission
//! control graphs, merging pinned overrides and a transcript-derived
//! fallback when nothing else is dispatchable.

use std::collections::{HashMap, HashSet};

use orgx_types::{EntityType, MissionControlGraph, NextUpQueueItem, Pin, QueueState, StatusClass};

/// A session node synthesized from on-disk transcripts, used only as a
/// last resort when every other path yields an empty queue.
#[derive(Debug, Clone)]
pub struct SessionFallbackNode {
    pub initiative_id: String,
    pub initiative_title: String,
    pub workstream_id: String,
    pub workstream_title: String,
    pub agent_id: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct RankerInput<'a> {
    pub graphs: Vec<&'a MissionControlGraph>,
    pub pins: &'a [Pin],
    /// Workstream ids (not initiative ids) with a currently-running
    /// AutoContinueRun, and the agent driving that run.
    pub running_workstreams: HashMap<String, String>,
    /// First "live" cloud-reported agent id per initiative, if any.
    pub live_agents_by_initiative: HashMap<String, String>,
    pub fallback_sessions: Vec<SessionFallbackNode>,
    pub allow_fallback: bool,
}

fn initiative_priority_rank(label: &str) -> u8 {
    match label.to_ascii_lowercase().as_str() {
        "urgent" | "critical" | "p0" => 0,
        "high" => 1,
        "medium" => 2,
        _ => 3,
    }
}

fn queue_state_rank(state: QueueState) -> u8 {
    match state {
        QueueState::Running => 0,
        QueueState::Queued => 1,
        QueueState::Blocked => 2,
        QueueState::Idle => 3,
    }
}

fn is_ready(task_deps: &[String], done: impl Fn(&str) -> bool) -> bool {
    task_deps.iter().all(|d| done(d))
}

fn block_reason(
    task_deps: &[String],
    titles: &HashMap<&str, &str>,
    done: impl Fn(&str) -> bool,
    parent_blocked: bool,
) -> String {
    if parent_blocked {
        return "Parent milestone/workstream is blocked".to_string();
    }
    let unfinished: Vec<&str> = task_deps
        .iter()
        .filter(|d| !done(d))
        .take(2)
        .map(|d| titles.get(d.as_str()).copied().unwrap_or(d.as_str()))
        .collect();
    if unfinished.is_empty() {
        "Blocked".to_string()
    } else {
        format!("Waiting on: {}", unfinished.join(", "))
    }
}

/// Builds the ranked next-up queue per §4.3. Never raises.
pub fn rank_next_up(input: &RankerInput) -> Vec<NextUpQueueItem> {
    let mut items = Vec::new();

    for graph in &input.graphs {
        let titles: HashMap<&str, &str> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.title.as_str()))
            .collect();
        let statuses: HashMap<&str, &str> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.status.as_str()))
            .collect();
        let done = |id: &str| -> bool {
            statuses
                .get(id)
                .map(|s| StatusClass::is_done_like(s))
                .unwrap_or(true)
        };

        let recent_todo_order: HashMap<&str, usize> = graph
            .recent_todos
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        for workstream in graph
            .nodes
            .iter()
            .filter(|n| n.node_type == EntityType::Workstream)
        {
            let pin = input
                .pins
                .iter()
                .find(|p| p.initiative_id == graph.initiative.id && p.workstream_id == workstream.id);

            let mut workstream_tasks: Vec<&orgx_types::MissionControlNode> = graph
                .nodes
                .iter()
                .filter(|n| n.node_type == EntityType::Task && n.workstream_id.as_deref() == Some(&workstream.id))
                .collect();
            workstream_tasks.sort_by_key(|t| {
                recent_todo_order
                    .get(t.id.as_str())
                    .copied()
                    .unwrap_or(usize::MAX)
            });

            let preferred_pinned = pin
                .and_then(|p| p.preferred_task_id.as_deref())
                .and_then(|id| workstream_tasks.iter().find(|t| t.id == id));

            let candidate = if let Some(t) = preferred_pinned {
                if is_ready(&t.dependency_ids, done) {
                    Some(*t)
                } else {
                    workstream_tasks
                        .iter()
                        .find(|t| StatusClass::is_todo_like(&t.status) && is_ready(&t.dependency_ids, done))
                        .copied()
                        .or(Some(*t))
                }
            } else {
                workstream_tasks
                    .iter()
                    .find(|t| StatusClass::is_todo_like(&t.status) && is_ready(&t.dependency_ids, done))
                    .copied()
                    .or_else(|| {
                        workstream_tasks
                            .iter()
                            .find(|t| StatusClass::is_todo_like(&t.status))
                            .copied()
                    })
            };

            let ready_task_exists = workstream_tasks
                .iter()
                .any(|t| StatusClass::is_todo_like(&t.status) && is_ready(&t.dependency_ids, done));

            let running_agent = input.running_workstreams.get(&workstream.id);

            let (queue_state, block_reason_text) = if running_agent.is_some() {
                (QueueState::Running, None)
            } else if ready_task_exists {
                (QueueState::Queued, None)
            } else if let Some(candidate) = candidate {
                let parent_blocked = candidate
                    .parent_id
                    .as_deref()
                    .and_then(|pid| statuses.get(pid))
                    .map(|s| *s == "blocked")
                    .unwrap_or(false);
                let reason = block_reason(&candidate.dependency_ids, &titles, done, parent_blocked);
                (QueueState::Blocked, Some(reason))
            } else {
                (QueueState::Idle, None)
            };

            let assigned_agent = candidate
                .and_then(|t| t.assigned_agents.first())
                .map(|a| a.id.clone())
                .or_else(|| workstream.assigned_agents.first().map(|a| a.id.clone()))
                .or_else(|| input.live_agents_by_initiative.get(&graph.initiative.id).cloned())
                .or_else(|| running_agent.cloned())
                .unwrap_or_else(|| "main".to_string());

            let runner_source = if running_agent.is_some() {
                "auto_continue"
            } else {
                "graph"
            };

            items.push(NextUpQueueItem {
                initiative_id: graph.initiative.id.clone(),
                initiative_title: graph.initiative.title.clone(),
                workstream_id: workstream.id.clone(),
                workstream_title: workstream.title.clone(),
                task_id: candidate.map(|t| t.id.clone()),
                queue_state,
                block_reason: block_reason_text,
                runner_agent_id: assigned_agent,
                runner_source: runner_source.to_string(),
                pinned_rank: None,
                priority_num: candidate.map(|t| t.priority_num).unwrap_or(workstream.priority_num),
                due_date: candidate.and_then(|t| t.due_date.clone()).or_else(|| workstream.due_date.clone()),
            });
        }
    }

    if items.is_empty() && input.allow_fallback && !input.fallback_sessions.is_empty() {
        let mut latest_by_scope: HashMap<(String, String), &SessionFallbackNode> = HashMap::new();
        for session in &input.fallback_sessions {
            let key = (session.initiative_id.clone(), session.workstream_id.clone());
            latest_by_scope
                .entry(key)
                .and_modify(|existing| {
                    if session.updated_at > existing.updated_at {
                        *existing = session;
                    }
                })
                .or_insert(session);
        }
        for session in latest_by_scope.values() {
            items.push(NextUpQueueItem {
                initiative_id: session.initiative_id.clone(),
                initiative_title: session.initiative_title.clone(),
                workstream_id: session.workstream_id.clone(),
                workstream_title: session.workstream_title.clone(),
                task_id: None,
                queue_state: QueueState::Idle,
                block_reason: None,
                runner_agent_id: session.agent_id.clone(),
                runner_source: "fallback".to_string(),
                pinned_rank: None,
                priority_num: 60,
                due_date: None,
            });
        }
    }

    let pinned_rank_by_key: HashMap<(String, String), u32> = input
        .pins
        .iter()
        .enumerate()
        .map(|(i, p)| ((p.initiative_id.clone(), p.workstream_id.clone()), i as u32))
        .collect();
    let initiative_priority: HashMap<String, String> = {
        let mut m = HashMap::new();
        for graph in &input.graphs {
            m.insert(graph.initiative.id.clone(), graph.initiative.priority_label.clone());
        }
        m
    };

    for item in items.iter_mut() {
        item.pinned_rank = pinned_rank_by_key
            .get(&(item.initiative_id.clone(), item.workstream_id.clone()))
            .copied();
    }

    items.sort_by(|a, b| {
        let a_key = (
            queue_state_rank(a.queue_state),
            a.pinned_rank.is_none(),
            a.pinned_rank.unwrap_or(u32::MAX),
            initiative_priority_rank(
                initiative_priority
                    .get(&a.initiative_id)
                    .map(String::as_str)
                    .unwrap_or("medium"),
            ),
            a.priority_num,
            a.due_date.clone().unwrap_or_default(),
            a.initiative_title.clone(),
            a.workstream_title.clone(),
        );
        let b_key = (
            queue_state_rank(b.queue_state),
            b.pinned_rank.is_none(),
            b.pinned_rank.unwrap_or(u32::MAX),
            initiative_priority_rank(
                initiative_priority
                    .get(&b.initiative_id)
                    .map(String::as_str)
                    .unwrap_or("medium"),
            ),
            b.priority_num,
            b.due_date.clone().unwrap_or_default(),
            b.initiative_title.clone(),
            b.workstream_title.clone(),
        );
        a_key.cmp(&b_key)
    });

    items
}

/// Resolves `HashSet` membership for the set of workstream ids covered by
/// an allow-list, used by the scheduler when filtering candidate tasks.
pub fn workstream_ids(graph: &MissionControlGraph) -> HashSet<String> {
    graph
        .nodes
        .iter()
        .filter(|n| n.node_type == EntityType::Workstream)
        .map(|n| n.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgx_types::{EntityType, MissionControlNode};

    fn node(id: &str, ty: EntityType, workstream_id: Option<&str>, status: &str) -> MissionControlNode {
        MissionControlNode {
            id: id.to_string(),
            node_type: ty,
            title: id.to_string(),
            status: status.to_string(),
            parent_id: None,
            initiative_id: Some("init-1".to_string()),
            workstream_id: workstream_id.map(str::to_string),
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

    #[test]
    fn idle_when_no_tasks_and_queued_when_ready_task_present() {
        let initiative = node("init-1", EntityType::Initiative, None, "active");
        let ws_idle = node("ws-idle", EntityType::Workstream, None, "active");
        let ws_queued = node("ws-queued", EntityType::Workstream, None, "active");
        let task = node("t1", EntityType::Task, Some("ws-queued"), "todo");
        let graph = MissionControlGraph {
            initiative,
            nodes: vec![ws_idle, ws_queued, task],
            edges: vec![],
            recent_todos: vec!["t1".to_string()],
            degraded: vec![],
        };
        let input = RankerInput {
            graphs: vec![&graph],
            pins: &[],
            running_workstreams: HashMap::new(),
            live_agents_by_initiative: HashMap::new(),
            fallback_sessions: vec![],
            allow_fallback: false,
        };
        let items = rank_next_up(&input);
        let idle = items.iter().find(|i| i.workstream_id == "ws-idle").unwrap();
        let queued = items.iter().find(|i| i.workstream_id == "ws-queued").unwrap();
        assert_eq!(idle.queue_state, QueueState::Idle);
        assert_eq!(queued.queue_state, QueueState::Queued);
    }

    #[test]
    fn running_workstream_ranks_before_queued() {
        let initiative = node("init-1", EntityType::Initiative, None, "active");
        let ws_running = node("ws-running", EntityType::Workstream, None, "active");
        let ws_queued = node("ws-queued", EntityType::Workstream, None, "active");
        let t1 = node("t1", EntityType::Task, Some("ws-running"), "todo");
        let t2 = node("t2", EntityType::Task, Some("ws-queued"), "todo");
        let graph = MissionControlGraph {
            initiative,
            nodes: vec![ws_running, ws_queued, t1, t2],
            edges: vec![],
            recent_todos: vec!["t1".to_string(), "t2".to_string()],
            degraded: vec![],
        };
        let mut running = HashMap::new();
        running.insert("ws-running".to_string(), "agent-1".to_string());
        let input = RankerInput {
            graphs: vec![&graph],
            pins: &[],
            running_workstreams: running,
            live_agents_by_initiative: HashMap::new(),
            fallback_sessions: vec![],
            allow_fallback: false,
        };
        let items = rank_next_up(&input);
        assert_eq!(items[0].workstream_id, "ws-running");
        assert_eq!(items[0].queue_state, QueueState::Running);
    }
}
