//! Mission control graph construction (§4.2): normalize, build edges,
//! break cycles, annotate ETAs, coerce status, derive budgets, rank
//! recent todos. Pure given already-fetched entity lists; never raises —
//! partial results plus a `degraded` list are always returned.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use orgx_types::{AssignedAgent, Entity, EntityType, GraphEdge, MissionControlGraph, MissionControlNode, StatusClass};

use crate::budget::BudgetConstants;

/// Raw entity lists as fetched from the cloud plane (or synthesized by the
/// local fallback mediator), one list per type, plus any fetch-time
/// degraded reasons (a failed fetch yields an empty list and a reason
/// here, per step 1).
#[derive(Debug, Clone, Default)]
pub struct RawEntities {
    pub initiatives: Vec<Entity>,
    pub workstreams: Vec<Entity>,
    pub milestones: Vec<Entity>,
    pub tasks: Vec<Entity>,
    pub degraded: Vec<String>,
}

/// Caps applied by the fetcher, not by `build_graph` itself (the fetcher
/// lives in `orgx-cloud`/`orgx-local`, which pass already-capped lists
/// here).
pub const MAX_INITIATIVES: usize = 300;
pub const MAX_WORKSTREAMS: usize = 500;
pub const MAX_MILESTONES: usize = 700;
pub const MAX_TASKS: usize = 1200;

fn default_duration_hours(entity_type: EntityType) -> f64 {
    match entity_type {
        EntityType::Initiative => 40.0,
        EntityType::Workstream => 16.0,
        EntityType::Milestone => 6.0,
        EntityType::Task => 2.0,
        _ => 2.0,
    }
}

const ID_KEYS: &[&str] = &["id", "_id"];
const TITLE_KEYS: &[&str] = &["title", "name"];
const STATUS_KEYS: &[&str] = &["status", "state"];
const PARENT_ID_KEYS: &[&str] = &["parent_id", "parentId"];
const INITIATIVE_ID_KEYS: &[&str] = &["initiative_id", "initiativeId"];
const WORKSTREAM_ID_KEYS: &[&str] = &["workstream_id", "workstreamId"];
const MILESTONE_ID_KEYS: &[&str] = &["milestone_id", "milestoneId"];
const DUE_DATE_KEYS: &[&str] = &["due_date", "dueDate"];
const ETA_END_AT_KEYS: &[&str] = &["eta_end_at", "etaEndAt"];
const UPDATED_AT_KEYS: &[&str] = &["updated_at", "updatedAt"];
const DURATION_HOURS_KEYS: &[&str] = &["expected_duration_hours", "expectedDurationHours"];
const DESCRIPTION_KEYS: &[&str] = &["description", "summary"];
const ASSIGNED_AGENT_KEYS: &[&str] = &["assigned_agents", "assignedAgents", "assignees"];

fn extract_assigned_agents(entity: &Entity) -> Vec<AssignedAgent> {
    let raw = entity
        .get("assigned_agents")
        .or_else(|| entity.get("assignedAgents"))
        .or_else(|| entity.get("assignees"))
        .or_else(|| {
            entity
                .get("metadata")
                .and_then(|m| m.as_object())
                .and_then(|m| {
                    ASSIGNED_AGENT_KEYS
                        .iter()
                        .find_map(|k| m.get(*k))
                })
        });
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in arr {
        let (id, name, domain) = match item {
            serde_json::Value::Object(obj) => {
                let id = obj
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_default();
                let name = obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| id.clone());
                let domain = obj
                    .get("domain")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                (id, name, domain)
            }
            serde_json::Value::String(s) => (s.clone(), s.clone(), None),
            _ => continue,
        };
        if id.is_empty() || !seen.insert(id.clone()) {
            continue;
        }
        out.push(AssignedAgent { id, name, domain });
    }
    out
}

fn resolve_duration_hours(entity: &Entity, entity_type: EntityType) -> f64 {
    if let Some(v) = orgx_normalize::pick_number(
        &serde_json::Value::Object(entity.clone()),
        DURATION_HOURS_KEYS,
    ) {
        if v.is_finite() && v > 0.0 {
            return v;
        }
    }
    let description = orgx_normalize::pick_string(
        &serde_json::Value::Object(entity.clone()),
        DESCRIPTION_KEYS,
    );
    if let Some(text) = description {
        if let Some(hours) = orgx_normalize::extract_duration_hours_from_text(&text) {
            return hours;
        }
    }
    default_duration_hours(entity_type)
}

fn normalize_one(entity: &Entity, entity_type: EntityType) -> MissionControlNode {
    let value = serde_json::Value::Object(entity.clone());
    let id = orgx_normalize::pick_string(&value, ID_KEYS).unwrap_or_default();
    let title = orgx_normalize::pick_string(&value, TITLE_KEYS).unwrap_or_else(|| id.clone());
    let status = orgx_normalize::pick_string(&value, STATUS_KEYS)
        .unwrap_or_else(|| "todo".to_string())
        .to_ascii_lowercase();
    let parent_id = orgx_normalize::pick_string(&value, PARENT_ID_KEYS);
    let initiative_id = orgx_normalize::pick_string(&value, INITIATIVE_ID_KEYS);
    let workstream_id = orgx_normalize::pick_string(&value, WORKSTREAM_ID_KEYS);
    let milestone_id = orgx_normalize::pick_string(&value, MILESTONE_ID_KEYS);
    let due_date = orgx_normalize::pick_string(&value, DUE_DATE_KEYS)
        .and_then(|s| orgx_normalize::to_iso_string(&s));
    let eta_end_at = orgx_normalize::pick_string(&value, ETA_END_AT_KEYS)
        .and_then(|s| orgx_normalize::to_iso_string(&s));
    let updated_at = orgx_normalize::pick_string(&value, UPDATED_AT_KEYS)
        .and_then(|s| orgx_normalize::to_iso_string(&s));
    let priority = orgx_normalize::normalize_priority(&value);
    let dependency_ids = orgx_normalize::normalize_dependencies(&value);
    let expected_duration_hours = resolve_duration_hours(entity, entity_type);

    MissionControlNode {
        id,
        node_type: entity_type,
        title,
        status,
        parent_id,
        initiative_id,
        workstream_id,
        milestone_id,
        priority_num: priority.priority_num,
        priority_label: priority.priority_label,
        dependency_ids,
        due_date,
        eta_end_at,
        expected_duration_hours,
        expected_budget_usd: 0.0,
        assigned_agents: extract_assigned_agents(entity),
        updated_at,
    }
}

fn placeholder_initiative(initiative_id: &str) -> MissionControlNode {
    MissionControlNode {
        id: initiative_id.to_string(),
        node_type: EntityType::Initiative,
        title: initiative_id.to_string(),
        status: "active".to_string(),
        parent_id: None,
        initiative_id: Some(initiative_id.to_string()),
        workstream_id: None,
        milestone_id: None,
        priority_num: 60,
        priority_label: "medium".to_string(),
        dependency_ids: Vec::new(),
        due_date: None,
        eta_end_at: None,
        expected_duration_hours: default_duration_hours(EntityType::Initiative),
        expected_budget_usd: 0.0,
        assigned_agents: Vec::new(),
        updated_at: None,
    }
}

/// Invariant G2: when a task's `parentId` is unset, resolve it from
/// `milestoneId` then `workstreamId` then `initiativeId`.
fn apply_parent_consistency(node: &mut MissionControlNode) {
    if node.parent_id.is_some() {
        return;
    }
    node.parent_id = node
        .milestone_id
        .clone()
        .or_else(|| node.workstream_id.clone())
        .or_else(|| node.initiative_id.clone());
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// DFS white/grey/black cycle detection (§4.2 step 4). Returns the set of
/// `(from, to)` edges that close a cycle (the target is grey when visited).
fn find_cyclic_edges(
    nodes_by_id: &HashMap<String, usize>,
    adjacency: &HashMap<String, Vec<String>>,
) -> HashSet<(String, String)> {
    let mut color: HashMap<String, Color> = nodes_by_id
        .keys()
        .map(|id| (id.clone(), Color::White))
        .collect();
    let mut cyclic = HashSet::new();

    fn visit(
        node: &str,
        adjacency: &HashMap<String, Vec<String>>,
        color: &mut HashMap<String, Color>,
        cyclic: &mut HashSet<(String, String)>,
    ) {
        color.insert(node.to_string(), Color::Grey);
        if let Some(deps) = adjacency.get(node) {
            for dep in deps {
                match color.get(dep).copied().unwrap_or(Color::White) {
                    Color::Grey => {
                        cyclic.insert((dep.clone(), node.to_string()));
                    }
                    Color::White => visit(dep, adjacency, color, cyclic),
                    Color::Black => {}
                }
            }
        }
        color.insert(node.to_string(), Color::Black);
    }

    for id in nodes_by_id.keys() {
        if color.get(id).copied() == Some(Color::White) {
            visit(id, adjacency, &mut color, &mut cyclic);
        }
    }
    cyclic
}

fn duration_ms(node: &MissionControlNode) -> i64 {
    (node.expected_duration_hours.max(0.0) * 3_600_000.0) as i64
}

/// Memoized longest-path ETA recursion (§4.2 step 5).
fn compute_eta_epochs(
    nodes: &[MissionControlNode],
    adjacency: &HashMap<String, Vec<String>>,
    now_ms: i64,
    degraded: &mut Vec<String>,
) -> HashMap<String, i64> {
    let by_id: HashMap<&str, &MissionControlNode> =
        nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut memo: HashMap<String, i64> = HashMap::new();
    let mut in_progress: HashSet<String> = HashSet::new();
    let mut revisit_noted = false;

    fn resolve<'a>(
        id: &str,
        by_id: &HashMap<&'a str, &'a MissionControlNode>,
        adjacency: &HashMap<String, Vec<String>>,
        memo: &mut HashMap<String, i64>,
        in_progress: &mut HashSet<String>,
        now_ms: i64,
        revisit_noted: &mut bool,
    ) -> i64 {
        if let Some(v) = memo.get(id) {
            return *v;
        }
        let Some(node) = by_id.get(id) else {
            return now_ms;
        };
        if let Some(eta) = node
            .eta_end_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let epoch = eta.timestamp_millis();
            memo.insert(id.to_string(), epoch);
            return epoch;
        }
        if let Some(due) = node
            .due_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            let epoch = due.timestamp_millis();
            memo.insert(id.to_string(), epoch);
            return epoch;
        }
        if in_progress.contains(id) {
            *revisit_noted = true;
            return now_ms;
        }
        in_progress.insert(id.to_string());
        let dep_max = adjacency
            .get(id)
            .map(|deps| {
                deps.iter()
                    .map(|dep| {
                        resolve(
                            dep,
                            by_id,
                            adjacency,
                            memo,
                            in_progress,
                            now_ms,
                            revisit_noted,
                        )
                    })
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        in_progress.remove(id);
        let epoch = dep_max.max(now_ms) + duration_ms(node);
        memo.insert(id.to_string(), epoch);
        epoch
    }

    for node in nodes {
        resolve(
            &node.id,
            &by_id,
            adjacency,
            &mut memo,
            &mut in_progress,
            now_ms,
            &mut revisit_noted,
        );
    }
    if revisit_noted {
        degraded.push("eta computation detected a revisit; fell back to now for affected nodes".to_string());
    }
    memo
}

/// Recent-todos ranking (§4.2 step 8): ready tasks first, then ordered by
/// the documented tuple.
fn rank_recent_todos(
    nodes: &[MissionControlNode],
    eta_epochs: &HashMap<String, i64>,
) -> Vec<String> {
    let by_id: HashMap<&str, &MissionControlNode> =
        nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let is_done = |id: &str| -> bool {
        by_id
            .get(id)
            .map(|n| StatusClass::is_done_like(&n.status))
            .unwrap_or(true)
    };
    let is_ready = |node: &MissionControlNode| -> bool {
        node.dependency_ids.iter().all(|dep| is_done(dep))
    };
    let parent_blocked = |node: &MissionControlNode| -> bool {
        node.parent_id
            .as_ref()
            .and_then(|pid| by_id.get(pid.as_str()))
            .map(|parent| parent.status == "blocked")
            .unwrap_or(false)
    };

    let mut todos: Vec<&MissionControlNode> = nodes
        .iter()
        .filter(|n| n.node_type == EntityType::Task && StatusClass::is_todo_like(&n.status))
        .collect();

    todos.sort_by(|a, b| {
        let ready_rank = |n: &MissionControlNode| (!is_ready(n), parent_blocked(n));
        let key = |n: &&MissionControlNode| {
            (
                ready_rank(n),
                n.priority_num,
                n.due_date.clone().unwrap_or_default(),
                *eta_epochs.get(&n.id).unwrap_or(&i64::MAX),
                n.updated_at.clone().unwrap_or_default(),
            )
        };
        key(a).cmp(&key(b))
    });

    todos.into_iter().map(|n| n.id.clone()).collect()
}

/// Full build sequence (§4.2 steps 1-8). Step 1 (parallel fetch) has
/// already happened by the time `raw` is passed in; this function covers
/// steps 2-8 and is, like every other part of the normalizer/graph
/// pipeline, infallible.
pub fn build_graph(
    initiative_id: &str,
    raw: RawEntities,
    now: DateTime<Utc>,
    budget: &BudgetConstants,
) -> MissionControlGraph {
    let mut degraded = raw.degraded;

    let initiative_entity = raw
        .initiatives
        .iter()
        .find(|e| e.get("id").and_then(|v| v.as_str()) == Some(initiative_id));
    let mut initiative = match initiative_entity {
        Some(e) => normalize_one(e, EntityType::Initiative),
        None => {
            degraded.push(format!(
                "initiative {initiative_id} missing from fetch; synthesized placeholder"
            ));
            placeholder_initiative(initiative_id)
        }
    };

    let mut nodes: Vec<MissionControlNode> = Vec::new();
    nodes.extend(
        raw.workstreams
            .iter()
            .map(|e| normalize_one(e, EntityType::Workstream)),
    );
    nodes.extend(
        raw.milestones
            .iter()
            .map(|e| normalize_one(e, EntityType::Milestone)),
    );
    nodes.extend(raw.tasks.iter().map(|e| normalize_one(e, EntityType::Task)));

    for node in nodes.iter_mut() {
        apply_parent_consistency(node);
    }

    let mut all_ids: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    all_ids.insert(initiative.id.clone());

    for node in nodes.iter_mut() {
        node.dependency_ids.retain(|dep| dep != &node.id && all_ids.contains(dep));
    }

    let mut nodes_by_id: HashMap<String, usize> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        nodes_by_id.insert(node.id.clone(), idx);
    }

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for node in &nodes {
        if node.node_type != EntityType::Initiative {
            adjacency.insert(node.id.clone(), node.dependency_ids.clone());
        }
    }

    let cyclic_edges = find_cyclic_edges(&nodes_by_id, &adjacency);
    if !cyclic_edges.is_empty() {
        degraded.push(format!(
            "removed {} cyclic dependency edge(s)",
            cyclic_edges.len()
        ));
        for node in nodes.iter_mut() {
            node.dependency_ids
                .retain(|dep| !cyclic_edges.contains(&(dep.clone(), node.id.clone())));
        }
        for (id, deps) in adjacency.iter_mut() {
            deps.retain(|dep| !cyclic_edges.contains(&(dep.clone(), id.clone())));
        }
    }

    let mut edges: Vec<GraphEdge> = Vec::new();
    let mut seen_edges = HashSet::new();
    for node in &nodes {
        for dep in &node.dependency_ids {
            let key = (dep.clone(), node.id.clone());
            if seen_edges.insert(key) {
                edges.push(GraphEdge {
                    from: dep.clone(),
                    to: node.id.clone(),
                });
            }
        }
    }

    let now_ms = now.timestamp_millis();
    let eta_epochs = compute_eta_epochs(&nodes, &adjacency, now_ms, &mut degraded);
    for node in nodes.iter_mut() {
        if node.eta_end_at.is_none() {
            if let Some(epoch) = eta_epochs.get(&node.id) {
                node.eta_end_at = DateTime::<Utc>::from_timestamp_millis(*epoch)
                    .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
            }
        }
    }
    if let Some(epoch) = eta_epochs.get(&initiative.id) {
        if initiative.eta_end_at.is_none() {
            initiative.eta_end_at = DateTime::<Utc>::from_timestamp_millis(*epoch)
                .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        }
    }

    // Step 6: status coercion. Active initiative, no in-progress task, at
    // least one todo task => coerce initiative status to paused.
    if initiative.status == "active" {
        let any_in_progress = nodes
            .iter()
            .any(|n| n.node_type == EntityType::Task && StatusClass::is_in_progress_like(&n.status));
        let any_todo = nodes
            .iter()
            .any(|n| n.node_type == EntityType::Task && StatusClass::is_todo_like(&n.status));
        if !any_in_progress && any_todo {
            initiative.status = "paused".to_string();
        }
    }

    // Step 7: budget derivation for every node, including the initiative.
    initiative.expected_budget_usd = budget.derive_budget_usd(initiative.expected_duration_hours);
    for node in nodes.iter_mut() {
        node.expected_budget_usd = budget.derive_budget_usd(node.expected_duration_hours);
    }

    let recent_todos = rank_recent_todos(&nodes, &eta_epochs);

    tracing::debug!(
        initiative_id,
        node_count = nodes.len(),
        edge_count = edges.len(),
        degraded_count = degraded.len(),
        "built mission control graph"
    );

    MissionControlGraph {
        initiative,
        nodes,
        edges,
        recent_todos,
        degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, deps: Vec<&str>) -> Entity {
        json!({
            "id": id,
            "type": "task",
            "title": id,
            "status": "todo",
            "dependency_ids": deps,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn cycle_is_broken_and_reported() {
        let raw = RawEntities {
            initiatives: vec![json!({"id": "init-1", "type": "initiative", "title": "Init"})
                .as_object()
                .unwrap()
                .clone()],
            tasks: vec![
                task("t1", vec!["t3"]),
                task("t2", vec!["t1"]),
                task("t3", vec!["t2"]),
            ],
            ..Default::default()
        };
        let graph = build_graph(
            "init-1",
            raw,
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            &BudgetConstants::test_default(),
        );
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert!(graph
            .degraded
            .iter()
            .any(|d| d.contains("1 cyclic dependency edge")));
    }

    #[test]
    fn eta_propagates_along_dependency_chain() {
        let mut a = task("a", vec![]);
        a.insert("expected_duration_hours".to_string(), json!(2));
        let mut b = task("b", vec!["a"]);
        b.insert("expected_duration_hours".to_string(), json!(3));
        let raw = RawEntities {
            initiatives: vec![json!({"id": "init-1", "type": "initiative", "title": "Init"})
                .as_object()
                .unwrap()
                .clone()],
            tasks: vec![a, b],
            ..Default::default()
        };
        let now = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let graph = build_graph("init-1", raw, now, &BudgetConstants::test_default());
        let node_a = graph.nodes.iter().find(|n| n.id == "a").unwrap();
        let node_b = graph.nodes.iter().find(|n| n.id == "b").unwrap();
        assert_eq!(node_a.eta_end_at.as_deref(), Some("2025-01-01T02:00:00.000Z"));
        assert_eq!(node_b.eta_end_at.as_deref(), Some("2025-01-01T05:00:00.000Z"));
    }

    #[test]
    fn missing_initiative_synthesizes_placeholder_and_reports_degraded() {
        let raw = RawEntities {
            tasks: vec![task("t1", vec![])],
            ..Default::default()
        };
        let now = Utc::now();
        let graph = build_graph("init-missing", raw, now, &BudgetConstants::test_default());
        assert_eq!(graph.initiative.id, "init-missing");
        assert!(graph.degraded.iter().any(|d| d.contains("placeholder")));
    }

    #[test]
    fn active_initiative_with_no_in_progress_and_a_todo_is_coerced_to_paused() {
        let mut initiative = json!({"id": "init-1", "type": "initiative", "title": "Init", "status": "active"})
            .as_object()
            .unwrap()
            .clone();
        initiative.insert("status".to_string(), json!("active"));
        let raw = RawEntities {
            initiatives: vec![initiative],
            tasks: vec![task("t1", vec![])],
            ..Default::default()
        };
        let graph = build_graph(
            "init-1",
            raw,
            Utc::now(),
            &BudgetConstants::test_default(),
        );
        assert_eq!(graph.initiative.status, "paused");
    }
}
