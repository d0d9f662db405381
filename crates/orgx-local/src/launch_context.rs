//! Agent-launch-context store (§3 "AgentLaunchContext", §6
//! `agent-contexts.json`): records what an agent/run was launched for, so
//! the local fallback mediator can enrich session/activity reads when the
//! cloud plane is unreachable. Capped at 120 agents / 480 runs, LRU by
//! `updatedAt`.

use std::collections::HashMap;

use chrono::Utc;
use orgx_types::AgentLaunchContext;
use serde::{Deserialize, Serialize};

use crate::store::JsonFileStore;

const MAX_AGENTS: usize = 120;
const MAX_RUNS: usize = 480;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "initiativeId", skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub pid: u32,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentContextsFile {
    #[serde(rename = "updatedAt", default)]
    pub updated_at: String,
    #[serde(default)]
    pub agents: HashMap<String, AgentLaunchContext>,
    #[serde(default)]
    pub runs: HashMap<String, RunContext>,
}

fn evict_oldest<T, F>(map: &mut HashMap<String, T>, max: usize, updated_at: F)
where
    F: Fn(&T) -> &str,
{
    if map.len() <= max {
        return;
    }
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort_by_key(|k| updated_at(&map[k]).to_string());
    let overflow = map.len() - max;
    for key in keys.into_iter().take(overflow) {
        map.remove(&key);
    }
}

pub struct LaunchContextStore {
    file: JsonFileStore<AgentContextsFile>,
}

impl LaunchContextStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            file: JsonFileStore::open(path).await,
        }
    }

    pub async fn record_agent(&self, context: AgentLaunchContext) {
        let _ = self
            .file
            .update(|state| {
                state.agents.insert(context.agent_id.clone(), context);
                state.updated_at = Utc::now().to_rfc3339();
                evict_oldest(&mut state.agents, MAX_AGENTS, |c| c.updated_at.as_str());
            })
            .await;
    }

    pub async fn record_run(&self, run: RunContext) {
        let _ = self
            .file
            .update(|state| {
                state.runs.insert(run.run_id.clone(), run);
                state.updated_at = Utc::now().to_rfc3339();
                evict_oldest(&mut state.runs, MAX_RUNS, |r| r.updated_at.as_str());
            })
            .await;
    }

    pub async fn agent(&self, agent_id: &str) -> Option<AgentLaunchContext> {
        self.file.get().await.agents.get(agent_id).cloned()
    }

    pub async fn run(&self, run_id: &str) -> Option<RunContext> {
        self.file.get().await.runs.get(run_id).cloned()
    }

    pub async fn all(&self) -> AgentContextsFile {
        self.file.get().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("orgx-launch-context-{}.json", uuid::Uuid::new_v4()))
    }

    fn context(agent_id: &str, updated_at: &str) -> AgentLaunchContext {
        AgentLaunchContext {
            agent_id: agent_id.to_string(),
            run_id: "run-1".to_string(),
            session_id: "sess-1".to_string(),
            initiative_id: None,
            workstream_id: None,
            task_id: None,
            domain: "engineering".to_string(),
            required_skills: vec![],
            updated_at: updated_at.to_string(),
        }
    }

    #[tokio::test]
    async fn records_and_reads_back_agent_context() {
        let store = LaunchContextStore::open(temp_path()).await;
        store.record_agent(context("agent-1", "2025-01-01T00:00:00Z")).await;
        assert_eq!(store.agent("agent-1").await.unwrap().agent_id, "agent-1");
        assert!(store.agent("missing").await.is_none());
    }

    #[test]
    fn eviction_drops_oldest_entries_past_the_cap() {
        let mut map = HashMap::new();
        for i in 0..5 {
            map.insert(i.to_string(), context(&i.to_string(), &format!("2025-01-0{}T00:00:00Z", i + 1)));
        }
        evict_oldest(&mut map, 3, |c| c.updated_at.as_str());
        assert_eq!(map.len(), 3);
        assert!(!map.contains_key("0"));
        assert!(!map.contains_key("1"));
    }
}
