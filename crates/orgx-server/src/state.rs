//! `AppState`: the shared handle every handler receives, wiring together
//! the cloud client, the local fallback mediator, the runtime registry, and
//! the auto-continue scheduler. Mirrors the teacher's `AppState` in
//! `tandem-server/src/lib.rs` — one `Arc`-wrapped struct built once at
//! startup and cloned per request.

use std::sync::Arc;

use orgx_cloud::{CloudClient, EntityFilter};
use orgx_graph::{build_graph, RawEntities};
use orgx_local::{LaunchContextStore, Mediator, Outbox, OverrideTable, PinStore};
use orgx_registry::RuntimeRegistry;
use orgx_scheduler::{Scheduler, SchedulerConfig};
use orgx_types::{EntityType, MissionControlGraph};

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cloud: Arc<dyn CloudClient>,
    pub mediator: Arc<Mediator>,
    pub launch_contexts: Arc<LaunchContextStore>,
    pub outbox: Arc<Outbox>,
    pub overrides: Arc<OverrideTable>,
    pub pins: Arc<PinStore>,
    pub registry: Arc<RuntimeRegistry>,
    pub scheduler: Arc<Scheduler>,
    program: Arc<str>,
    program_args: Arc<[String]>,
}

impl AppState {
    pub async fn new(config: Config, cloud: Arc<dyn CloudClient>, program: String, program_args: Vec<String>) -> Self {
        let config = Arc::new(config);
        let outbox = Arc::new(Outbox::new(config.state_dir.join("outbox")));
        let overrides = Arc::new(OverrideTable::new());
        let launch_contexts =
            Arc::new(LaunchContextStore::open(config.state_dir.join("agent-contexts.json")).await);
        let pins = Arc::new(PinStore::open(config.state_dir.join("next-up-pins.json")).await);
        let mediator = Arc::new(Mediator::new(
            cloud.clone(),
            launch_contexts.clone(),
            outbox.clone(),
            overrides.clone(),
            config.transcripts_dir.clone(),
        ));
        let registry = Arc::new(RuntimeRegistry::new());
        let scheduler = Arc::new(Scheduler::new(
            cloud.clone(),
            launch_contexts.clone(),
            outbox.clone(),
            SchedulerConfig {
                program: program.clone(),
                program_args: program_args.clone(),
                transcripts_dir: config.transcripts_dir.clone(),
                budget: config.budget.clone(),
            },
        ));

        Self {
            config,
            cloud,
            mediator,
            launch_contexts,
            outbox,
            overrides,
            pins,
            registry,
            scheduler,
            program: Arc::from(program.as_str()),
            program_args: Arc::from(program_args),
        }
    }

    pub fn scheduler_program(&self) -> String {
        self.program.to_string()
    }

    pub fn scheduler_program_args(&self) -> Vec<String> {
        self.program_args.to_vec()
    }

    /// §4.2 step 1: parallel fetch of the four entity types that make up a
    /// mission control graph for one initiative, each going through the
    /// local fallback mediator so a cloud outage degrades rather than fails
    /// the whole build.
    pub async fn graph_for_initiative(&self, initiative_id: &str) -> MissionControlGraph {
        let filter = EntityFilter {
            initiative_id: Some(initiative_id.to_string()),
            limit: None,
        };
        let (initiatives, workstreams, milestones, tasks) = tokio::join!(
            self.mediator.list_entities(EntityType::Initiative, &filter),
            self.mediator.list_entities(EntityType::Workstream, &filter),
            self.mediator.list_entities(EntityType::Milestone, &filter),
            self.mediator.list_entities(EntityType::Task, &filter),
        );

        let mut degraded = Vec::new();
        let raw = RawEntities {
            initiatives: as_entities(initiatives.payload, &mut degraded, initiatives.error),
            workstreams: as_entities(workstreams.payload, &mut degraded, workstreams.error),
            milestones: as_entities(milestones.payload, &mut degraded, milestones.error),
            tasks: as_entities(tasks.payload, &mut degraded, tasks.error),
            degraded,
        };

        let graph = build_graph(initiative_id, raw, chrono::Utc::now(), &self.config.budget);
        tracing::debug!(
            initiative_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            degraded = graph.degraded.len(),
            "built mission control graph"
        );
        graph
    }
}

fn as_entities(payload: serde_json::Value, degraded: &mut Vec<String>, error: Option<String>) -> Vec<orgx_types::Entity> {
    if let Some(err) = error {
        degraded.push(err);
    }
    match payload {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}
