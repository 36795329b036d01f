//! Conductor Server
//!
//! Axum control plane for the multi-agent code-generation pipeline, plus the
//! agent entry points. One binary: `conductor serve` runs the orchestrator,
//! `conductor agent <kind>` runs a single agent process that the supervisor
//! spawns and monitors.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use conductor_core::agents::{ApiClient, CoordinatorAgent, StructurerAgent, WorkerAgent};
use conductor_core::config::{config_path, OrchestratorConfig};
use conductor_core::models::{AgentId, Role};
use conductor_core::orchestrator::{
    ClientRequest, NewSubtask, Orchestrator, OrchestratorError, OutboundItem, PushMessage,
    ReportSubmission, Supervisor, TreeProposal,
};
use conductor_core::providers::create_client;
use conductor_core::repo::{self, FileContent, FileTree, RepoGateway};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::fmt::MakeWriter;
use utoipa::{OpenApi, ToSchema};

/// How long the push channel may block on one slow socket send.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Log lines replayed to a freshly connected subscriber.
const WS_LOG_REPLAY: usize = 500;

/// Application state
struct AppState {
    orch: Arc<Orchestrator>,
    supervisor: Arc<Supervisor>,
}

type SharedState = Arc<AppState>;

// === API Types ===

#[derive(Serialize, ToSchema)]
struct ApiResponse {
    success: bool,
    message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Deserialize, ToSchema)]
struct UpdateConfigItemRequest {
    key: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct FileContentQuery {
    path: String,
}

#[derive(Deserialize)]
struct ClaimQuery {
    #[serde(default)]
    worker: Option<String>,
}

#[derive(Deserialize)]
struct AcceptRequest {
    id: String,
}

#[derive(Deserialize)]
struct FailRequest {
    id: String,
    reason: String,
}

#[derive(Deserialize)]
struct RejectRequest {
    id: String,
    text: String,
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    subtask_id: Option<String>,
}

#[derive(Deserialize)]
struct StructurePost {
    structure: FileTree,
    #[serde(default)]
    commit: Option<String>,
}

/// Map ledger/protocol errors onto conventional status codes.
fn error_response(e: OrchestratorError) -> (StatusCode, Json<ApiResponse>) {
    let status = match &e {
        OrchestratorError::UnknownSubtask(_) => StatusCode::NOT_FOUND,
        OrchestratorError::DuplicateId(_)
        | OrchestratorError::NotClaimed(_)
        | OrchestratorError::WrongRole { .. }
        | OrchestratorError::InvalidTransition { .. }
        | OrchestratorError::QueueSaturated(_)
        | OrchestratorError::TargetComplete
        | OrchestratorError::AlignmentClosed => StatusCode::CONFLICT,
        OrchestratorError::UnknownRole(_)
        | OrchestratorError::UnknownAgent(_)
        | OrchestratorError::UnsafePath(_) => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ApiResponse {
            success: false,
            message: e.to_string(),
        }),
    )
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Conductor API",
        version = "1.0.0",
        description = "Control plane for the Conductor multi-agent code-generation pipeline"
    ),
    paths(
        health,
        start_ai1,
        stop_ai1,
        start_ai2,
        stop_ai2,
        start_ai3,
        stop_ai3,
        start_all,
        stop_all,
        clear_state,
        clear_repo,
        update_config,
        update_config_item
    ),
    components(schemas(ApiResponse, UpdateConfigItemRequest)),
    tags(
        (name = "lifecycle", description = "Agent lifecycle controls"),
        (name = "config", description = "Configuration management"),
        (name = "pipeline", description = "Pipeline state and controls")
    )
)]
struct ApiDoc;

// === Operator Handlers ===

/// Liveness check
#[utoipa::path(get, path = "/health", tag = "pipeline",
    responses((status = 200, description = "Service is up")))]
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Start the coordinator
#[utoipa::path(post, path = "/start_ai1", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn start_ai1(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.start(AgentId::Coordinator);
    ApiResponse::ok("coordinator started")
}

/// Stop the coordinator
#[utoipa::path(post, path = "/stop_ai1", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn stop_ai1(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.stop(AgentId::Coordinator).await;
    ApiResponse::ok("coordinator stopped")
}

/// Start all three role workers
#[utoipa::path(post, path = "/start_ai2", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn start_ai2(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.start_workers();
    ApiResponse::ok("workers started")
}

/// Stop all three role workers
#[utoipa::path(post, path = "/stop_ai2", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn stop_ai2(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.stop_workers().await;
    ApiResponse::ok("workers stopped")
}

/// Start the structurer
#[utoipa::path(post, path = "/start_ai3", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn start_ai3(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.start(AgentId::Structurer);
    ApiResponse::ok("structurer started")
}

/// Stop the structurer
#[utoipa::path(post, path = "/stop_ai3", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn stop_ai3(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.stop(AgentId::Structurer).await;
    ApiResponse::ok("structurer stopped")
}

/// Start the whole pipeline
#[utoipa::path(post, path = "/start_all", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn start_all(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.start_all();
    ApiResponse::ok("all agents started")
}

/// Stop the whole pipeline: quiesce claims, wait the grace period for
/// in-flight reports, then terminate the agents
#[utoipa::path(post, path = "/stop_all", tag = "lifecycle",
    responses((status = 200, body = ApiResponse)))]
async fn stop_all(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.supervisor.stop_all().await;
    ApiResponse::ok("all agents stopped")
}

/// Retire the ledger, queues, logs and charts
#[utoipa::path(post, path = "/clear", tag = "pipeline",
    responses((status = 200, body = ApiResponse)))]
async fn clear_state(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.orch.reset();
    ApiResponse::ok("state cleared")
}

/// Delete the working repository and re-initialize it. The structurer is
/// stopped first so the single-writer rule holds.
#[utoipa::path(post, path = "/clear_repo", tag = "pipeline",
    responses((status = 200, body = ApiResponse), (status = 500, body = ApiResponse)))]
async fn clear_repo(
    State(state): State<SharedState>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state.supervisor.stop(AgentId::Structurer).await;
    let repo_dir = state.orch.config().paths.repo_dir;
    match repo::reset_repo(&repo_dir) {
        Ok(_) => {
            state.orch.clear_structure();
            Ok(ApiResponse::ok("repository cleared"))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse {
                success: false,
                message: e.to_string(),
            }),
        )),
    }
}

/// Replace the whole configuration; persisted before acknowledging
#[utoipa::path(post, path = "/update_config", tag = "config",
    responses((status = 200, body = ApiResponse), (status = 400, body = ApiResponse)))]
async fn update_config(
    State(state): State<SharedState>,
    Json(new): Json<OrchestratorConfig>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state.orch.update_config(new).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse {
                success: false,
                message: e.to_string(),
            }),
        )
    })?;
    Ok(ApiResponse::ok("config updated"))
}

/// Update a single dotted config key; persisted before acknowledging
#[utoipa::path(post, path = "/update_config_item", tag = "config",
    request_body = UpdateConfigItemRequest,
    responses((status = 200, body = ApiResponse), (status = 400, body = ApiResponse)))]
async fn update_config_item(
    State(state): State<SharedState>,
    Json(req): Json<UpdateConfigItemRequest>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state
        .orch
        .update_config_item(&req.key, req.value)
        .map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse {
                    success: false,
                    message: e.to_string(),
                }),
            )
        })?;
    Ok(ApiResponse::ok(format!("config key {} updated", req.key)))
}

async fn get_config(State(state): State<SharedState>) -> Json<OrchestratorConfig> {
    Json(state.orch.config())
}

/// File bytes from the working repository, or the binary sentinel.
async fn file_content(
    State(state): State<SharedState>,
    Query(query): Query<FileContentQuery>,
) -> impl IntoResponse {
    let repo_dir = state.orch.config().paths.repo_dir;
    match repo::read_content(&repo_dir, &query.path) {
        Ok(FileContent::Text(text)) => (StatusCode::OK, text),
        Ok(FileContent::Binary) => (StatusCode::OK, repo::binary_sentinel(&query.path)),
        Err(e) if e.to_string().contains("unsafe") => {
            (StatusCode::FORBIDDEN, "access denied: unsafe path".into())
        }
        Err(_) => (StatusCode::NOT_FOUND, "file not found".into()),
    }
}

// === Agent-Facing Handlers ===

async fn post_subtask(
    State(state): State<SharedState>,
    Json(req): Json<NewSubtask>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    let subtask = state.orch.enqueue_subtask(req).map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "status": "subtask received",
        "id": subtask.id,
    })))
}

async fn claim_task(
    State(state): State<SharedState>,
    Path(role): Path<String>,
    Query(query): Query<ClaimQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    let worker = query.worker.unwrap_or_else(|| "anonymous".to_string());
    let claimed = state
        .orch
        .claim_next(&role, &worker)
        .await
        .map_err(error_response)?;
    match claimed {
        Some(subtask) => Ok(Json(serde_json::json!({ "subtask": subtask }))),
        None => Ok(Json(serde_json::json!({
            "message": format!("no tasks available for {role}"),
        }))),
    }
}

async fn post_report(
    State(state): State<SharedState>,
    Json(report): Json<ReportSubmission>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state.orch.submit_report(report).map_err(error_response)?;
    Ok(ApiResponse::ok("report received"))
}

async fn post_accept(
    State(state): State<SharedState>,
    Json(req): Json<AcceptRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    let changed = state.orch.mark_accepted(&req.id).map_err(error_response)?;
    Ok(Json(serde_json::json!({
        "status": "accepted",
        "changed": changed,
    })))
}

async fn post_fail(
    State(state): State<SharedState>,
    Json(req): Json<FailRequest>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state
        .orch
        .mark_failed(&req.id, &req.reason)
        .map_err(error_response)?;
    Ok(ApiResponse::ok("subtask failed"))
}

async fn post_reject(
    State(state): State<SharedState>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    let status = state
        .orch
        .reject_subtask(&req.id, &req.text)
        .map_err(error_response)?;
    Ok(Json(serde_json::json!({ "status": status })))
}

async fn post_heartbeat(
    State(state): State<SharedState>,
    Path(agent): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state
        .orch
        .heartbeat(&agent, req.subtask_id.as_deref())
        .map_err(error_response)?;
    Ok(ApiResponse::ok("heartbeat recorded"))
}

async fn get_structure(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "structure": state.orch.structure() }))
}

async fn post_structure(
    State(state): State<SharedState>,
    Json(req): Json<StructurePost>,
) -> Result<Json<ApiResponse>, (StatusCode, Json<ApiResponse>)> {
    state
        .orch
        .update_structure(req.structure, req.commit)
        .map_err(error_response)?;
    Ok(ApiResponse::ok("structure received"))
}

async fn get_alignment(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.orch.alignment()).unwrap_or_default())
}

async fn align_coordinator(
    State(state): State<SharedState>,
    Json(proposal): Json<TreeProposal>,
) -> Json<serde_json::Value> {
    let alignment = state.orch.align_coordinator(proposal);
    Json(serde_json::to_value(alignment).unwrap_or_default())
}

async fn align_structurer(
    State(state): State<SharedState>,
    Json(proposal): Json<TreeProposal>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    let alignment = state
        .orch
        .align_structurer(proposal)
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(alignment).unwrap_or_default()))
}

async fn coordinator_reports(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.orch.drain_coordinator_reports()).unwrap_or_default())
}

async fn structurer_reports(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.orch.drain_structurer_reports()).unwrap_or_default())
}

async fn post_complete(State(state): State<SharedState>) -> Json<ApiResponse> {
    state.orch.complete_target();
    ApiResponse::ok("target complete")
}

async fn subtask_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiResponse>)> {
    match state.orch.subtask_status(&id) {
        Some(status) => Ok(Json(serde_json::json!({
            "subtask_id": id,
            "status": status,
        }))),
        None => Err(error_response(OrchestratorError::UnknownSubtask(id))),
    }
}

async fn all_subtask_statuses(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.orch.all_subtask_statuses()).unwrap_or_default())
}

// === Push Channel ===

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let subscription = state.orch.subscribe();
    tracing::info!("push-channel subscriber connected");

    // Full snapshot first, then the recent log tail, then deltas
    subscription.send(state.orch.full_status());
    for line in state.orch.log_tail(WS_LOG_REPLAY) {
        subscription.send(PushMessage::LogUpdate { line });
    }

    let mut ping = tokio::time::interval(Duration::from_secs(30));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = subscription.next() => {
                let message = match item {
                    OutboundItem::Message(message) => message,
                    OutboundItem::NeedFullSnapshot => state.orch.full_status(),
                };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                match tokio::time::timeout(WS_SEND_TIMEOUT, sender.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        // Slow subscriber: the delta is dropped here and the
                        // outbox keeps filling until it coalesces
                        tracing::warn!("push-channel send timed out, subscriber is slow");
                    }
                }
            }
            _ = ping.tick() => {
                subscription.send(PushMessage::Ping);
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(ClientRequest::GetFullStatus) => {
                                subscription.send(state.orch.full_status());
                            }
                            Ok(ClientRequest::GetChartUpdates) => {
                                let charts = state.orch.chart_data();
                                subscription.send(PushMessage::specific(
                                    conductor_core::orchestrator::SpecificFields {
                                        processed_over_time: Some(charts.processed_over_time),
                                        git_activity: Some(charts.git_activity),
                                        ..Default::default()
                                    },
                                ));
                            }
                            Err(_) => {
                                tracing::warn!(message = %text, "rejected untyped push-channel message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::info!("push-channel subscriber disconnected");
}

// === Logging ===

/// Tees formatted tracing output to the log file and into the orchestrator's
/// log ring (raw, ANSI included) for the push channel.
#[derive(Clone)]
struct LogTee {
    file: Arc<Mutex<std::fs::File>>,
    orch: Arc<Mutex<Option<Arc<Orchestrator>>>>,
}

impl LogTee {
    fn open(path: &std::path::Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            orch: Arc::new(Mutex::new(None)),
        })
    }

    fn attach(&self, orch: Arc<Orchestrator>) {
        *self.orch.lock() = Some(orch);
    }
}

impl std::io::Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        {
            let mut file = self.file.lock();
            let _ = file.write_all(buf);
        }
        if let Some(orch) = self.orch.lock().clone() {
            let text = String::from_utf8_lossy(buf);
            for line in text.lines().filter(|l| !l.is_empty()) {
                orch.log_line(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogTee {
    type Writer = LogTee;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// === CLI ===

#[derive(Parser)]
#[command(author, version, about = "Conductor - multi-agent code generation orchestrator")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the orchestrator service (default)
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one agent process
    Agent {
        #[command(subcommand)]
        kind: AgentCommand,
    },
}

#[derive(Subcommand)]
enum AgentCommand {
    /// The planning agent
    Coordinator,
    /// The persistence agent
    Structurer,
    /// A role worker
    Worker {
        /// executor, tester or documenter
        #[arg(long)]
        role: String,
    },
}

// === Server Entry ===

async fn run_server(
    config: OrchestratorConfig,
    config_file: std::path::PathBuf,
    port_override: Option<u16>,
) -> anyhow::Result<()> {
    let tee = LogTee::open(&config.paths.log_file)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(true)
        .with_writer(tee.clone())
        .init();

    let port = port_override.unwrap_or(config.web_port);
    let orch = Orchestrator::new(config.clone(), config_file);
    tee.attach(Arc::clone(&orch));

    // Resume the persisted structure snapshot, if any
    if let Ok(raw) = std::fs::read_to_string(&config.paths.structure_file) {
        match serde_json::from_str::<FileTree>(&raw) {
            Ok(tree) if !tree.is_empty() => {
                let _ = orch.update_structure(tree, None);
                tracing::info!("structure snapshot restored");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring unreadable structure snapshot"),
        }
    }

    orch.spawn_lease_sweeper();
    let supervisor = Supervisor::new(Arc::clone(&orch));

    let state: SharedState = Arc::new(AppState {
        orch,
        supervisor,
    });

    let app = Router::new()
        // Operator surface
        .route("/health", get(health))
        .route("/start_ai1", post(start_ai1))
        .route("/stop_ai1", post(stop_ai1))
        .route("/start_ai2", post(start_ai2))
        .route("/stop_ai2", post(stop_ai2))
        .route("/start_ai3", post(start_ai3))
        .route("/stop_ai3", post(stop_ai3))
        .route("/start_all", post(start_all))
        .route("/stop_all", post(stop_all))
        .route("/clear", post(clear_state))
        .route("/clear_repo", post(clear_repo))
        .route("/config", get(get_config))
        .route("/update_config", post(update_config))
        .route("/update_config_item", post(update_config_item))
        .route("/file_content", get(file_content))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .route("/ws", get(ws_endpoint))
        // Agent surface
        .route("/subtask", post(post_subtask))
        .route("/task/:role", get(claim_task))
        .route("/report", post(post_report))
        .route("/accept", post(post_accept))
        .route("/fail", post(post_fail))
        .route("/reject", post(post_reject))
        .route("/heartbeat/:agent", post(post_heartbeat))
        .route("/structure", get(get_structure).post(post_structure))
        .route("/alignment", get(get_alignment))
        .route("/alignment/coordinator", post(align_coordinator))
        .route("/alignment/structurer", post(align_structurer))
        .route("/reports/coordinator", get(coordinator_reports))
        .route("/reports/structurer", get(structurer_reports))
        .route("/complete", post(post_complete))
        .route("/subtask_status/:id", get(subtask_status))
        .route("/all_subtask_statuses", get(all_subtask_statuses))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "conductor server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// === Agent Entry ===

async fn run_agent(config: OrchestratorConfig, kind: AgentCommand) -> anyhow::Result<()> {
    // Agents log to stderr; the supervisor forwards it into the log stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();

    // Client timeout must cover the server-side long-poll window
    let request_timeout = Duration::from_secs(config.worker_poll_timeout_secs + 30);

    match kind {
        AgentCommand::Coordinator => {
            let api = ApiClient::new(&config.orchestrator_url, request_timeout)?;
            let model = config
                .agents
                .get(&AgentId::Coordinator)
                .cloned()
                .unwrap_or_default();
            let provider = create_client(&model)?;
            let mut agent = CoordinatorAgent::new(&config, api, provider);
            agent.run().await
        }
        AgentCommand::Structurer => {
            let api = ApiClient::new(&config.orchestrator_url, request_timeout)?;
            let model = config
                .agents
                .get(&AgentId::Structurer)
                .cloned()
                .unwrap_or_default();
            let provider = create_client(&model)?;
            let gateway = RepoGateway::open(&config.paths.repo_dir)?;
            let mut agent = StructurerAgent::new(&config, api, provider, gateway);
            agent.run().await
        }
        AgentCommand::Worker { role } => {
            let role = Role::parse(&role)
                .ok_or_else(|| anyhow::anyhow!("unknown worker role: {role}"))?;
            let api = ApiClient::new(&config.orchestrator_url, request_timeout)?;
            let model = config
                .agents
                .get(&AgentId::from(role))
                .cloned()
                .unwrap_or_default();
            let provider = create_client(&model)?;
            let agent = WorkerAgent::new(role, &config, api, provider);
            agent.run().await
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config_file = config_path();
    let config = OrchestratorConfig::load(&config_file)
        .map_err(|e| anyhow::anyhow!("cannot start without configuration: {e}"))?;

    match args.command {
        Some(CliCommand::Agent { kind }) => run_agent(config, kind).await,
        Some(CliCommand::Serve { port }) => run_server(config, config_file, port).await,
        None => run_server(config, config_file, None).await,
    }
}
