//! HTTP gateway.
//!
//! All state-changing and snapshot endpoints live under `/api/` behind a
//! bearer-token middleware. The one exception is `/api/events`, which
//! authenticates via a `token` query parameter because EventSource
//! cannot set headers. `/health` is open.
//!
//! ```text
//! POST /api/chat             {message}  → SSE turn stream, or command JSON
//! POST /api/command          {command}  → JSON
//! GET  /api/events?token=…              → SSE subscription to the bus
//! GET  /api/status                      → active tasks, progress, approvals
//! GET  /api/history?n=…                 → transcript tail
//! POST /api/approval         {permissionId, decision, note?}
//! POST /api/sandbox/dispose  {taskId}
//! GET  /api/bg-tasks                    → full task listing
//! GET  /health                          → liveness
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agent::{Agent, PermissionDecision, StreamEvent};
use crate::approval::ApprovalManager;
use crate::bus::{EventBus, SseEvent};
use crate::chat::ChatLock;
use crate::commands::{self, ParsedInput, SlashCommand};
use crate::history::{HistoryStore, Role};
use crate::injection::InjectionQueue;
use crate::progress::ProgressTracker;
use crate::scheduler::TaskRunner;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    pub parent: Arc<dyn Agent>,
    pub chat_lock: Arc<ChatLock>,
    pub bus: EventBus,
    pub approvals: Arc<ApprovalManager>,
    pub progress: Arc<ProgressTracker>,
    pub history: Arc<HistoryStore>,
    pub injector: Arc<InjectionQueue>,
    pub auth_token: String,
}

/// Build the router with auth applied to everything except
/// `/api/events` and `/health`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/command", post(command))
        .route("/api/status", get(status))
        .route("/api/history", get(history))
        .route("/api/approval", post(approval))
        .route("/api/sandbox/dispose", post(dispose_sandbox))
        .route("/api/bg-tasks", get(bg_tasks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_middleware,
        ))
        .route("/api/events", get(events))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}

/// Reject requests without the configured bearer token.
async fn bearer_auth_middleware(
    State(state): State<AppState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.auth_token);

    if authorized {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "missing or invalid token")
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

// -- Handlers --

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    message: String,
}

/// Chat entry point. Slash commands answer as JSON; anything else
/// becomes a streaming turn against the parent agent, serialized with
/// injections through the chat lock.
async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Response {
    match commands::parse(&body.message) {
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Ok(ParsedInput::Command(cmd)) => Json(run_command(&state, cmd)).into_response(),
        Ok(ParsedInput::Chat(message)) => {
            state.history.push(Role::User, message.as_str());

            let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);
            tokio::spawn(stream_user_turn(state, message, tx));

            Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
                .keep_alive(KeepAlive::default())
                .into_response()
        }
    }
}

/// Run one user turn under the chat lock, forwarding events to the
/// request's SSE channel. A dropped client ends the forwarding but the
/// turn itself runs to completion so history stays coherent.
async fn stream_user_turn(
    state: AppState,
    message: String,
    tx: tokio::sync::mpsc::Sender<Event>,
) {
    let _guard = state.chat_lock.acquire().await;

    let mut stream = match state.parent.chat_stream(&message).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Parent turn failed to start: {}", e);
            let event = SseEvent::Error {
                message: e.to_string(),
            };
            let _ = tx.send(sse_frame(&event)).await;
            return;
        }
    };

    let mut text = String::new();
    let mut client_gone = false;
    while let Some(event) = stream.next().await {
        let mapped = match event {
            StreamEvent::TextChunk { delta } => {
                text.push_str(&delta);
                Some(SseEvent::Text { delta })
            }
            StreamEvent::ThinkChunk { delta } => Some(SseEvent::Thinking { delta }),
            StreamEvent::ToolStart { call } => Some(SseEvent::ToolStart { call }),
            StreamEvent::ToolEnd { call } => Some(SseEvent::ToolEnd { call }),
            StreamEvent::ToolError { call, error } => {
                Some(SseEvent::ToolError { call, error })
            }
            StreamEvent::Done { reason } => Some(SseEvent::Done { reason }),
            StreamEvent::TextChunkStart | StreamEvent::ThinkChunkStart => None,
        };
        if let Some(event) = mapped
            && !client_gone
            && tx.send(sse_frame(&event)).await.is_err()
        {
            client_gone = true;
        }
    }

    if !text.is_empty() {
        state.history.push(Role::Assistant, text);
    }
}

fn sse_frame(event: &SseEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => Event::default().data(format!("{{\"type\":\"error\",\"data\":{{\"message\":\"{}\"}}}}", e)),
    }
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

async fn command(State(state): State<AppState>, Json(body): Json<CommandBody>) -> Response {
    match commands::parse(&body.command) {
        Err(e) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Ok(ParsedInput::Chat(_)) => error_response(
            StatusCode::BAD_REQUEST,
            "not a command; use /api/chat for chat messages",
        ),
        Ok(ParsedInput::Command(cmd)) => Json(run_command(&state, cmd)).into_response(),
    }
}

fn run_command(state: &AppState, cmd: SlashCommand) -> serde_json::Value {
    match cmd {
        SlashCommand::Confirm { permission_id } => {
            if state
                .approvals
                .decide(&permission_id, PermissionDecision::Allow, None)
            {
                json!({ "ok": true, "permission_id": permission_id, "decision": "allow" })
            } else {
                json!({ "ok": false, "error": format!("unknown permission request: {}", permission_id) })
            }
        }
        SlashCommand::Cancel { permission_id } => {
            if state
                .approvals
                .decide(&permission_id, PermissionDecision::Deny, None)
            {
                json!({ "ok": true, "permission_id": permission_id, "decision": "deny" })
            } else {
                json!({ "ok": false, "error": format!("unknown permission request: {}", permission_id) })
            }
        }
        SlashCommand::Status => status_payload(state),
        SlashCommand::History { limit } => {
            json!({ "ok": true, "history": state.history.recent(limit) })
        }
        SlashCommand::Help => json!({ "ok": true, "help": commands::help_text() }),
    }
}

fn status_payload(state: &AppState) -> serde_json::Value {
    let active: Vec<_> = state
        .runner
        .active_tasks()
        .iter()
        .map(|t| t.snapshot())
        .collect();
    let queued: Vec<_> = state
        .runner
        .queued_tasks()
        .iter()
        .map(|t| t.snapshot())
        .collect();
    json!({
        "ok": true,
        "active_tasks": active,
        "queued_tasks": queued,
        "progress": state.progress.snapshots(),
        "pending_approvals": state.approvals.snapshots(),
        "chat_locked": state.chat_lock.is_locked(),
        "injection_depth": state.injector.depth(),
    })
}

async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(status_payload(&state))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    n: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "history": state.history.recent(params.n) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalBody {
    permission_id: String,
    decision: PermissionDecision,
    note: Option<String>,
}

async fn approval(State(state): State<AppState>, Json(body): Json<ApprovalBody>) -> Response {
    if state
        .approvals
        .decide(&body.permission_id, body.decision, body.note)
    {
        Json(json!({ "ok": true })).into_response()
    } else {
        error_response(
            StatusCode::NOT_FOUND,
            &format!("unknown permission request: {}", body.permission_id),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisposeSandboxBody {
    task_id: Uuid,
}

async fn dispose_sandbox(
    State(state): State<AppState>,
    Json(body): Json<DisposeSandboxBody>,
) -> Response {
    if state.runner.task(body.task_id).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            &format!("unknown task: {}", body.task_id),
        );
    }
    let disposed = state.runner.dispose_sandbox(body.task_id).await;
    Json(json!({ "ok": true, "disposed": disposed })).into_response()
}

async fn bg_tasks(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tasks: Vec<_> = state
        .runner
        .all_tasks()
        .iter()
        .map(|t| t.snapshot())
        .collect();
    Json(json!({ "ok": true, "tasks": tasks }))
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    token: Option<String>,
}

/// SSE subscription to the broadcast bus. Lagged consumers skip missed
/// events rather than erroring out.
async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Response {
    if params.token.as_deref() != Some(state.auth_token.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid token");
    }

    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(|item| async move {
        match item {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json.as_str()))),
            Err(_lagged) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::approval::PermissionBridge;
    use crate::config::Config;
    use crate::safety::CommandPolicy;
    use crate::sandbox::{SandboxKind, SandboxRegistry};
    use crate::scheduler::{RunnerDeps, StartOptions};
    use crate::testing::{StubAgent, StubAgentFactory, StubSandboxFactory};

    use super::*;

    const TOKEN: &str = "test-token";

    fn test_state() -> AppState {
        let cfg = Config::default();
        let bus = EventBus::default();
        let approvals = Arc::new(ApprovalManager::new());
        let bridge = Arc::new(PermissionBridge::new(
            Arc::clone(&approvals),
            CommandPolicy::default(),
            bus.clone(),
        ));
        let progress = Arc::new(ProgressTracker::new(cfg.progress.interval, bus.clone()));
        let runner = TaskRunner::new(
            cfg.scheduler.clone(),
            cfg.keep_alive.clone(),
            cfg.injection.clone(),
            RunnerDeps {
                agent_factory: StubAgentFactory::new(),
                sandbox_factory: StubSandboxFactory::new(),
                sandbox_kind: SandboxKind::Local,
                registry: Arc::new(SandboxRegistry::new()),
                bridge,
                bus: bus.clone(),
                progress: Arc::clone(&progress),
            },
        );
        let parent: Arc<dyn Agent> = StubAgent::new([]);
        let chat_lock = Arc::new(ChatLock::new());
        let history = Arc::new(HistoryStore::new());
        let injector = InjectionQueue::new(
            Arc::clone(&parent),
            bus.clone(),
            Arc::clone(&chat_lock),
            Arc::clone(&history),
        );
        runner.set_injector(Arc::clone(&injector));

        AppState {
            runner,
            parent,
            chat_lock,
            bus,
            approvals,
            progress,
            history,
            injector,
            auth_token: TOKEN.to_string(),
        }
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TOKEN))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_requires_no_auth() {
        let router = router(test_state());
        let resp = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_route_rejects_missing_token() {
        let router = router(test_state());
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/api/bg-tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_route_rejects_wrong_token() {
        let router = router(test_state());
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/api/bg-tasks")
                    .header("Authorization", "Bearer bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn events_rejects_wrong_query_token() {
        let router = router(test_state());
        let resp = router
            .oneshot(
                Request::builder()
                    .uri("/api/events?token=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bg_tasks_lists_started_tasks() {
        let state = test_state();
        let id = state
            .runner
            .start("executor", "do it", "demo", StartOptions::default());
        let router = router(state);

        let resp = router
            .oneshot(
                authed(Request::builder().uri("/api/bg-tasks"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let tasks = json["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], id.to_string());
    }

    #[tokio::test]
    async fn approval_unknown_id_is_404() {
        let router = router(test_state());
        let body = serde_json::json!({
            "permissionId": "nope",
            "decision": "allow"
        });
        let resp = router
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/approval"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dispose_sandbox_unknown_task_is_404() {
        let router = router(test_state());
        let body = serde_json::json!({ "taskId": Uuid::new_v4() });
        let resp = router
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/sandbox/dispose"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn help_command_answers_as_json() {
        let router = router(test_state());
        let body = serde_json::json!({ "command": "/help" });
        let resp = router
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/command"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert!(json["help"].as_str().unwrap().contains("/confirm"));
    }

    #[tokio::test]
    async fn command_endpoint_refuses_plain_chat() {
        let router = router(test_state());
        let body = serde_json::json!({ "command": "hello" });
        let resp = router
            .oneshot(
                authed(Request::builder().method("POST").uri("/api/command"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_shape() {
        let router = router(test_state());
        let resp = router
            .oneshot(
                authed(Request::builder().uri("/api/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["ok"], true);
        assert!(json["active_tasks"].is_array());
        assert!(json["pending_approvals"].is_array());
        assert_eq!(json["chat_locked"], false);
    }

    #[tokio::test]
    async fn history_endpoint_honors_limit() {
        let state = test_state();
        state.history.push(Role::User, "one");
        state.history.push(Role::User, "two");
        state.history.push(Role::User, "three");
        let router = router(state);

        let resp = router
            .oneshot(
                authed(Request::builder().uri("/api/history?n=2"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(resp).await;
        let entries = json["history"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["text"], "two");
    }
}
