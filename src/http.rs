use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use crate::error::{LokiMcpError, Result};
use crate::mcp::{process_request, RpcRequest, RpcResponse};
use crate::tools::LokiTools;

type Sessions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>;

#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<LokiTools>,
    pub sessions: Sessions,
}

impl AppState {
    pub fn new(tools: Arc<LokiTools>) -> Self {
        Self {
            tools,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

fn drop_session(sessions: &Sessions, session_id: &str) {
    if let Ok(mut sessions) = sessions.write() {
        if sessions.remove(session_id).is_some() {
            info!(%session_id, "sse session closed");
        }
    }
}

/// Push one event to an SSE session; a closed stream removes the session.
fn deliver(sessions: &Sessions, session_id: &str, sender: &mpsc::UnboundedSender<Event>, event: Event) -> bool {
    if sender.send(event).is_err() {
        drop_session(sessions, session_id);
        return false;
    }
    true
}

/// Streamable HTTP，无状态：一条请求对应一条 JSON 响应。
async fn mcp_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RpcRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(e) => {
            let resp = RpcResponse::error(Value::Null, -32700, format!("parse error: {e}"));
            return (StatusCode::BAD_REQUEST, Json(resp)).into_response();
        }
    };

    // 客户端断开时 axum 丢弃该 future，进行中的 Loki 请求随之取消
    match process_request(state.tools.clone(), req).await {
        Some(resp) => (StatusCode::OK, Json(resp)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn sse_handler(State(state): State<AppState>) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let session_id = format!("{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));

    let endpoint_url = format!("/message?session_id={}", session_id);
    let _ = tx.send(Event::default().event("endpoint").data(endpoint_url));

    if let Ok(mut sessions) = state.sessions.write() {
        sessions.retain(|_, sender| !sender.is_closed());
        sessions.insert(session_id.clone(), tx);
    }
    info!(%session_id, "sse session opened");

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, axum::Error>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(state): State<AppState>,
    Query(q): Query<MessageQuery>,
    Json(req): Json<RpcRequest>,
) -> impl IntoResponse {
    let sender = state
        .sessions
        .read()
        .ok()
        .and_then(|sessions| sessions.get(&q.session_id).cloned());

    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND;
    };
    if sender.is_closed() {
        drop_session(&state.sessions, &q.session_id);
        return StatusCode::NOT_FOUND;
    }

    let tools = state.tools.clone();
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        if let Some(resp) = process_request(tools, req).await {
            if let Ok(json_str) = serde_json::to_string(&resp) {
                deliver(&sessions, &q.session_id, &sender, Event::default().event("message").data(json_str));
            }
        }
    });
    StatusCode::ACCEPTED
}

async fn health_handler() -> &'static str {
    "ok"
}

pub fn build_router(tools: Arc<LokiTools>) -> Router {
    router(AppState::new(tools))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn serve_http(tools: Arc<LokiTools>, addr: &str) -> Result<()> {
    let router = build_router(tools);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| LokiMcpError::ConfigError(format!("bind {addr} failed: {e}")))?;
    info!("HTTP server listening on http://{addr} (streamable endpoint /mcp, legacy SSE /sse)");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(LokiMcpError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
