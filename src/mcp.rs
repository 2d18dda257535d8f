use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::tools::{tool_definitions, LokiTools};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// JSON-RPC notifications carry no id and expect no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallToolParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// 处理一条 JSON-RPC 消息；通知类消息返回 None。
pub async fn process_request(tools: Arc<LokiTools>, req: RpcRequest) -> Option<RpcResponse> {
    debug!(method = %req.method, id = %req.id, "rpc request");
    let resp = match req.method.as_str() {
        "initialize" => handle_initialize(&req),
        "ping" => RpcResponse::ok(req.id.clone(), json!({})),
        "tools/list" => RpcResponse::ok(req.id.clone(), json!({ "tools": tool_definitions() })),
        "tools/call" => handle_call_tool(&tools, &req).await,
        method if method.starts_with("notifications/") => return None,
        _ => RpcResponse::error(req.id.clone(), -32601, format!("method not found: {}", req.method)),
    };
    if req.is_notification() {
        return None;
    }
    Some(resp)
}

fn handle_initialize(req: &RpcRequest) -> RpcResponse {
    RpcResponse::ok(
        req.id.clone(),
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": {}
            },
            "serverInfo": {
                "name": "loki-mcp",
                "version": env!("CARGO_PKG_VERSION")
            }
        }),
    )
}

async fn handle_call_tool(tools: &LokiTools, req: &RpcRequest) -> RpcResponse {
    let params: CallToolParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return RpcResponse::error(req.id.clone(), -32602, format!("invalid params: {e}")),
    };

    match tools.call(&params.name, params.arguments).await {
        Ok(text) => RpcResponse::ok(req.id.clone(), tool_result(text, false)),
        Err(e) if e.is_protocol_error() => RpcResponse::error(req.id.clone(), -32602, e.to_string()),
        Err(e) => RpcResponse::ok(req.id.clone(), tool_result(e.to_string(), true)),
    }
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

/// Id of the request a `notifications/cancelled` message refers to.
fn cancelled_request_id(req: &RpcRequest) -> Option<String> {
    if req.method != "notifications/cancelled" {
        return None;
    }
    req.params.get("requestId").map(Value::to_string)
}

/// 标准输入输出传输。
pub async fn run_stdio(tools: Arc<LokiTools>) -> Result<()> {
    serve_lines(tools, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// 逐行读取 JSON-RPC，每个请求独立任务执行，响应经单一写者输出。
pub async fn serve_lines<R, W>(tools: Arc<LokiTools>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = input.lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();

    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            if let Err(e) = write_response(&mut output, &resp).await {
                warn!(error = %e, "failed to write response");
                break;
            }
        }
    });

    let mut in_flight: HashMap<String, AbortHandle> = HashMap::new();
    info!("stdio transport ready");

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        in_flight.retain(|_, handle| !handle.is_finished());

        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(RpcResponse::error(Value::Null, -32700, format!("parse error: {e}")));
                continue;
            }
        };

        if let Some(id) = cancelled_request_id(&req) {
            if let Some(handle) = in_flight.remove(&id) {
                info!(request_id = %id, "cancelling in-flight request");
                handle.abort();
            }
            continue;
        }

        let key = (!req.is_notification()).then(|| req.id.to_string());
        let tools = tools.clone();
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            if let Some(resp) = process_request(tools, req).await {
                let _ = tx.send(resp);
            }
        });
        if let Some(key) = key {
            in_flight.insert(key, task.abort_handle());
        }
    }

    drop(tx);
    // 输入结束后等待已发出的请求把响应写完
    let _ = writer.await;
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(out: &mut W, resp: &RpcResponse) -> Result<()> {
    let line = serde_json::to_string(resp).unwrap_or_else(|_| "{}".to_string());
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
