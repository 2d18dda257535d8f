use std::time::{Duration, Instant};

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::ResolvedConfig;
use crate::error::{LokiMcpError, Result};
use crate::model::{BackendResult, Operation, Payload};

pub const ORG_ID_HEADER: &str = "X-Scope-OrgID";

/// Loki HTTP 客户端：每次调用只发一次 GET，不重试。
#[derive(Clone)]
pub struct LokiClient {
    client: Client,
    timeout: Duration,
}

impl LokiClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub async fn execute(&self, url: Url, cfg: &ResolvedConfig, operation: Operation) -> Result<BackendResult> {
        let started = Instant::now();
        let path = url.path().to_string();

        let mut request = self.client.get(url).timeout(self.timeout);
        if let Some(token) = &cfg.token {
            request = request.bearer_auth(token);
        } else if let Some(username) = &cfg.username {
            request = request.basic_auth(username, cfg.password.as_deref());
        }
        if let Some(org) = &cfg.org_id {
            request = request.header(ORG_ID_HEADER, org);
        }

        let response = request.send().await.map_err(|e| {
            warn!(%path, error = %e, "Loki request failed");
            LokiMcpError::BackendUnreachable(e.to_string())
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LokiMcpError::BackendUnreachable(format!("reading response body: {e}")))?;
        debug!(
            %path,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loki responded"
        );

        if !status.is_success() {
            return Err(LokiMcpError::BackendHttp {
                status: status.as_u16(),
                body: body.trim_end().to_string(),
            });
        }

        decode(&body, operation)
    }
}

/// 解析响应体：必须是带 `status` 字段的 JSON 对象，并符合该操作的结构。
pub fn decode(body: &str, operation: Operation) -> Result<BackendResult> {
    let raw: Value = serde_json::from_str(body).map_err(|e| LokiMcpError::BackendDecode(e.to_string()))?;
    if !raw.get("status").is_some_and(Value::is_string) {
        return Err(LokiMcpError::BackendDecode(
            "response envelope has no `status` field".to_string(),
        ));
    }

    let payload = match operation {
        Operation::Query => Payload::Query(typed(&raw)?),
        Operation::LabelNames => Payload::LabelNames(typed(&raw)?),
        Operation::LabelValues => Payload::LabelValues(typed(&raw)?),
    };
    Ok(BackendResult { raw, payload })
}

fn typed<T: DeserializeOwned>(raw: &Value) -> Result<T> {
    T::deserialize(raw).map_err(|e| LokiMcpError::BackendDecode(e.to_string()))
}
