use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;

use crate::backend::LokiClient;
use crate::config::{EnvSnapshot, ResolvedConfig};
use crate::endpoint::{build_url, Endpoint};
use crate::error::{LokiMcpError, Result};
use crate::format::format_result;
use crate::model::{LabelNamesArgs, LabelValuesArgs, Operation, OutputFormat, QueryArgs};
use crate::timeexpr::resolve_range;

pub const LOKI_QUERY: &str = "loki_query";
pub const LOKI_LABEL_NAMES: &str = "loki_label_names";
pub const LOKI_LABEL_VALUES: &str = "loki_label_values";

/// 一次工具调用在访问网络之前的全部决策结果。
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub url: Url,
    pub operation: Operation,
    pub config: ResolvedConfig,
    pub format: OutputFormat,
}

impl PreparedCall {
    fn new(endpoint: &Endpoint<'_>, config: ResolvedConfig, format: OutputFormat) -> Result<Self> {
        let url = build_url(&config.url, endpoint)?;
        Ok(Self {
            url,
            operation: endpoint.operation(),
            config,
            format,
        })
    }
}

/// Tool handlers. Holds only immutable state, so one instance serves concurrent calls.
#[derive(Clone)]
pub struct LokiTools {
    client: LokiClient,
    env: EnvSnapshot,
}

impl LokiTools {
    pub fn new(client: LokiClient, env: EnvSnapshot) -> Self {
        Self { client, env }
    }

    /// Dispatch a `tools/call` by name and return the rendered text.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<String> {
        let started = Instant::now();
        let result = match name {
            LOKI_QUERY => self.query(decode_args(arguments)?).await,
            LOKI_LABEL_NAMES => self.label_names(decode_args(arguments)?).await,
            LOKI_LABEL_VALUES => self.label_values(decode_args(arguments)?).await,
            other => return Err(LokiMcpError::UnknownTool(other.to_string())),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(text) => info!(tool = name, elapsed_ms, bytes = text.len(), "tool call succeeded"),
            Err(e) => warn!(tool = name, elapsed_ms, error = %e, "tool call failed"),
        }
        result
    }

    pub async fn query(&self, args: QueryArgs) -> Result<String> {
        let prepared = prepare_query(&args, &self.env, Utc::now())?;
        self.run(prepared).await
    }

    pub async fn label_names(&self, args: LabelNamesArgs) -> Result<String> {
        let prepared = prepare_label_names(&args, &self.env, Utc::now())?;
        self.run(prepared).await
    }

    pub async fn label_values(&self, args: LabelValuesArgs) -> Result<String> {
        let prepared = prepare_label_values(&args, &self.env, Utc::now())?;
        self.run(prepared).await
    }

    async fn run(&self, prepared: PreparedCall) -> Result<String> {
        let result = self
            .client
            .execute(prepared.url, &prepared.config, prepared.operation)
            .await?;
        format_result(&result, prepared.format)
    }
}

fn decode_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| LokiMcpError::ArgumentDecode(e.to_string()))
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LokiMcpError::ArgumentDecode(format!("`{field}` must not be empty")));
    }
    Ok(())
}

/// `.` and `..` would be collapsed by URL path normalisation and hit another endpoint.
fn require_path_segment(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    if matches!(value, "." | "..") {
        return Err(LokiMcpError::ArgumentDecode(format!("`{field}` must not be `{value}`")));
    }
    Ok(())
}

pub fn prepare_query(args: &QueryArgs, env: &EnvSnapshot, now: DateTime<Utc>) -> Result<PreparedCall> {
    require_non_empty("query", &args.query)?;
    let format = OutputFormat::from_arg(args.format.as_deref())?;
    let config = ResolvedConfig::resolve(&args.connection, env);
    let range = resolve_range(&args.time, now)?;
    let endpoint = Endpoint::QueryRange {
        query: &args.query,
        range,
        limit: args.effective_limit(),
    };
    PreparedCall::new(&endpoint, config, format)
}

pub fn prepare_label_names(args: &LabelNamesArgs, env: &EnvSnapshot, now: DateTime<Utc>) -> Result<PreparedCall> {
    let format = OutputFormat::from_arg(args.format.as_deref())?;
    let config = ResolvedConfig::resolve(&args.connection, env);
    let range = resolve_range(&args.time, now)?;
    PreparedCall::new(&Endpoint::LabelNames { range }, config, format)
}

pub fn prepare_label_values(args: &LabelValuesArgs, env: &EnvSnapshot, now: DateTime<Utc>) -> Result<PreparedCall> {
    require_path_segment("label", &args.label)?;
    let format = OutputFormat::from_arg(args.format.as_deref())?;
    let config = ResolvedConfig::resolve(&args.connection, env);
    let range = resolve_range(&args.time, now)?;
    let endpoint = Endpoint::LabelValues {
        label: &args.label,
        range,
    };
    PreparedCall::new(&endpoint, config, format)
}

fn connection_properties() -> serde_json::Map<String, Value> {
    let props = json!({
        "url": { "type": "string", "description": "Loki server URL" },
        "username": { "type": "string", "description": "Username for basic authentication" },
        "password": { "type": "string", "description": "Password for basic authentication" },
        "token": { "type": "string", "description": "Bearer token for authentication" },
        "start": { "type": "string", "description": "Start time for the query (now, -1h, or RFC 3339)" },
        "end": { "type": "string", "description": "End time for the query (now, -5m, or RFC 3339)" },
        "org": { "type": "string", "description": "Organization ID for the query" },
        "format": {
            "type": "string",
            "enum": ["raw", "json", "text"],
            "description": "Output format: raw, json, or text"
        }
    });
    match props {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn tool(name: &str, description: &str, extra: Value, required: &[&str]) -> Value {
    let mut properties = connection_properties();
    if let Value::Object(extra) = extra {
        properties.extend(extra);
    }
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": properties,
            "required": required
        }
    })
}

/// Tool catalogue served by `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        tool(
            LOKI_QUERY,
            "Run a query against Grafana Loki",
            json!({
                "query": { "type": "string", "description": "LogQL query string" },
                "limit": { "type": "number", "description": "Maximum number of entries to return" }
            }),
            &["query"],
        ),
        tool(LOKI_LABEL_NAMES, "Get all label names from Grafana Loki", json!({}), &[]),
        tool(
            LOKI_LABEL_VALUES,
            "Get all values for a specific label from Grafana Loki",
            json!({
                "label": { "type": "string", "description": "Label name to get values for" }
            }),
            &["label"],
        ),
    ]
}
