use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};

use loki_mcp::mcp::RpcResponse;
use loki_mcp::tools::{LOKI_LABEL_NAMES, LOKI_LABEL_VALUES, LOKI_QUERY};

/// Command-line client for the Loki MCP server.
#[derive(Debug, Parser)]
#[command(name = "loki-mcp-client", version)]
struct Cli {
    /// Streamable HTTP endpoint of the server.
    #[arg(long, env = "MCP_SERVER_URL", default_value = "http://localhost:8000/mcp")]
    server_url: String,

    /// Request timeout in seconds.
    #[arg(long, env = "LOKI_QUERY_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a LogQL query.
    LokiQuery {
        query: String,
        #[arg(long)]
        limit: Option<f64>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List label names.
    LokiLabelNames {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List values of one label.
    LokiLabelValues {
        label: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List the tools the server exposes.
    ListTools,
}

#[derive(Debug, Default, Args)]
struct CommonArgs {
    /// Loki base URL; the server falls back to LOKI_URL.
    #[arg(long)]
    url: Option<String>,
    /// `now`, a relative offset such as `-1h`, or RFC 3339.
    #[arg(long, allow_hyphen_values = true)]
    start: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    end: Option<String>,
    #[arg(long)]
    org: Option<String>,
    #[arg(long)]
    format: Option<String>,
}

impl CommonArgs {
    fn into_arguments(self) -> Map<String, Value> {
        let mut args = Map::new();
        for (key, value) in [
            ("url", self.url),
            ("start", self.start),
            ("end", self.end),
            ("org", self.org),
            ("format", self.format),
        ] {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                args.insert(key.to_string(), Value::String(v));
            }
        }
        args
    }
}

impl Command {
    /// JSON-RPC method and params for this command.
    fn to_rpc(self) -> (&'static str, Value) {
        let (name, arguments) = match self {
            Command::ListTools => return ("tools/list", json!({})),
            Command::LokiQuery { query, limit, common } => {
                let mut args = common.into_arguments();
                args.insert("query".into(), Value::String(query));
                if let Some(limit) = limit.filter(|l| *l > 0.0) {
                    args.insert("limit".into(), json!(limit));
                }
                (LOKI_QUERY, args)
            }
            Command::LokiLabelNames { common } => (LOKI_LABEL_NAMES, common.into_arguments()),
            Command::LokiLabelValues { label, common } => {
                let mut args = common.into_arguments();
                args.insert("label".into(), Value::String(label));
                (LOKI_LABEL_VALUES, args)
            }
        };
        ("tools/call", json!({ "name": name, "arguments": arguments }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cli.timeout.max(1)))
        .build()
        .context("building HTTP client")?;

    let (method, params) = cli.command.to_rpc();
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let resp: RpcResponse = client
        .post(&cli.server_url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("calling {}", cli.server_url))?
        .error_for_status()?
        .json()
        .await
        .context("decoding server response")?;

    if let Some(err) = resp.error {
        bail!("server error {}: {}", err.code, err.message);
    }
    let result = resp.result.unwrap_or(Value::Null);

    if method == "tools/list" {
        println!("Available tools:");
        for tool in result["tools"].as_array().into_iter().flatten() {
            println!(
                "  - {}: {}",
                tool["name"].as_str().unwrap_or_default(),
                tool["description"].as_str().unwrap_or_default()
            );
        }
        return Ok(());
    }

    for text in text_blocks(&result) {
        println!("{text}");
    }
    if result["isError"].as_bool().unwrap_or(false) {
        std::process::exit(1);
    }
    Ok(())
}

fn text_blocks(result: &Value) -> Vec<&str> {
    result["content"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|c| c["type"] == "text")
        .filter_map(|c| c["text"].as_str())
        .collect()
}
