use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loki_mcp::backend::LokiClient;
use loki_mcp::config::{
    EnvSnapshot, ServerConfig, ServerMode, ENV_LOKI_ORG_ID, ENV_LOKI_PASSWORD, ENV_LOKI_TOKEN, ENV_LOKI_URL,
    ENV_LOKI_USERNAME,
};
use loki_mcp::endpoint::redact_userinfo;
use loki_mcp::http::serve_http;
use loki_mcp::mcp::run_stdio;
use loki_mcp::tools::LokiTools;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout 留给 stdio 传输，日志统一写 stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::parse();
    info!(version = env!("CARGO_PKG_VERSION"), mode = ?config.mode, "Loki MCP server starting");

    let env = EnvSnapshot::capture();
    log_backend_config(&env);

    let client = LokiClient::new(config.query_timeout());
    let tools = Arc::new(LokiTools::new(client, env));

    match config.mode {
        ServerMode::Http => {
            serve_http(tools, &config.http_addr()).await?;
        }
        ServerMode::Stdio => {
            run_stdio(tools).await?;
        }
        ServerMode::Both => {
            let addr = config.http_addr();
            let http_tools = tools.clone();
            let http_task = tokio::spawn(async move { serve_http(http_tools, &addr).await });
            let stdio_task = tokio::spawn(async move { run_stdio(tools).await });
            let (http_res, stdio_res) = tokio::join!(http_task, stdio_task);
            http_res.context("http task panicked")??;
            stdio_res.context("stdio task panicked")??;
        }
    }

    info!("server stopped");
    Ok(())
}

fn log_backend_config(env: &EnvSnapshot) {
    let plain = |key: &str| env.get(key).unwrap_or("not set").to_string();
    let secret = |key: &str| {
        if env.get(key).is_some() {
            "****** (set)"
        } else {
            "not set"
        }
    };
    info!(
        url = %redact_userinfo(&plain(ENV_LOKI_URL)),
        org_id = %plain(ENV_LOKI_ORG_ID),
        username = %plain(ENV_LOKI_USERNAME),
        password = secret(ENV_LOKI_PASSWORD),
        token = secret(ENV_LOKI_TOKEN),
        "Loki backend defaults"
    );
    if env.get(ENV_LOKI_URL).is_none() {
        info!("{ENV_LOKI_URL} not set; requests without `url` go to {}", loki_mcp::config::DEFAULT_LOKI_URL);
    }
}
