use std::collections::HashMap;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::model::ConnectionArgs;

pub const ENV_LOKI_URL: &str = "LOKI_URL";
pub const ENV_LOKI_ORG_ID: &str = "LOKI_ORG_ID";
pub const ENV_LOKI_USERNAME: &str = "LOKI_USERNAME";
pub const ENV_LOKI_PASSWORD: &str = "LOKI_PASSWORD";
pub const ENV_LOKI_TOKEN: &str = "LOKI_TOKEN";

pub const DEFAULT_LOKI_URL: &str = "http://localhost:3100";

const SNAPSHOT_KEYS: &[&str] = &[
    ENV_LOKI_URL,
    ENV_LOKI_ORG_ID,
    ENV_LOKI_USERNAME,
    ENV_LOKI_PASSWORD,
    ENV_LOKI_TOKEN,
];

/// 进程环境变量的只读快照，启动时采集一次，之后不再读取真实环境。
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        Self::from_pairs(
            SNAPSHOT_KEYS
                .iter()
                .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v))),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// 显式参数 > 环境变量 > 默认值；空字符串视为未设置。
pub fn resolve_setting(explicit: Option<&str>, env: Option<&str>, fallback: &str) -> String {
    explicit
        .filter(|v| !v.is_empty())
        .or_else(|| env.filter(|v| !v.is_empty()))
        .unwrap_or(fallback)
        .to_string()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Connection settings after precedence resolution. Absent credentials stay `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub org_id: Option<String>,
}

impl ResolvedConfig {
    pub fn resolve(args: &ConnectionArgs, env: &EnvSnapshot) -> Self {
        let field = |explicit: &Option<String>, key: &str, fallback: &str| {
            resolve_setting(explicit.as_deref(), env.get(key), fallback)
        };
        Self {
            url: field(&args.url, ENV_LOKI_URL, DEFAULT_LOKI_URL),
            username: non_empty(field(&args.username, ENV_LOKI_USERNAME, "")),
            password: non_empty(field(&args.password, ENV_LOKI_PASSWORD, "")),
            token: non_empty(field(&args.token, ENV_LOKI_TOKEN, "")),
            org_id: non_empty(field(&args.org, ENV_LOKI_ORG_ID, "")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServerMode {
    Stdio,
    Http,
    Both,
}

/// MCP server that exposes Grafana Loki queries as tools.
#[derive(Debug, Clone, Parser)]
#[command(name = "loki-mcp", version)]
pub struct ServerConfig {
    /// Transport to serve.
    #[arg(long, env = "MCP_MODE", value_enum, default_value = "http")]
    pub mode: ServerMode,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Upper bound for a single Loki request, in seconds.
    #[arg(long, env = "LOKI_QUERY_TIMEOUT", default_value_t = 30)]
    pub query_timeout: u64,
}

impl ServerConfig {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout.max(1))
    }
}
