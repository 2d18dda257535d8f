use thiserror::Error;

pub type Result<T> = std::result::Result<T, LokiMcpError>;

/// 工具调用链路上的全部错误。Display 文本会原样返回给调用方，
/// 因此每个变体都标明失败的阶段。
#[derive(Debug, Error)]
pub enum LokiMcpError {
    #[error("invalid arguments: {0}")]
    ArgumentDecode(String),

    #[error("invalid {field} time: `{input}` (expected `now`, `-<n>[s|m|h|d]` or an RFC 3339 timestamp)")]
    InvalidTimeExpression { field: &'static str, input: String },

    #[error("failed to build Loki URL from `{url}`: {reason}")]
    MalformedBaseUrl { url: String, reason: String },

    #[error("Loki unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Loki returned HTTP {status}: {body}")]
    BackendHttp { status: u16, body: String },

    #[error("failed to decode Loki response: {0}")]
    BackendDecode(String),

    #[error("unsupported format `{0}` (expected raw, json or text)")]
    UnsupportedFormat(String),

    #[error("failed to format results: {0}")]
    FormatRender(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LokiMcpError {
    /// Errors the JSON-RPC layer reports as protocol errors instead of tool results.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, LokiMcpError::UnknownTool(_))
    }
}
