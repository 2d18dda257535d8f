use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LokiMcpError;

pub const DEFAULT_LIMIT: usize = 100;

/// 三个工具共用的连接参数，均可省略并回退到环境变量或默认值。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionArgs {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeArgs {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// Arguments of `loki_query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryArgs {
    pub query: String,
    #[serde(flatten)]
    pub connection: ConnectionArgs,
    #[serde(flatten)]
    pub time: TimeArgs,
    #[serde(default)]
    pub limit: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
}

impl QueryArgs {
    /// Non-positive or missing limits fall back to the default.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            Some(l) if l >= 1.0 => l as usize,
            _ => DEFAULT_LIMIT,
        }
    }
}

/// Arguments of `loki_label_names`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelNamesArgs {
    #[serde(flatten)]
    pub connection: ConnectionArgs,
    #[serde(flatten)]
    pub time: TimeArgs,
    #[serde(default)]
    pub format: Option<String>,
}

/// Arguments of `loki_label_values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelValuesArgs {
    pub label: String,
    #[serde(flatten)]
    pub connection: ConnectionArgs,
    #[serde(flatten)]
    pub time: TimeArgs,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Raw,
    Json,
    Text,
}

impl FromStr for OutputFormat {
    type Err = LokiMcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(OutputFormat::Raw),
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            other => Err(LokiMcpError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl OutputFormat {
    /// Missing or empty selector means `raw`.
    pub fn from_arg(arg: Option<&str>) -> crate::error::Result<Self> {
        match arg {
            None | Some("") => Ok(OutputFormat::Raw),
            Some(s) => s.parse(),
        }
    }
}

/// Absolute query window in whole seconds since the epoch. Inversion is not checked here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn start_nanos(&self) -> String {
        to_nanos(self.start)
    }

    pub fn end_nanos(&self) -> String {
        to_nanos(self.end)
    }
}

fn to_nanos(secs: i64) -> String {
    (secs as i128 * 1_000_000_000).to_string()
}

/// One log stream of a `streams` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(default)]
    pub stream: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<(f64, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: (f64, String),
}

/// `data` of a query_range response, tagged by `resultType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryData {
    Streams(Vec<StreamEntry>),
    Matrix(Vec<MatrixSeries>),
    Vector(Vec<VectorSample>),
}

impl QueryData {
    pub fn is_empty(&self) -> bool {
        match self {
            QueryData::Streams(v) => v.is_empty(),
            QueryData::Matrix(v) => v.is_empty(),
            QueryData::Vector(v) => v.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Envelope shared by the label names and label values endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<Vec<String>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl LabelsResponse {
    pub fn values(&self) -> &[String] {
        self.data.as_deref().unwrap_or_default()
    }
}

/// Which backend endpoint a response came from; selects the typed decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    LabelNames,
    LabelValues,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Query(QueryResponse),
    LabelNames(LabelsResponse),
    LabelValues(LabelsResponse),
}

/// 后端返回结果：原始 JSON 用于 raw/json 输出，类型化视图用于 text 输出。
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub raw: Value,
    pub payload: Payload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_args_require_query_and_flatten_connection() {
        let args: QueryArgs = serde_json::from_value(json!({
            "query": "{job=\"app\"}",
            "url": "http://loki:3100",
            "start": "-5m",
            "limit": 5,
            "extra": true
        }))
        .unwrap();
        assert_eq!(args.connection.url.as_deref(), Some("http://loki:3100"));
        assert_eq!(args.time.start.as_deref(), Some("-5m"));
        assert_eq!(args.effective_limit(), 5);

        assert!(serde_json::from_value::<QueryArgs>(json!({ "limit": 5 })).is_err());
    }

    #[test]
    fn limit_defaults_and_truncates() {
        let mut args: QueryArgs = serde_json::from_value(json!({ "query": "x" })).unwrap();
        assert_eq!(args.effective_limit(), DEFAULT_LIMIT);
        args.limit = Some(0.0);
        assert_eq!(args.effective_limit(), DEFAULT_LIMIT);
        args.limit = Some(-3.0);
        assert_eq!(args.effective_limit(), DEFAULT_LIMIT);
        args.limit = Some(12.9);
        assert_eq!(args.effective_limit(), 12);
    }

    #[test]
    fn output_format_selector() {
        assert_eq!(OutputFormat::from_arg(None).unwrap(), OutputFormat::Raw);
        assert_eq!(OutputFormat::from_arg(Some("")).unwrap(), OutputFormat::Raw);
        assert_eq!(OutputFormat::from_arg(Some("text")).unwrap(), OutputFormat::Text);
        assert!(matches!(
            OutputFormat::from_arg(Some("yaml")),
            Err(LokiMcpError::UnsupportedFormat(f)) if f == "yaml"
        ));
    }

    #[test]
    fn time_range_in_nanoseconds() {
        let r = TimeRange { start: 1_700_000_000, end: 1_700_003_600 };
        assert_eq!(r.start_nanos(), "1700000000000000000");
        assert_eq!(r.end_nanos(), "1700003600000000000");
    }

    #[test]
    fn query_data_is_tagged_by_result_type() {
        let resp: QueryResponse = serde_json::from_value(json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{ "metric": { "job": "app" }, "values": [[1700000000.5, "3"]] }],
                "stats": { "summary": {} }
            }
        }))
        .unwrap();
        match resp.data {
            Some(QueryData::Matrix(series)) => {
                assert_eq!(series[0].metric["job"], "app");
                assert_eq!(series[0].values[0].1, "3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
