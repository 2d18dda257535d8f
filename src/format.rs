use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::{LokiMcpError, Result};
use crate::model::{BackendResult, LabelsResponse, OutputFormat, Payload, QueryData, QueryResponse};

/// Render a backend result in the requested format.
pub fn format_result(result: &BackendResult, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Raw => render_json(&result.raw, true),
        OutputFormat::Json => render_json(&result.raw, false),
        OutputFormat::Text => match &result.payload {
            Payload::Query(q) => query_text(q),
            Payload::LabelNames(l) | Payload::LabelValues(l) => labels_text(l),
        },
    }
}

fn render_json(raw: &Value, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(raw)
    } else {
        serde_json::to_string(raw)
    };
    rendered.map_err(|e| LokiMcpError::FormatRender(e.to_string()))
}

fn ensure_success(status: &str, error: &Option<String>) -> Result<()> {
    if status == "success" {
        return Ok(());
    }
    Err(LokiMcpError::FormatRender(format!(
        "backend reported status `{status}`: {}",
        error.as_deref().unwrap_or("no error message")
    )))
}

fn query_text(resp: &QueryResponse) -> Result<String> {
    ensure_success(&resp.status, &resp.error)?;
    let Some(data) = &resp.data else {
        return Ok(String::new());
    };

    let mut lines = Vec::new();
    match data {
        QueryData::Streams(streams) => {
            for entry in streams {
                let labels = label_set(&entry.stream);
                for (ts, line) in &entry.values {
                    lines.push(format!("{} {} {}", nanos_timestamp(ts)?, labels, line));
                }
            }
        }
        QueryData::Matrix(series) => {
            for s in series {
                let labels = label_set(&s.metric);
                for (ts, value) in &s.values {
                    lines.push(format!("{} {} {}", seconds_timestamp(*ts)?, labels, value));
                }
            }
        }
        QueryData::Vector(samples) => {
            for s in samples {
                let (ts, value) = &s.value;
                lines.push(format!("{} {} {}", seconds_timestamp(*ts)?, label_set(&s.metric), value));
            }
        }
    }
    Ok(lines.join("\n"))
}

fn labels_text(resp: &LabelsResponse) -> Result<String> {
    ensure_success(&resp.status, &resp.error)?;
    Ok(resp.values().join("\n"))
}

fn label_set(labels: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", pairs.join(","))
}

fn nanos_timestamp(ts: &str) -> Result<String> {
    let nanos: i64 = ts
        .parse()
        .map_err(|_| LokiMcpError::FormatRender(format!("invalid log timestamp `{ts}`")))?;
    let secs = nanos.div_euclid(1_000_000_000);
    let sub = nanos.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, sub)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .ok_or_else(|| LokiMcpError::FormatRender(format!("log timestamp out of range `{ts}`")))
}

fn seconds_timestamp(ts: f64) -> Result<String> {
    if !ts.is_finite() {
        return Err(LokiMcpError::FormatRender(format!("invalid sample timestamp `{ts}`")));
    }
    let millis = (ts * 1_000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .ok_or_else(|| LokiMcpError::FormatRender(format!("sample timestamp out of range `{ts}`")))
}
