//! 时间表达式解析：`now`、`-<n><unit>` 相对偏移、RFC 3339 绝对时间。

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{LokiMcpError, Result};
use crate::model::{TimeArgs, TimeRange};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Resolve `expr` against `reference`. `field` only labels the error.
pub fn resolve(field: &'static str, expr: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let invalid = || LokiMcpError::InvalidTimeExpression {
        field,
        input: expr.to_string(),
    };
    let trimmed = expr.trim();

    if trimmed == "now" {
        return Ok(reference);
    }

    if let Some(offset) = trimmed.strip_prefix('-') {
        if let Some(duration) = parse_offset(offset) {
            return reference.checked_sub_signed(duration).ok_or_else(invalid);
        }
        return Err(invalid());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    // 无时区信息时按 UTC 处理
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc());
        }
    }

    Err(invalid())
}

fn parse_offset(offset: &str) -> Option<Duration> {
    let unit = offset.chars().last()?;
    let digits = &offset[..offset.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: i64 = digits.parse().ok()?;
    let secs = match unit {
        's' => Some(n),
        'm' => n.checked_mul(60),
        'h' => n.checked_mul(3_600),
        'd' => n.checked_mul(86_400),
        _ => None,
    }?;
    Duration::try_seconds(secs)
}

/// Resolve the optional start/end pair, defaulting to the hour before `now`.
pub fn resolve_range(args: &TimeArgs, now: DateTime<Utc>) -> Result<TimeRange> {
    let start = match non_empty(&args.start) {
        Some(expr) => resolve("start", expr, now)?,
        None => now - Duration::hours(1),
    };
    let end = match non_empty(&args.end) {
        Some(expr) => resolve("end", expr, now)?,
        None => now,
    };
    Ok(TimeRange {
        start: start.timestamp(),
        end: end.timestamp(),
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
