use url::Url;

use crate::error::{LokiMcpError, Result};
use crate::model::{Operation, TimeRange};

const API_PREFIX: &[&str] = &["loki", "api", "v1"];

/// One of the three Loki read endpoints with its parameters.
#[derive(Debug, Clone)]
pub enum Endpoint<'a> {
    QueryRange {
        query: &'a str,
        range: TimeRange,
        limit: usize,
    },
    LabelNames {
        range: TimeRange,
    },
    LabelValues {
        label: &'a str,
        range: TimeRange,
    },
}

impl Endpoint<'_> {
    pub fn operation(&self) -> Operation {
        match self {
            Endpoint::QueryRange { .. } => Operation::Query,
            Endpoint::LabelNames { .. } => Operation::LabelNames,
            Endpoint::LabelValues { .. } => Operation::LabelValues,
        }
    }

    fn range(&self) -> TimeRange {
        match self {
            Endpoint::QueryRange { range, .. }
            | Endpoint::LabelNames { range }
            | Endpoint::LabelValues { range, .. } => *range,
        }
    }
}

/// Replace any `user:password@` part of a URL-ish string with `***@`.
/// Works on unparsable input too, so it is safe for error messages and logs.
pub fn redact_userinfo(raw: &str) -> String {
    let authority_start = raw.find("://").map(|i| i + 3).unwrap_or(0);
    let rest = &raw[authority_start..];
    let authority_end = rest.find(&['/', '?', '#'][..]).unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***{}", &raw[..authority_start], &rest[at..]),
        None => raw.to_string(),
    }
}

/// 基于 base URL 构造完整请求地址。base 可以带路径前缀（反向代理场景），
/// 原有的 query、fragment 与 userinfo 会被丢弃。
pub fn build_url(base: &str, endpoint: &Endpoint<'_>) -> Result<Url> {
    let malformed = |reason: String| LokiMcpError::MalformedBaseUrl {
        url: redact_userinfo(base),
        reason,
    };

    let mut url = Url::parse(base).map_err(|e| malformed(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(malformed(format!("unsupported scheme `{}`", url.scheme())));
    }
    url.set_query(None);
    url.set_fragment(None);
    // 凭据只走 token / username+password，URL 里的 userinfo 会被 reqwest 转成第二个 Authorization 头
    if !url.username().is_empty() || url.password().is_some() {
        url.set_username("")
            .and_then(|_| url.set_password(None))
            .map_err(|_| malformed("cannot strip credentials from URL".to_string()))?;
    }

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| malformed("URL cannot be a base".to_string()))?;
        segments.pop_if_empty().extend(API_PREFIX);
        match endpoint {
            Endpoint::QueryRange { .. } => {
                segments.push("query_range");
            }
            Endpoint::LabelNames { .. } => {
                segments.push("labels");
            }
            Endpoint::LabelValues { label, .. } => {
                // push 会对 `/` 等保留字符做百分号编码
                segments.push("label").push(label).push("values");
            }
        }
    }

    let range = endpoint.range();
    {
        let mut pairs = url.query_pairs_mut();
        if let Endpoint::QueryRange { query, .. } = endpoint {
            pairs.append_pair("query", query);
        }
        pairs
            .append_pair("start", &range.start_nanos())
            .append_pair("end", &range.end_nanos());
        if let Endpoint::QueryRange { limit, .. } = endpoint {
            pairs.append_pair("limit", &limit.to_string());
        }
    }

    Ok(url)
}
