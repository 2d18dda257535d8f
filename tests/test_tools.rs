use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use loki_mcp::backend::LokiClient;
use loki_mcp::config::{EnvSnapshot, ENV_LOKI_ORG_ID, ENV_LOKI_URL};
use loki_mcp::error::LokiMcpError;
use loki_mcp::tools::LokiTools;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_test::assert_ok;

/// What the fake Loki saw on its last request.
#[derive(Debug, Default, Clone)]
struct Seen {
    path: String,
    query: String,
    /// Every `Authorization` value, in arrival order.
    authorization: Vec<String>,
    org_id: Option<String>,
}

type Recorder = Arc<Mutex<Vec<Seen>>>;

fn record(rec: &Recorder, path: String, query: Option<String>, headers: &HeaderMap) {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
    rec.lock().unwrap().push(Seen {
        path,
        query: query.unwrap_or_default(),
        authorization: headers
            .get_all("authorization")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect(),
        org_id: header("x-scope-orgid"),
    });
}

async fn query_range(State(rec): State<Recorder>, RawQuery(q): RawQuery, headers: HeaderMap) -> impl IntoResponse {
    record(&rec, "/loki/api/v1/query_range".into(), q, &headers);
    Json(json!({
        "status": "success",
        "data": {
            "resultType": "streams",
            "result": [{
                "stream": { "job": "app" },
                "values": [["1700000000000000000", "boot"], ["1700000001000000000", "ready"]]
            }]
        }
    }))
}

async fn labels(State(rec): State<Recorder>, RawQuery(q): RawQuery, headers: HeaderMap) -> impl IntoResponse {
    record(&rec, "/loki/api/v1/labels".into(), q, &headers);
    Json(json!({ "status": "success", "data": ["job", "level"] }))
}

async fn label_values(
    State(rec): State<Recorder>,
    Path(label): Path<String>,
    RawQuery(q): RawQuery,
    headers: HeaderMap,
) -> axum::response::Response {
    record(&rec, format!("/loki/api/v1/label/{label}/values"), q, &headers);
    match label.as_str() {
        "broken" => (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response(),
        "garbled" => (StatusCode::OK, "<html>not json</html>").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(json!({ "status": "success", "data": [] })).into_response()
        }
        _ => Json(json!({ "status": "success", "data": ["api", "worker"] })).into_response(),
    }
}

async fn fake_loki() -> (String, Recorder) {
    let rec: Recorder = Arc::default();
    let app = Router::new()
        .route("/loki/api/v1/query_range", get(query_range))
        .route("/loki/api/v1/labels", get(labels))
        .route("/loki/api/v1/label/:label/values", get(label_values))
        .with_state(rec.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), rec)
}

fn tools_with_env(pairs: Vec<(&str, String)>) -> LokiTools {
    tools_with_timeout(pairs, Duration::from_secs(5))
}

fn tools_with_timeout(pairs: Vec<(&str, String)>, timeout: Duration) -> LokiTools {
    // 本地假 Loki 不走系统代理
    let http = reqwest::Client::builder().no_proxy().build().unwrap();
    LokiTools::new(LokiClient::with_client(http, timeout), EnvSnapshot::from_pairs(pairs))
}

fn last(rec: &Recorder) -> Seen {
    rec.lock().unwrap().last().cloned().expect("no request reached fake Loki")
}

fn param(query: &str, key: &str) -> Option<i128> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

#[tokio::test]
async fn query_uses_env_url_and_default_window() {
    let (base, rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_URL, base)]);

    let text = tools
        .call("loki_query", json!({ "query": "{job=\"app\"}", "limit": 5, "format": "text" }))
        .await
        .unwrap();
    assert_eq!(
        text,
        "2023-11-14T22:13:20Z {job=app} boot\n2023-11-14T22:13:21Z {job=app} ready"
    );

    let seen = last(&rec);
    assert_eq!(seen.path, "/loki/api/v1/query_range");
    assert!(seen.query.contains("query=%7Bjob%3D%22app%22%7D"), "{}", seen.query);
    assert!(seen.query.contains("limit=5"), "{}", seen.query);
    let start = param(&seen.query, "start").unwrap();
    let end = param(&seen.query, "end").unwrap();
    assert_eq!(end - start, 3_600 * 1_000_000_000);
    let now_ns = chrono::Utc::now().timestamp() as i128 * 1_000_000_000;
    assert!((now_ns - end).abs() <= 5 * 1_000_000_000);
    assert!(seen.authorization.is_empty());
}

#[tokio::test]
async fn label_values_relative_window_and_org_header() {
    let (base, rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_ORG_ID, "tenant-1".to_string())]);

    let out = tools
        .call(
            "loki_label_values",
            json!({ "label": "job", "start": "-5m", "end": "now", "url": base, "format": "json" }),
        )
        .await
        .unwrap();
    let parsed: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(parsed, json!({ "status": "success", "data": ["api", "worker"] }));

    let seen = last(&rec);
    assert!(seen.path.ends_with("/label/job/values"));
    let start = param(&seen.query, "start").unwrap();
    let end = param(&seen.query, "end").unwrap();
    assert_eq!(end - start, 300 * 1_000_000_000);
    assert_eq!(seen.org_id.as_deref(), Some("tenant-1"));
}

#[tokio::test]
async fn backend_500_is_an_error_with_status_and_body() {
    let (base, _rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_URL, base)]);

    let err = tools
        .call("loki_label_values", json!({ "label": "broken" }))
        .await
        .unwrap_err();
    match &err {
        LokiMcpError::BackendHttp { status, body } => {
            assert_eq!(*status, 500);
            assert_eq!(body, "internal error");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(err.to_string().contains("500"));
    assert!(err.to_string().contains("internal error"));
}

#[tokio::test]
async fn non_json_body_is_decode_error() {
    let (base, _rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_URL, base)]);
    let err = tools
        .call("loki_label_values", json!({ "label": "garbled" }))
        .await
        .unwrap_err();
    assert!(matches!(err, LokiMcpError::BackendDecode(_)), "{err}");
}

#[tokio::test]
async fn token_wins_over_basic_auth() {
    let (base, rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_URL, base)]);

    assert_ok!(
        tools
            .call(
                "loki_label_names",
                json!({ "username": "admin", "password": "secret", "token": "t0k3n" }),
            )
            .await
    );
    assert_eq!(last(&rec).authorization, vec!["Bearer t0k3n"]);

    let names = assert_ok!(
        tools
            .call("loki_label_names", json!({ "username": "admin", "password": "secret", "format": "text" }))
            .await
    );
    assert_eq!(names, "job\nlevel");
    // base64("admin:secret")
    assert_eq!(last(&rec).authorization, vec!["Basic YWRtaW46c2VjcmV0"]);
}

#[tokio::test]
async fn url_userinfo_never_adds_a_second_credential() {
    let (base, rec) = fake_loki().await;
    let with_userinfo = base.replacen("http://", "http://admin:secret@", 1);
    let tools = tools_with_env(vec![(ENV_LOKI_URL, with_userinfo.clone())]);

    assert_ok!(tools.call("loki_label_names", json!({ "token": "t0k3n" })).await);
    assert_eq!(last(&rec).authorization, vec!["Bearer t0k3n"]);

    assert_ok!(tools.call("loki_label_names", json!({ "url": with_userinfo })).await);
    assert!(last(&rec).authorization.is_empty());
}

#[tokio::test]
async fn timeout_is_unreachable_and_not_retried() {
    let (base, rec) = fake_loki().await;
    let tools = tools_with_timeout(vec![(ENV_LOKI_URL, base)], Duration::from_millis(200));

    let started = std::time::Instant::now();
    let err = tools
        .call("loki_label_values", json!({ "label": "slow" }))
        .await
        .unwrap_err();
    assert!(matches!(err, LokiMcpError::BackendUnreachable(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));

    // 给可能的重试留出时间，再确认只到达过一次
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rec.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let tools = tools_with_env(vec![]);
    let err = tools
        .call("loki_label_names", json!({ "url": format!("http://{addr}") }))
        .await
        .unwrap_err();
    assert!(matches!(err, LokiMcpError::BackendUnreachable(_)), "{err}");
}

#[tokio::test]
async fn invalid_time_never_reaches_backend() {
    let (base, rec) = fake_loki().await;
    let tools = tools_with_env(vec![(ENV_LOKI_URL, base)]);
    let err = tools
        .call("loki_query", json!({ "query": "{job=\"app\"}", "start": "5m" }))
        .await
        .unwrap_err();
    assert!(matches!(err, LokiMcpError::InvalidTimeExpression { .. }), "{err}");
    assert!(rec.lock().unwrap().is_empty());
}
