use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    analytics, create_spans, delete_traces, health_check, otlp_ingest, otlp_status, query_traces,
    read_span, AppState,
};
use crate::ingest::{IngestConfig, IngestPipeline, DEFAULT_BATCH_SIZE};
use crate::query::{AnalyticsCache, QueryLimits};
use crate::storage::{
    MemoryStore, PersistenceGateway, SnapshotManager, SnapshotWorker, TimedGateway,
    DEFAULT_STORE_TIMEOUT_MS,
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub limits: QueryLimits,
    pub ingest_batch_size: usize,
    pub store_timeout: Duration,
    /// Snapshots are disabled when unset
    pub data_dir: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    pub default_project: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            limits: QueryLimits::default(),
            ingest_batch_size: DEFAULT_BATCH_SIZE,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            data_dir: None,
            snapshot_interval_secs: 60,
            default_project: None,
        }
    }
}

impl ServerConfig {
    /// Read `TRACESTORE_*` variables, falling back to defaults for anything
    /// unset or unparseable
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let limits = QueryLimits {
            max_page_size: env_parse::<usize>("TRACESTORE_MAX_PAGE_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.limits.max_page_size),
            ..defaults.limits
        };
        let limits = QueryLimits {
            default_page_size: limits.default_page_size.min(limits.max_page_size),
            ..limits
        };

        Self {
            host: env_string("TRACESTORE_HOST").unwrap_or(defaults.host),
            port: env_parse("TRACESTORE_PORT").unwrap_or(defaults.port),
            limits,
            ingest_batch_size: env_parse::<usize>("TRACESTORE_INGEST_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.ingest_batch_size),
            store_timeout: env_parse("TRACESTORE_STORE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.store_timeout),
            data_dir: env_string("TRACESTORE_DATA_DIR").map(PathBuf::from),
            snapshot_interval_secs: env_parse::<u64>("TRACESTORE_SNAPSHOT_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.snapshot_interval_secs),
            default_project: env_string("TRACESTORE_DEFAULT_PROJECT"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

/// Wire the shared handler state around a gateway
pub fn build_state(gateway: Arc<dyn PersistenceGateway>, config: &ServerConfig) -> Arc<AppState> {
    let pipeline = IngestPipeline::new(
        Arc::clone(&gateway),
        IngestConfig {
            batch_size: config.ingest_batch_size,
        },
    );

    Arc::new(AppState {
        gateway,
        pipeline,
        limits: config.limits,
        cache: AnalyticsCache::new(),
        default_project: config.default_project.clone(),
    })
}

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    let observability = Router::new()
        .route("/otlp/traces", get(otlp_status).post(otlp_ingest))
        .route("/spans", post(create_spans))
        .route("/spans/:node_id", get(read_span))
        .route("/traces", get(query_traces).delete(delete_traces))
        .route("/analytics", get(analytics));

    Router::new()
        .route("/health", get(health_check))
        .nest("/observability/v1", observability)
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());

    // Restore the last snapshot before accepting traffic
    let snapshot_worker = match &config.data_dir {
        Some(dir) => {
            let manager = Arc::new(SnapshotManager::new(dir)?);
            let restored = manager.restore(&store)?;
            tracing::info!(
                "Restored {} spans across {} projects from {}",
                restored,
                store.project_ids().len(),
                dir.display()
            );
            Some(Arc::new(SnapshotWorker::new(
                manager,
                Arc::clone(&store),
                Duration::from_secs(config.snapshot_interval_secs),
            )))
        }
        None => {
            tracing::info!("No data directory configured; spans are kept in memory only");
            None
        }
    };
    let snapshot_handle = snapshot_worker.as_ref().map(|w| Arc::clone(w).start());

    let backend: Arc<dyn PersistenceGateway> = store;
    let gateway: Arc<dyn PersistenceGateway> =
        Arc::new(TimedGateway::new(backend, config.store_timeout));
    let app = build_router(build_state(gateway, &config));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting tracestore on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = snapshot_worker {
        worker.stop();
        if let Some(handle) = snapshot_handle {
            let _ = handle.await;
        }
        match worker.snapshot_now().await {
            Ok(meta) => tracing::info!(
                "Final snapshot: {} spans across {} projects",
                meta.spans,
                meta.projects
            ),
            Err(e) => tracing::error!("Final snapshot failed: {}", e),
        }
    }

    tracing::info!("tracestore stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining requests...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, Response, StatusCode};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryStore::new());
        build_router(build_state(gateway, &ServerConfig::default()))
    }

    fn encode(raw: &str) -> String {
        raw.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' => {
                    (b as char).to_string()
                }
                _ => format!("%{:02X}", b),
            })
            .collect()
    }

    fn span_json(
        node: &str,
        trace: &str,
        parent: Option<&str>,
        start: DateTime<Utc>,
        failed: bool,
        cost: f64,
    ) -> Value {
        let status = if failed {
            json!({"value": "FAILURE", "error": {"message": "boom"}})
        } else {
            json!({"value": "SUCCESS"})
        };
        json!({
            "node_id": node,
            "trace_id": trace,
            "parent_span_id": parent,
            "event_name": format!("step-{}", node),
            "start_time": start.to_rfc3339(),
            "end_time": (start + ChronoDuration::milliseconds(100)).to_rfc3339(),
            "status": status,
            "cost": cost,
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("x-project-id", "p1")
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Trace t1 is R -> A -> B with A failed; trace t2 is a single success
    async fn seed_traces(app: &Router) {
        let now = Utc::now();
        let spans = json!({"spans": [
            span_json("R", "t1", None, now - ChronoDuration::minutes(10), false, 0.5),
            span_json("A", "t1", Some("R"), now - ChronoDuration::minutes(9), true, 0.2),
            span_json("B", "t1", Some("A"), now - ChronoDuration::minutes(8), false, 1.0),
        ]});
        let response = send(app, "POST", "/observability/v1/spans", Some(spans)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["accepted_count"], 3);
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();
        let response = send(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_trace_focus_returns_whole_failed_trace() {
        let app = create_test_app();
        seed_traces(&app).await;
        let other = span_json("S", "t2", None, Utc::now(), false, 0.0);
        send(&app, "POST", "/observability/v1/spans", Some(other)).await;

        let filter = encode(r#"{"field":"status","op":"eq","value":"FAILURE"}"#);
        let uri = format!("/observability/v1/traces?focus=trace&filtering={}", filter);
        let response = send(&app, "GET", &uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["count"], 1);
        let traces = body["traces"].as_array().unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0]["trace_id"], "t1");

        let root = &traces[0]["spans"][0];
        assert_eq!(root["node_id"], "R");
        assert_eq!(root["children"][0]["node_id"], "A");
        assert_eq!(root["children"][0]["children"][0]["node_id"], "B");
    }

    #[tokio::test]
    async fn test_analytics_summary() {
        let app = create_test_app();
        seed_traces(&app).await;

        let response = send(&app, "GET", "/observability/v1/analytics?time_range=24_hours", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["total_count"], 3);
        assert_eq!(body["success_count"], 2);
        assert_eq!(body["failure_count"], 1);
        assert!((body["total_cost"].as_f64().unwrap() - 1.7).abs() < 1e-9);
        assert!((body["failure_rate"].as_f64().unwrap() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_analytics_cache_invalidated_by_writes() {
        let app = create_test_app();
        seed_traces(&app).await;

        let uri = "/observability/v1/analytics";
        let first = json_body(send(&app, "GET", uri, None).await).await;
        assert_eq!(first["total_count"], 3);

        let extra = span_json("C", "t3", None, Utc::now() - ChronoDuration::minutes(1), false, 0.0);
        send(&app, "POST", "/observability/v1/spans", Some(extra)).await;

        let second = json_body(send(&app, "GET", uri, None).await).await;
        assert_eq!(second["total_count"], 4);
    }

    #[tokio::test]
    async fn test_cursor_paging_walks_all_spans() {
        let app = create_test_app();
        let now = Utc::now();
        let spans: Vec<Value> = (0..5)
            .map(|i| {
                span_json(
                    &format!("n{}", i),
                    &format!("t{}", i),
                    None,
                    now - ChronoDuration::seconds(i),
                    false,
                    0.0,
                )
            })
            .collect();
        send(&app, "POST", "/observability/v1/spans", Some(json!({ "spans": spans }))).await;

        let mut seen = Vec::new();
        let mut uri = "/observability/v1/traces?size=2".to_string();
        loop {
            let body = json_body(send(&app, "GET", &uri, None).await).await;
            assert_eq!(body["count"], 5);
            for span in body["spans"].as_array().unwrap() {
                seen.push(span["node_id"].as_str().unwrap().to_string());
            }
            match body["next_cursor"].as_str() {
                Some(next) => uri = format!("/observability/v1/traces?size=2&next={}", next),
                None => break,
            }
        }
        assert_eq!(seen, vec!["n0", "n1", "n2", "n3", "n4"]);
    }

    #[tokio::test]
    async fn test_invalid_size_is_unprocessable() {
        let app = create_test_app();
        let response = send(&app, "GET", "/observability/v1/traces?size=0", None).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = json_body(response).await;
        assert_eq!(body["status_code"], 422);
        assert_eq!(body["detail"][0]["field"], "size");
    }

    #[tokio::test]
    async fn test_garbage_cursor_is_bad_request() {
        let app = create_test_app();
        let response = send(&app, "GET", "/observability/v1/traces?next=!!!", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_project_is_unauthorized() {
        let app = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/observability/v1/traces")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_default_project_applies_without_header() {
        let gateway: Arc<dyn PersistenceGateway> = Arc::new(MemoryStore::new());
        let config = ServerConfig {
            default_project: Some("p1".to_string()),
            ..ServerConfig::default()
        };
        let app = build_router(build_state(gateway, &config));
        seed_traces(&app).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/observability/v1/spans/R")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_delete_reports_missing() {
        let app = create_test_app();
        seed_traces(&app).await;

        let response = send(
            &app,
            "DELETE",
            "/observability/v1/traces?node_ids=B,ghost",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["deleted_count"], 1);
        assert_eq!(body["missing"], json!(["ghost"]));

        // Parent is untouched
        let response = send(&app, "GET", "/observability/v1/spans/A", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app, "DELETE", "/observability/v1/traces", None).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_read_missing_span_is_not_found() {
        let app = create_test_app();
        let response = send(&app, "GET", "/observability/v1/spans/nope", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status_code"], 404);
    }

    #[tokio::test]
    async fn test_batch_reports_rejected_items() {
        let app = create_test_app();
        let now = Utc::now();
        let batch = json!({"spans": [
            span_json("ok", "t1", None, now, false, 0.0),
            {"node_id": "bad", "trace_id": "t1"},
            span_json("early", "t1", Some("ghost"), now, false, 0.0),
            span_json("stray", "t2", Some("ok"), now, false, 0.0),
        ]});

        let response = send(&app, "POST", "/observability/v1/spans", Some(batch)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        // Unknown parents may arrive later; a parent in another trace may not
        assert_eq!(body["accepted_count"], 2);
        let rejected: Vec<&str> = body["rejected"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["node_id"].as_str().unwrap())
            .collect();
        assert_eq!(rejected, vec!["bad", "stray"]);
    }

    #[tokio::test]
    async fn test_otlp_ingest() {
        let app = create_test_app();
        let export = json!({
            "resourceSpans": [{
                "scopeSpans": [{
                    "scope": {"name": "agenta"},
                    "spans": [{
                        "traceId": "abc",
                        "spanId": "s1",
                        "name": "chat",
                        "kind": 3,
                        "startTimeUnixNano": "1700000000000000000",
                        "endTimeUnixNano": "1700000000500000000",
                        "attributes": [
                            {"key": "gen_ai.usage.input_tokens", "value": {"intValue": "10"}},
                            {"key": "gen_ai.usage.output_tokens", "value": {"intValue": 5}}
                        ],
                        "status": {"code": 2, "message": "rate limited"}
                    }]
                }]
            }]
        });

        let response = send(&app, "POST", "/observability/v1/otlp/traces", Some(export)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["accepted_count"], 1);

        let span = json_body(send(&app, "GET", "/observability/v1/spans/s1", None).await).await;
        assert_eq!(span["status"]["value"], "FAILURE");
        assert_eq!(span["tokens"]["total"], 15);
    }
}
