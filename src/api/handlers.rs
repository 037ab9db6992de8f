use axum::{
    async_trait,
    body::Bytes,
    extract::{rejection::QueryRejection, FromRequestParts, Path, Query, State},
    http::request::Parts,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use crate::ingest::{IngestPipeline, IngestReport, RejectedSpan};
use crate::otel::{decode_export, ExportTraceServiceRequest};
use crate::query::{
    run_analytics, run_query, AnalyticsCache, AnalyticsParams, AnalyticsQuery, AnalyticsReport,
    CacheKey, CacheStats, QueryLimits, QueryParams, QueryResult,
};
use crate::span::{CreateSpan, Span};
use crate::storage::PersistenceGateway;

pub const PROJECT_HEADER: &str = "x-project-id";

/// Application state shared across handlers
pub struct AppState {
    pub gateway: Arc<dyn PersistenceGateway>,
    pub pipeline: IngestPipeline,
    pub limits: QueryLimits,
    pub cache: AnalyticsCache,
    /// Project used when a request carries no project header
    pub default_project: Option<String>,
}

impl AppState {
    /// Drop cached dashboards after a project's spans change
    fn spans_changed(&self, project_id: &str) {
        self.cache.invalidate_project(project_id);
    }
}

/// Project scope of a request
#[derive(Debug, Clone)]
pub struct ProjectId(pub String);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ProjectId {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(PROJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match header {
            Some(id) => Ok(ProjectId(id.to_string())),
            None => state
                .default_project
                .clone()
                .map(ProjectId)
                .ok_or(ApiError::MissingProject),
        }
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(p)| p)
        .map_err(|e| ApiError::validation("query", e.body_text()))
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub analytics_cache: CacheStats,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        analytics_cache: state.cache.stats(),
    })
}

// ============================================================================
// Ingest
// ============================================================================

pub async fn otlp_status() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ready",
        "encoding": "application/json",
    }))
}

/// OTLP/HTTP export in JSON encoding
pub async fn otlp_ingest(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    let request: ExportTraceServiceRequest = parse_body(&body)?;
    let candidates = decode_export(&project_id, request);

    let result = state.pipeline.ingest_candidates(&project_id, candidates).await;
    state.spans_changed(&project_id);
    Ok(Json(result?))
}

#[derive(Deserialize)]
struct SpanBatch {
    spans: Vec<serde_json::Value>,
}

/// Accepts one span, or `{"spans": [...]}`. Batch items are decoded one at a
/// time so a malformed item is reported instead of failing the request.
pub async fn create_spans(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    let value: serde_json::Value = parse_body(&body)?;

    if value.get("spans").is_some() {
        let batch: SpanBatch = serde_json::from_value(value)
            .map_err(|e| ApiError::validation("spans", e.to_string()))?;
        let candidates = batch
            .spans
            .into_iter()
            .map(|item| decode_create_span(&project_id, item))
            .collect();

        let result = state.pipeline.ingest_candidates(&project_id, candidates).await;
        state.spans_changed(&project_id);
        return Ok(Json(result?));
    }

    let payload: CreateSpan = serde_json::from_value(value)
        .map_err(|e| ApiError::validation("body", e.to_string()))?;
    let span = payload.into_span(&project_id)?;
    state.pipeline.ingest_one(&project_id, span).await?;
    state.spans_changed(&project_id);

    Ok(Json(IngestReport {
        accepted_count: 1,
        rejected: Vec::new(),
    }))
}

fn decode_create_span(project_id: &str, item: serde_json::Value) -> Result<Span, RejectedSpan> {
    let node_id = item
        .get("node_id")
        .or_else(|| item.get("span_id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    serde_json::from_value::<CreateSpan>(item)
        .map_err(|e| RejectedSpan::new(node_id.clone(), e))
        .and_then(|payload| {
            payload
                .into_span(project_id)
                .map_err(|e| RejectedSpan::new(node_id, e))
        })
}

// ============================================================================
// Read & Query
// ============================================================================

pub async fn read_span(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    Path(node_id): Path<String>,
) -> Result<Json<Span>, ApiError> {
    let span = state.gateway.read_one(&project_id, &node_id).await?;
    Ok(Json(span))
}

pub async fn query_traces(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    params: Result<Query<QueryParams>, QueryRejection>,
) -> Result<Json<QueryResult>, ApiError> {
    let params = query_params(params)?;
    let result = run_query(state.gateway.as_ref(), &project_id, &params, &state.limits).await?;
    Ok(Json(result))
}

// ============================================================================
// Delete
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    pub node_id: Option<String>,
    /// Comma-separated
    pub node_ids: Option<String>,
}

impl DeleteParams {
    fn ids(&self) -> Vec<String> {
        let single = self.node_id.iter().map(|s| s.as_str());
        let listed = self.node_ids.iter().flat_map(|s| s.split(','));

        let mut ids: Vec<String> = Vec::new();
        for id in single.chain(listed).map(str::trim).filter(|s| !s.is_empty()) {
            if !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted_count: usize,
    pub missing: Vec<String>,
}

/// Deletes exactly the named spans; children are left in place
pub async fn delete_traces(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    params: Result<Query<DeleteParams>, QueryRejection>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let ids = query_params(params)?.ids();
    if ids.is_empty() {
        return Err(ApiError::validation("node_id", "node_id or node_ids is required"));
    }

    let outcome = state.gateway.delete_many(&project_id, &ids).await?;
    if !outcome.deleted.is_empty() {
        state.spans_changed(&project_id);
    }
    tracing::info!(
        project_id = %project_id,
        deleted = outcome.deleted.len(),
        missing = outcome.missing.len(),
        "spans deleted"
    );

    Ok(Json(DeleteResponse {
        deleted_count: outcome.deleted.len(),
        missing: outcome.missing,
    }))
}

// ============================================================================
// Analytics
// ============================================================================

pub async fn analytics(
    State(state): State<Arc<AppState>>,
    ProjectId(project_id): ProjectId,
    params: Result<Query<AnalyticsParams>, QueryRejection>,
) -> Result<Json<AnalyticsReport>, ApiError> {
    let params = query_params(params)?;
    let query = AnalyticsQuery::parse(&params)?;

    let key = CacheKey::new(&project_id, &params);
    if let Some(report) = state.cache.get(&key) {
        return Ok(Json(report));
    }

    let generation = state.cache.generation(&project_id);
    let report = run_analytics(state.gateway.as_ref(), &project_id, &query, Utc::now()).await?;
    state.cache.put(key, report.clone(), generation);
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_ids_merge_and_dedupe() {
        let params = DeleteParams {
            node_id: Some("a".into()),
            node_ids: Some("b, a,,c ".into()),
        };
        assert_eq!(params.ids(), vec!["a", "b", "c"]);
        assert!(DeleteParams::default().ids().is_empty());
    }

    #[test]
    fn test_decode_create_span_reports_node_id() {
        let rejected = decode_create_span(
            "p1",
            serde_json::json!({"span_id": "n9", "trace_id": "t1"}),
        )
        .unwrap_err();
        assert_eq!(rejected.node_id, "n9");
    }
}
