//! Persistence gateway
//!
//! Every backend implements [`PersistenceGateway`]. The core never talks to a
//! concrete store; it holds an `Arc<dyn PersistenceGateway>`.

use async_trait::async_trait;

use crate::query::QueryPlan;
use crate::span::{SortKey, Span};

// ============================================================================
// Result types
// ============================================================================

/// Spans selected by a query plan, in sort order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    pub spans: Vec<Span>,
    /// Matches before paging was applied
    pub total: usize,
}

/// One page of traces, each with its position in the trace order.
///
/// A trace is positioned by its newest root span: a span whose parent is
/// not part of the trace. Traces with no such span fall back to their
/// newest span.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracePage {
    pub traces: Vec<(SortKey, String)>,
    /// Matching traces before paging was applied
    pub total: usize,
}

/// Outcome of a batch read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadMany {
    pub found: Vec<Span>,
    pub missing: Vec<String>,
}

/// Outcome of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("span '{node_id}' not found")]
    NotFound { node_id: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn not_found(node_id: impl Into<String>) -> Self {
        Self::NotFound {
            node_id: node_id.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend(_))
    }
}

// ============================================================================
// Gateway trait
// ============================================================================

/// Storage operations the core relies on.
///
/// All operations are scoped to one project. Writes are idempotent upserts
/// keyed by `(project_id, node_id)`.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Spans matching the plan's window and filter, paged by its `PagePlan`
    async fn query(&self, project_id: &str, plan: &QueryPlan) -> Result<ScanResult, StorageError>;

    /// Traces holding at least one span that matches the plan's window and
    /// filter, ordered by trace position and paged by its `PagePlan`
    async fn query_traces(&self, project_id: &str, plan: &QueryPlan)
        -> Result<TracePage, StorageError>;

    async fn create_one(&self, span: Span) -> Result<(), StorageError>;

    /// Upsert a batch; either every span is written or none is
    async fn create_many(&self, spans: Vec<Span>) -> Result<(), StorageError>;

    async fn read_one(&self, project_id: &str, node_id: &str) -> Result<Span, StorageError>;

    async fn read_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<ReadMany, StorageError>;

    /// Every stored span belonging to the given traces
    async fn read_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<Vec<Span>, StorageError>;

    async fn delete_one(&self, project_id: &str, node_id: &str) -> Result<(), StorageError>;

    async fn delete_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<DeleteOutcome, StorageError>;
}
