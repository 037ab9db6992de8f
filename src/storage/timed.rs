//! Per-call deadline around any gateway

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::gateway::{
    DeleteOutcome, PersistenceGateway, ReadMany, ScanResult, StorageError, TracePage,
};
use crate::query::QueryPlan;
use crate::span::Span;

pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;

/// Wraps a gateway so that every call either finishes within `timeout` or
/// fails with [`StorageError::Timeout`]. Nothing is retried here.
pub struct TimedGateway {
    inner: Arc<dyn PersistenceGateway>,
    timeout: Duration,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn PersistenceGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::warn!(operation, timeout_ms, "store call timed out");
                Err(StorageError::Timeout {
                    operation,
                    timeout_ms,
                })
            }
        }
    }
}

#[async_trait]
impl PersistenceGateway for TimedGateway {
    async fn query(&self, project_id: &str, plan: &QueryPlan) -> Result<ScanResult, StorageError> {
        self.run("query", self.inner.query(project_id, plan)).await
    }

    async fn query_traces(
        &self,
        project_id: &str,
        plan: &QueryPlan,
    ) -> Result<TracePage, StorageError> {
        self.run("query_traces", self.inner.query_traces(project_id, plan))
            .await
    }

    async fn create_one(&self, span: Span) -> Result<(), StorageError> {
        self.run("create_one", self.inner.create_one(span)).await
    }

    async fn create_many(&self, spans: Vec<Span>) -> Result<(), StorageError> {
        self.run("create_many", self.inner.create_many(spans)).await
    }

    async fn read_one(&self, project_id: &str, node_id: &str) -> Result<Span, StorageError> {
        self.run("read_one", self.inner.read_one(project_id, node_id)).await
    }

    async fn read_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<ReadMany, StorageError> {
        self.run("read_many", self.inner.read_many(project_id, node_ids))
            .await
    }

    async fn read_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<Vec<Span>, StorageError> {
        self.run("read_traces", self.inner.read_traces(project_id, trace_ids))
            .await
    }

    async fn delete_one(&self, project_id: &str, node_id: &str) -> Result<(), StorageError> {
        self.run("delete_one", self.inner.delete_one(project_id, node_id))
            .await
    }

    async fn delete_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<DeleteOutcome, StorageError> {
        self.run("delete_many", self.inner.delete_many(project_id, node_ids))
            .await
    }
}
