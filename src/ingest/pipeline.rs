//! Span ingestion
//!
//! Spans are validated one by one; bad spans are reported back, good ones
//! are committed in fixed-size chunks. Writes are upserts, so producers can
//! safely resend a batch after a failure.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::span::{Span, ValidationError};
use crate::storage::{PersistenceGateway, StorageError};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Spans per `create_many` call
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A span that was not stored, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedSpan {
    pub node_id: String,
    pub error: String,
}

impl RejectedSpan {
    pub fn new(node_id: impl Into<String>, error: impl ToString) -> Self {
        Self {
            node_id: node_id.into(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub accepted_count: usize,
    pub rejected: Vec<RejectedSpan>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("stored {committed} spans before the store failed: {source}")]
    Persistence {
        committed: usize,
        rejected: Vec<RejectedSpan>,
        #[source]
        source: StorageError,
    },
}

pub struct IngestPipeline {
    gateway: Arc<dyn PersistenceGateway>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, config: IngestConfig) -> Self {
        Self { gateway, config }
    }

    /// Validate and store a single span
    pub async fn ingest_one(&self, project_id: &str, span: Span) -> Result<(), IngestError> {
        check_span(project_id, &span)?;

        let (mut kept, failures) = self
            .check_lineage(project_id, vec![span])
            .await
            .map_err(|source| IngestError::Persistence {
                committed: 0,
                rejected: Vec::new(),
                source,
            })?;
        if let Some((_, e)) = failures.into_iter().next() {
            return Err(e.into());
        }
        let Some(span) = kept.pop() else {
            return Ok(());
        };

        self.gateway
            .create_one(span)
            .await
            .map_err(|source| IngestError::Persistence {
                committed: 0,
                rejected: Vec::new(),
                source,
            })?;
        Ok(())
    }

    pub async fn ingest_many(
        &self,
        project_id: &str,
        spans: Vec<Span>,
    ) -> Result<IngestReport, IngestError> {
        self.ingest_candidates(project_id, spans.into_iter().map(Ok).collect())
            .await
    }

    /// Ingest spans that were decoded upstream; decode failures arrive as
    /// `Err` and are reported alongside validation failures.
    pub async fn ingest_candidates(
        &self,
        project_id: &str,
        candidates: Vec<Result<Span, RejectedSpan>>,
    ) -> Result<IngestReport, IngestError> {
        let mut rejected = Vec::new();
        let mut slots: Vec<Option<Span>> = Vec::with_capacity(candidates.len());
        let mut positions: HashMap<String, usize> = HashMap::new();

        for candidate in candidates {
            let span = match candidate {
                Ok(span) => span,
                Err(r) => {
                    rejected.push(r);
                    continue;
                }
            };
            if let Err(e) = check_span(project_id, &span) {
                rejected.push(RejectedSpan::new(span.node_id, e));
                continue;
            }
            // A later copy of the same node replaces the earlier one
            if let Some(previous) = positions.insert(span.node_id.clone(), slots.len()) {
                slots[previous] = None;
            }
            slots.push(Some(span));
        }
        let valid: Vec<Span> = slots.into_iter().flatten().collect();

        let (valid, failures) = self
            .check_lineage(project_id, valid)
            .await
            .map_err(|source| IngestError::Persistence {
                committed: 0,
                rejected: rejected.clone(),
                source,
            })?;
        rejected.extend(
            failures
                .into_iter()
                .map(|(node_id, e)| RejectedSpan::new(node_id, e)),
        );

        let mut committed = 0;
        for chunk in valid.chunks(self.config.batch_size.max(1)) {
            if let Err(source) = self.gateway.create_many(chunk.to_vec()).await {
                tracing::warn!(
                    project_id,
                    committed,
                    error = %source,
                    "span batch write failed"
                );
                return Err(IngestError::Persistence {
                    committed,
                    rejected,
                    source,
                });
            }
            committed += chunk.len();
        }

        tracing::info!(
            project_id,
            accepted = committed,
            rejected = rejected.len(),
            "ingested span batch"
        );
        Ok(IngestReport {
            accepted_count: committed,
            rejected,
        })
    }

    /// Split spans into those consistent with stored lineage and those that
    /// are not. A stored span keeps its trace across upserts, and a known
    /// parent must share the span's trace. Parents are looked up in the batch
    /// first, then in the store; unknown parents are allowed since they may
    /// arrive later.
    async fn check_lineage(
        &self,
        project_id: &str,
        spans: Vec<Span>,
    ) -> Result<(Vec<Span>, Vec<(String, ValidationError)>), StorageError> {
        let batch: HashSet<&str> = spans.iter().map(|s| s.node_id.as_str()).collect();
        let mut lookup: Vec<String> = batch.iter().map(|id| id.to_string()).collect();
        let mut seen = HashSet::new();
        lookup.extend(
            spans
                .iter()
                .filter_map(|s| s.parent_span_id.as_deref())
                .filter(|p| !batch.contains(p) && seen.insert(*p))
                .map(str::to_string),
        );

        let mut traces: HashMap<String, String> = self
            .gateway
            .read_many(project_id, &lookup)
            .await?
            .found
            .into_iter()
            .map(|s| (s.node_id, s.trace_id))
            .collect();

        let mut failures = Vec::new();
        let mut kept = Vec::with_capacity(spans.len());
        for span in spans {
            match traces.get(&span.node_id) {
                Some(stored) if *stored != span.trace_id => {
                    let e = ValidationError::TraceChanged {
                        stored: stored.clone(),
                        trace: span.trace_id.clone(),
                    };
                    failures.push((span.node_id, e));
                }
                _ => kept.push(span),
            }
        }

        for span in &kept {
            traces.insert(span.node_id.clone(), span.trace_id.clone());
        }

        let mut linked = Vec::with_capacity(kept.len());
        for span in kept {
            let parent_trace = span.parent_span_id.as_ref().and_then(|p| traces.get(p));
            match parent_trace.map(|t| check_parent_trace(&span, t)) {
                Some(Err(e)) => failures.push((span.node_id.clone(), e)),
                _ => linked.push(span),
            }
        }
        Ok((linked, failures))
    }
}

fn check_span(project_id: &str, span: &Span) -> Result<(), ValidationError> {
    if span.project_id != project_id {
        return Err(ValidationError::ProjectMismatch {
            expected: project_id.to_string(),
            found: span.project_id.clone(),
        });
    }
    span.validate()
}

fn check_parent_trace(span: &Span, parent_trace: &str) -> Result<(), ValidationError> {
    if span.trace_id == parent_trace {
        return Ok(());
    }
    Err(ValidationError::ParentTraceMismatch {
        parent: span.parent_span_id.clone().unwrap_or_default(),
        parent_trace: parent_trace.to_string(),
        trace: span.trace_id.clone(),
    })
}
