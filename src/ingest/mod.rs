//! Span ingestion: validation, tenant and parent checks, chunked commits

pub mod pipeline;

pub use pipeline::{
    IngestConfig, IngestError, IngestPipeline, IngestReport, RejectedSpan, DEFAULT_BATCH_SIZE,
};
