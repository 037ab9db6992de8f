//! Tracestore: trace storage for LLM application observability
//!
//! Collects spans from instrumented LLM applications (native JSON or OTLP/JSON),
//! keeps them per project, and answers the questions an observability UI asks:
//! span and trace listings with filters and stable pagination, whole-trace
//! reconstruction, and time-bucketed dashboard rollups.
//!
//! # Layout
//!
//! - [`span`]: the span record, its validation, and trace tree assembly
//! - [`ingest`]: batch validation with parent and tenant checks
//! - [`otel`]: OTLP/JSON decoding into spans
//! - [`query`]: filters, cursors, planning, execution and analytics
//! - [`storage`]: the persistence gateway, in-memory backend and snapshots
//! - [`api`]: the axum HTTP surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracestore::query::{run_query, QueryLimits, QueryParams};
//! use tracestore::storage::{MemoryStore, PersistenceGateway};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn PersistenceGateway> = Arc::new(MemoryStore::new());
//! let params = QueryParams {
//!     focus: Some("trace".into()),
//!     ..Default::default()
//! };
//! let result = run_query(store.as_ref(), "my-project", &params, &QueryLimits::default()).await?;
//! println!("{} traces", result.count);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod ingest;
pub mod otel;
pub mod query;
pub mod span;
pub mod storage;

// Re-export commonly used types
pub use query::{run_query, QueryError, QueryResult};
pub use span::{Span, SpanStatus, StatusCode};
pub use storage::{MemoryStore, PersistenceGateway, StorageError};
