//! OpenTelemetry ingest support
//!
//! Accepts OTLP/HTTP exports in JSON encoding:
//! ```bash
//! OTEL_EXPORTER_OTLP_TRACES_ENDPOINT=http://localhost:8080/observability/v1/otlp/traces
//! OTEL_EXPORTER_OTLP_PROTOCOL=http/json
//! ```
//!
//! Agenta (`ag.*`) and GenAI semantic-convention (`gen_ai.*`) attributes are
//! lifted into span fields; everything else is kept as metadata.

mod convert;
mod model;

pub use convert::decode_export;
pub use model::otlp_json::ExportTraceServiceRequest;
pub use model::SpanKind;
