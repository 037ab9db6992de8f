//! OTLP spans to stored spans

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as Json};

use super::model::otlp_json::{self, ExportTraceServiceRequest, KeyValue};
use super::model::{SpanKind, STATUS_CODE_ERROR};
use crate::ingest::RejectedSpan;
use crate::span::{
    Span, SpanError, SpanStatus, SpanVariant, StatusCode, Tokens, ValidationError,
};

const NODE_TYPE: &str = "ag.type.node";
const INPUTS: &str = "ag.data.inputs";
const OUTPUTS: &str = "ag.data.outputs";
const COST: [&str; 2] = ["ag.metrics.costs.cumulative.total", "gen_ai.usage.cost"];
const PROMPT_TOKENS: [&str; 2] = [
    "ag.metrics.tokens.cumulative.prompt",
    "gen_ai.usage.input_tokens",
];
const COMPLETION_TOKENS: [&str; 2] = [
    "ag.metrics.tokens.cumulative.completion",
    "gen_ai.usage.output_tokens",
];
/// Largest count an f64 attribute carries exactly
const MAX_TOKEN_COUNT: f64 = 9_007_199_254_740_991.0;
const ENVIRONMENT: &str = "ag.refs.environment.slug";
const VARIANT_ID: &str = "ag.refs.variant.id";
const VARIANT_SLUG: &str = "ag.refs.variant.slug";
const VARIANT_VERSION: &str = "ag.refs.variant.version";

/// Decode every span in an export. Each entry is either a span ready for
/// ingestion or the reason it could not be decoded.
pub fn decode_export(
    project_id: &str,
    request: ExportTraceServiceRequest,
) -> Vec<Result<Span, RejectedSpan>> {
    let mut out = Vec::new();

    for resource_spans in request.resource_spans {
        let resource_attrs = resource_spans
            .resource
            .map(|r| r.attributes)
            .unwrap_or_default();

        for scope_spans in resource_spans.scope_spans {
            let mut base = attributes_to_map(&resource_attrs);
            if let Some(scope) = &scope_spans.scope {
                if let Some(name) = scope.name.as_ref().filter(|n| !n.is_empty()) {
                    base.insert("otel.scope.name".to_string(), Json::String(name.clone()));
                }
                if let Some(version) = scope.version.as_ref().filter(|v| !v.is_empty()) {
                    base.insert("otel.scope.version".to_string(), Json::String(version.clone()));
                }
            }

            for raw in scope_spans.spans {
                let node_id = raw
                    .get("spanId")
                    .and_then(Json::as_str)
                    .unwrap_or_default()
                    .to_string();
                let decoded = serde_json::from_value::<otlp_json::Span>(raw)
                    .map_err(|e| ValidationError::Malformed(e.to_string()))
                    .and_then(|span| convert_span(project_id, span, base.clone()));
                out.push(decoded.map_err(|e| RejectedSpan::new(node_id, e)));
            }
        }
    }

    out
}

fn attributes_to_map(attrs: &[KeyValue]) -> Map<String, Json> {
    attrs
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.to_json()))
        .collect()
}

fn nanos_to_time(
    nanos: &otlp_json::UnixNanos,
    field: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let n = nanos.as_u64().ok_or_else(|| {
        ValidationError::Malformed(format!("{} is not a nanosecond timestamp", field))
    })?;
    DateTime::<Utc>::from_timestamp((n / 1_000_000_000) as i64, (n % 1_000_000_000) as u32)
        .ok_or_else(|| ValidationError::Malformed(format!("{} is out of range", field)))
}

fn take_f64(attrs: &mut Map<String, Json>, keys: &[&str]) -> Option<f64> {
    let mut found = None;
    for key in keys {
        if let Some(value) = attrs.remove(*key) {
            found = found.or_else(|| as_f64(&value));
        }
    }
    found
}

fn as_f64(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn token_count(value: Option<f64>) -> Result<u64, ValidationError> {
    match value {
        None => Ok(0),
        Some(v) if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= MAX_TOKEN_COUNT => {
            Ok(v as u64)
        }
        Some(v) => Err(ValidationError::InvalidTokenCount(v)),
    }
}

fn take_string(attrs: &mut Map<String, Json>, key: &str) -> Option<String> {
    match attrs.remove(key)? {
        Json::String(s) if !s.is_empty() => Some(s),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Inputs and outputs are usually JSON documents serialized into a string
fn take_payload(attrs: &mut Map<String, Json>, key: &str) -> Option<Json> {
    match attrs.remove(key)? {
        Json::String(s) => Some(serde_json::from_str(&s).unwrap_or(Json::String(s))),
        other => Some(other),
    }
}

fn convert_span(
    project_id: &str,
    span: otlp_json::Span,
    mut attrs: Map<String, Json>,
) -> Result<Span, ValidationError> {
    let start_time = nanos_to_time(&span.start_time_unix_nano, "startTimeUnixNano")?;
    let end_time = nanos_to_time(&span.end_time_unix_nano, "endTimeUnixNano")?;

    attrs.extend(attributes_to_map(&span.attributes));
    if let Some(kind) = span.kind {
        attrs.insert(
            "otel.span_kind".to_string(),
            Json::String(SpanKind::from_i32(kind).as_str().to_string()),
        );
    }
    if let Some(state) = span.trace_state.filter(|s| !s.is_empty()) {
        attrs.insert("otel.trace_state".to_string(), Json::String(state));
    }

    let mut out = Span::new(
        project_id,
        span.span_id,
        span.trace_id,
        span.name,
        start_time,
        end_time,
    )?;

    if let Some(parent) = span.parent_span_id.filter(|p| !p.is_empty()) {
        out = out.with_parent(parent);
    }
    if let Some(event_type) = take_string(&mut attrs, NODE_TYPE) {
        out = out.with_event_type(event_type);
    }
    out.input = take_payload(&mut attrs, INPUTS);
    out.output = take_payload(&mut attrs, OUTPUTS);
    out.cost = take_f64(&mut attrs, &COST);

    let prompt = take_f64(&mut attrs, &PROMPT_TOKENS);
    let completion = take_f64(&mut attrs, &COMPLETION_TOKENS);
    if prompt.is_some() || completion.is_some() {
        out.tokens = Some(Tokens::new(token_count(prompt)?, token_count(completion)?)?);
    }

    out.environment = take_string(&mut attrs, ENVIRONMENT);
    let variant_name = take_string(&mut attrs, VARIANT_SLUG);
    let revision = take_f64(&mut attrs, &[VARIANT_VERSION]).map(|v| v as i64);
    if let Some(variant_id) = take_string(&mut attrs, VARIANT_ID) {
        out.variant = Some(SpanVariant {
            variant_id,
            variant_name,
            revision,
        });
    }

    out.status = decode_status(span.status.as_ref(), &span.events);
    out.metadata = attrs;

    out.validate()?;
    Ok(out)
}

/// Error status fails the span; unset and ok both count as success. An
/// `exception` event supplies the error details.
fn decode_status(status: Option<&otlp_json::Status>, events: &[otlp_json::Event]) -> SpanStatus {
    let Some(status) = status.filter(|s| s.code == Some(STATUS_CODE_ERROR)) else {
        return SpanStatus::success();
    };

    let exception = events
        .iter()
        .find(|e| e.name == "exception")
        .map(|e| attributes_to_map(&e.attributes));
    let exception_field = |key: &str| {
        exception
            .as_ref()
            .and_then(|attrs| attrs.get(key))
            .and_then(Json::as_str)
            .map(str::to_string)
    };

    let message = exception_field("exception.message")
        .or_else(|| status.message.clone().filter(|m| !m.is_empty()))
        .unwrap_or_else(|| "error".to_string());

    SpanStatus {
        value: StatusCode::Failure,
        error: Some(SpanError {
            message,
            stacktrace: exception_field("exception.stacktrace"),
        }),
    }
}
