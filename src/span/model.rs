//! Span data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};

/// Lifecycle status of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    #[default]
    Initiated,
    Success,
    Failure,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Initiated => "INITIATED",
            StatusCode::Success => "SUCCESS",
            StatusCode::Failure => "FAILURE",
        }
    }

    /// Case-insensitive parse
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INITIATED" => Some(StatusCode::Initiated),
            "SUCCESS" => Some(StatusCode::Success),
            "FAILURE" => Some(StatusCode::Failure),
            _ => None,
        }
    }
}

/// Error details attached to a failed span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub value: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SpanError>,
}

impl SpanStatus {
    pub fn success() -> Self {
        Self {
            value: StatusCode::Success,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            value: StatusCode::Failure,
            error: Some(SpanError {
                message: message.into(),
                stacktrace: None,
            }),
        }
    }
}

/// LLM token usage. `total` always equals `prompt + completion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl Tokens {
    pub fn new(prompt: u64, completion: u64) -> Result<Self, ValidationError> {
        let total = prompt
            .checked_add(completion)
            .ok_or(ValidationError::TokenOverflow { prompt, completion })?;
        Ok(Self {
            prompt,
            completion,
            total,
        })
    }

    pub fn is_consistent(&self) -> bool {
        self.prompt.checked_add(self.completion) == Some(self.total)
    }
}

/// Reference to the application variant that produced a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanVariant {
    pub variant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<i64>,
}

/// One timed unit of execution within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub project_id: String,
    pub node_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<Tokens>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<SpanVariant>,
}

impl Span {
    /// Create a validated span with default status and no optional attributes.
    pub fn new(
        project_id: impl Into<String>,
        node_id: impl Into<String>,
        trace_id: impl Into<String>,
        event_name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let span = Self {
            project_id: project_id.into(),
            node_id: node_id.into(),
            trace_id: trace_id.into(),
            parent_span_id: None,
            event_name: event_name.into(),
            event_type: None,
            start_time,
            end_time,
            status: SpanStatus::default(),
            input: None,
            output: None,
            metadata: serde_json::Map::new(),
            cost: None,
            tokens: None,
            environment: None,
            variant: None,
        };
        span.validate()?;
        Ok(span)
    }

    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_status(mut self, status: SpanStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_tokens(mut self, tokens: Tokens) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_variant(mut self, variant: SpanVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    pub fn with_io(mut self, input: serde_json::Value, output: serde_json::Value) -> Self {
        self.input = Some(input);
        self.output = Some(output);
        self
    }

    /// Check every structural invariant of a span.
    ///
    /// Setters do not validate, so anything that arrives from outside
    /// (deserialized or built with `with_*`) must pass through here
    /// before it is committed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.node_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("node_id"));
        }
        if self.trace_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("trace_id"));
        }
        if self.project_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("project_id"));
        }
        if self.end_time < self.start_time {
            return Err(ValidationError::EndBeforeStart {
                start_time: self.start_time,
                end_time: self.end_time,
            });
        }
        if let Some(tokens) = &self.tokens {
            if !tokens.is_consistent() {
                return Err(ValidationError::TokenMismatch {
                    prompt: tokens.prompt,
                    completion: tokens.completion,
                    total: tokens.total,
                });
            }
        }
        if let Some(cost) = self.cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(ValidationError::InvalidCost(cost));
            }
        }
        match self.parent_span_id.as_deref() {
            Some(parent) if parent == self.node_id => {
                return Err(ValidationError::SelfParent(self.node_id.clone()))
            }
            Some(parent) if parent.trim().is_empty() => {
                return Err(ValidationError::EmptyField("parent_span_id"))
            }
            _ => {}
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Duration in fractional milliseconds
    pub fn duration_ms(&self) -> f64 {
        let duration = self.duration();
        match duration.num_microseconds() {
            Some(us) => us as f64 / 1000.0,
            None => duration.num_milliseconds() as f64,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.status.value == StatusCode::Failure
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.start_time, self.node_id.clone())
    }
}

/// Position of a span in the result order: newest first, `node_id` ascending
/// among spans that started at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortKey {
    start_time: Reverse<DateTime<Utc>>,
    node_id: String,
}

impl SortKey {
    pub fn new(start_time: DateTime<Utc>, node_id: impl Into<String>) -> Self {
        Self {
            start_time: Reverse(start_time),
            node_id: node_id.into(),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time.0
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_time
            .cmp(&other.start_time)
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Span as posted by a producer. The project comes from the caller's context.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSpan {
    #[serde(alias = "span_id")]
    pub node_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub event_name: String,
    #[serde(default)]
    pub event_type: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default, alias = "meta")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub tokens: Option<Tokens>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub variant: Option<SpanVariant>,
}

impl CreateSpan {
    pub fn into_span(self, project_id: &str) -> Result<Span, ValidationError> {
        let span = Span {
            project_id: project_id.to_string(),
            node_id: self.node_id,
            trace_id: self.trace_id,
            parent_span_id: self.parent_span_id,
            event_name: self.event_name,
            event_type: self.event_type,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            input: self.input,
            output: self.output,
            metadata: self.metadata.unwrap_or_default(),
            cost: self.cost,
            tokens: self.tokens,
            environment: self.environment,
            variant: self.variant,
        };
        span.validate()?;
        Ok(span)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("end_time {end_time} is before start_time {start_time}")]
    EndBeforeStart {
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },

    #[error("tokens.total {total} != prompt {prompt} + completion {completion}")]
    TokenMismatch {
        prompt: u64,
        completion: u64,
        total: u64,
    },

    #[error("tokens.prompt {prompt} + completion {completion} overflows")]
    TokenOverflow { prompt: u64, completion: u64 },

    #[error("token count must be a whole non-negative number, got {0}")]
    InvalidTokenCount(f64),

    #[error("cost must be a finite non-negative number, got {0}")]
    InvalidCost(f64),

    #[error("span '{0}' cannot be its own parent")]
    SelfParent(String),

    #[error("parent '{parent}' belongs to trace '{parent_trace}', not '{trace}'")]
    ParentTraceMismatch {
        parent: String,
        parent_trace: String,
        trace: String,
    },

    #[error("span is stored in trace '{stored}' and cannot move to '{trace}'")]
    TraceChanged { stored: String, trace: String },

    #[error("span belongs to project '{found}', expected '{expected}'")]
    ProjectMismatch { expected: String, found: String },

    #[error("malformed span: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Name of the offending field, for per-field error details
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::EmptyField(field) => field,
            ValidationError::EndBeforeStart { .. } => "end_time",
            ValidationError::TokenMismatch { .. }
            | ValidationError::TokenOverflow { .. }
            | ValidationError::InvalidTokenCount(_) => "tokens",
            ValidationError::InvalidCost(_) => "cost",
            ValidationError::SelfParent(_) | ValidationError::ParentTraceMismatch { .. } => {
                "parent_span_id"
            }
            ValidationError::TraceChanged { .. } => "trace_id",
            ValidationError::ProjectMismatch { .. } => "project_id",
            ValidationError::Malformed(_) => "body",
        }
    }
}
