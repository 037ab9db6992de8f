use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::ingest::IngestError;
use crate::query::{QueryError, QueryValidationError};
use crate::span::ValidationError;
use crate::storage::StorageError;

/// One rejected request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Validation(Vec<FieldError>),
    InvalidCursor { param: &'static str, message: String },
    MissingProject,
    NotFound(String),
    /// Store deadline passed; `detail` carries partial-progress accounting if any
    Timeout {
        message: String,
        detail: Option<serde_json::Value>,
    },
    Persistence {
        message: String,
        detail: Option<serde_json::Value>,
    },
}

impl ApiError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError {
            field: field.into(),
            message: message.into(),
        }])
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidCursor { .. } => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::MissingProject => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Persistence { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    status_code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, detail) = match self {
            ApiError::BadRequest(msg) => (msg, None),
            ApiError::Validation(fields) => (
                "request validation failed".to_string(),
                serde_json::to_value(fields).ok(),
            ),
            ApiError::InvalidCursor { param, message } => (
                format!("invalid {} cursor: {}", param, message),
                Some(serde_json::json!({ "param": param })),
            ),
            ApiError::MissingProject => (
                "no project context: send the x-project-id header".to_string(),
                None,
            ),
            ApiError::NotFound(msg) => (msg, None),
            ApiError::Timeout { message, detail } | ApiError::Persistence { message, detail } => {
                (message, detail)
            }
        };

        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), "{}", message);
        }

        let body = ErrorBody {
            status_code: status.as_u16(),
            message,
            detail,
        };
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            StorageError::Timeout { .. } => ApiError::Timeout {
                message: e.to_string(),
                detail: None,
            },
            StorageError::Backend(_) => ApiError::Persistence {
                message: e.to_string(),
                detail: None,
            },
        }
    }
}

impl From<QueryValidationError> for ApiError {
    fn from(e: QueryValidationError) -> Self {
        ApiError::validation(e.field, e.message)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::validation(e.field(), e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::Validation(v) => v.into(),
            QueryError::InvalidCursor { param, source } => ApiError::InvalidCursor {
                param,
                message: source.to_string(),
            },
            QueryError::Storage(s) => s.into(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(v) => v.into(),
            IngestError::Persistence {
                committed,
                rejected,
                source,
            } => {
                let detail = Some(serde_json::json!({
                    "committed": committed,
                    "rejected": rejected,
                }));
                let message = source.to_string();
                match source {
                    StorageError::Timeout { .. } => ApiError::Timeout { message, detail },
                    _ => ApiError::Persistence { message, detail },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(StorageError::not_found("n1")), 404),
            (
                ApiError::from(StorageError::Timeout {
                    operation: "query",
                    timeout_ms: 10,
                }),
                504,
            ),
            (ApiError::from(StorageError::Backend("io".into())), 503),
            (ApiError::from(QueryValidationError::new("size", "too big")), 422),
            (ApiError::MissingProject, 401),
        ];
        for (err, code) in cases {
            assert_eq!(err.status_code().as_u16(), code);
        }
    }

    #[test]
    fn test_ingest_failure_keeps_accounting() {
        let err = ApiError::from(IngestError::Persistence {
            committed: 3,
            rejected: Vec::new(),
            source: StorageError::Backend("disk full".into()),
        });
        match err {
            ApiError::Persistence { detail, .. } => {
                assert_eq!(detail.unwrap()["committed"], 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
