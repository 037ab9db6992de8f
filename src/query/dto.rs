//! Query request parsing and validation
//!
//! `QueryParams` is the raw wire shape; `QueryDto::parse` checks it and
//! produces an immutable, typed description of the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cursor::Cursor;
use super::filter::FilterExpr;
use super::QueryError;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_MAX_PAGE_SIZE: usize = 1000;

/// Raw query parameters as received from a client
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    pub format: Option<String>,
    pub focus: Option<String>,
    pub oldest: Option<String>,
    pub newest: Option<String>,
    pub filtering: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
    pub next: Option<String>,
    pub stop: Option<String>,
}

/// Which node level a query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Focus {
    #[default]
    Span,
    Trace,
}

impl Focus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "span" | "node" => Some(Focus::Span),
            "trace" | "tree" => Some(Focus::Trace),
            _ => None,
        }
    }
}

/// Output shape: nested trees or flat spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Agenta,
    Opentelemetry,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agenta" => Some(Format::Agenta),
            "opentelemetry" => Some(Format::Opentelemetry),
            _ => None,
        }
    }
}

/// Half-open time window `[oldest, newest)` over span start times
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Window {
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl Window {
    pub fn new(oldest: Option<DateTime<Utc>>, newest: Option<DateTime<Utc>>) -> Self {
        Self { oldest, newest }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.oldest.map_or(true, |o| t >= o) && self.newest.map_or(true, |n| t < n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pagination {
    Offset { page: usize, size: usize },
    Cursor { next: Cursor, size: usize },
}

impl Pagination {
    pub fn size(&self) -> usize {
        match self {
            Pagination::Offset { size, .. } | Pagination::Cursor { size, .. } => *size,
        }
    }
}

/// Limits applied while validating queries
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

/// Validated query description
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDto {
    pub window: Window,
    pub focus: Focus,
    pub format: Format,
    pub filter: Option<FilterExpr>,
    pub pagination: Pagination,
    /// Position at which iteration ends, exclusive
    pub stop: Option<Cursor>,
}

impl QueryDto {
    pub fn parse(params: &QueryParams, limits: &QueryLimits) -> Result<Self, QueryError> {
        let focus = match params.focus.as_deref() {
            None | Some("") => Focus::default(),
            Some(s) => Focus::parse(s).ok_or_else(|| {
                QueryValidationError::new(
                    "focus",
                    format!("unknown focus '{}', expected span or trace", s),
                )
            })?,
        };

        let format = match params.format.as_deref() {
            None | Some("") => Format::default(),
            Some(s) => Format::parse(s).ok_or_else(|| {
                QueryValidationError::new(
                    "format",
                    format!("unknown format '{}', expected agenta or opentelemetry", s),
                )
            })?,
        };

        let oldest = parse_instant("oldest", params.oldest.as_deref())?;
        let newest = parse_instant("newest", params.newest.as_deref())?;
        if let (Some(o), Some(n)) = (oldest, newest) {
            if o > n {
                return Err(QueryValidationError::new(
                    "oldest",
                    format!("oldest {} is after newest {}", o.to_rfc3339(), n.to_rfc3339()),
                )
                .into());
            }
        }

        let filter = match params.filtering.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(FilterExpr::parse(s)?),
        };

        let size = params.size.unwrap_or(limits.default_page_size);
        if size == 0 || size > limits.max_page_size {
            return Err(QueryValidationError::new(
                "size",
                format!("size must be between 1 and {}", limits.max_page_size),
            )
            .into());
        }

        let stop = non_empty(params.stop.as_deref())
            .map(|token| Cursor::decode(token).map_err(|e| QueryError::invalid_cursor("stop", e)))
            .transpose()?;

        let pagination = match (params.page, non_empty(params.next.as_deref())) {
            (Some(_), Some(_)) => {
                return Err(QueryValidationError::new(
                    "page",
                    "page and next are mutually exclusive",
                )
                .into())
            }
            (_, Some(token)) => Pagination::Cursor {
                next: Cursor::decode(token).map_err(|e| QueryError::invalid_cursor("next", e))?,
                size,
            },
            (page, None) => {
                let page = page.unwrap_or(1);
                if page == 0 {
                    return Err(QueryValidationError::new("page", "page must be >= 1").into());
                }
                Pagination::Offset { page, size }
            }
        };

        Ok(Self {
            window: Window::new(oldest, newest),
            focus,
            format,
            filter,
            pagination,
            stop,
        })
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn parse_instant(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, QueryValidationError> {
    match non_empty(value) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                QueryValidationError::new(
                    field,
                    format!("invalid timestamp '{}', expected RFC 3339", s),
                )
            }),
    }
}

/// A rejected query parameter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct QueryValidationError {
    pub field: String,
    pub message: String,
}

impl QueryValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SortKey;
    use chrono::TimeZone;

    fn params() -> QueryParams {
        QueryParams::default()
    }

    fn rejected_field(p: &QueryParams) -> String {
        match QueryDto::parse(p, &QueryLimits::default()) {
            Err(QueryError::Validation(e)) => e.field,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let dto = QueryDto::parse(&params(), &QueryLimits::default()).unwrap();
        assert_eq!(dto.focus, Focus::Span);
        assert_eq!(dto.format, Format::Agenta);
        assert_eq!(dto.window, Window::default());
        assert_eq!(
            dto.pagination,
            Pagination::Offset {
                page: 1,
                size: DEFAULT_PAGE_SIZE
            }
        );
        assert!(dto.stop.is_none());
    }

    #[test]
    fn test_size_bounds() {
        for size in [0, DEFAULT_MAX_PAGE_SIZE + 1] {
            let p = QueryParams {
                size: Some(size),
                ..params()
            };
            assert_eq!(rejected_field(&p), "size");
        }
        let p = QueryParams {
            size: Some(DEFAULT_MAX_PAGE_SIZE),
            ..params()
        };
        assert!(QueryDto::parse(&p, &QueryLimits::default()).is_ok());
    }

    #[test]
    fn test_window_parsing() {
        let p = QueryParams {
            oldest: Some("2024-01-01T00:00:00Z".to_string()),
            newest: Some("2024-01-02T00:00:00+00:00".to_string()),
            ..params()
        };
        let dto = QueryDto::parse(&p, &QueryLimits::default()).unwrap();
        let oldest = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let newest = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(dto.window, Window::new(Some(oldest), Some(newest)));
        assert!(dto.window.contains(oldest));
        assert!(!dto.window.contains(newest));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let p = QueryParams {
            oldest: Some("2024-01-02T00:00:00Z".to_string()),
            newest: Some("2024-01-01T00:00:00Z".to_string()),
            ..params()
        };
        assert_eq!(rejected_field(&p), "oldest");

        let p = QueryParams {
            newest: Some("yesterday".to_string()),
            ..params()
        };
        assert_eq!(rejected_field(&p), "newest");
    }

    #[test]
    fn test_unknown_focus_and_format() {
        let p = QueryParams {
            focus: Some("session".to_string()),
            ..params()
        };
        assert_eq!(rejected_field(&p), "focus");

        let p = QueryParams {
            format: Some("csv".to_string()),
            ..params()
        };
        assert_eq!(rejected_field(&p), "format");
    }

    #[test]
    fn test_cursor_mode() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let token = Cursor::from(SortKey::new(start, "n4")).encode();
        let p = QueryParams {
            next: Some(token),
            size: Some(2),
            ..params()
        };
        let dto = QueryDto::parse(&p, &QueryLimits::default()).unwrap();
        match dto.pagination {
            Pagination::Cursor { next, size } => {
                assert_eq!(next.key(), &SortKey::new(start, "n4"));
                assert_eq!(size, 2);
            }
            other => panic!("expected cursor pagination, got {:?}", other),
        }
    }

    #[test]
    fn test_page_and_next_are_exclusive() {
        let token = Cursor::from(SortKey::new(Utc::now(), "n")).encode();
        let p = QueryParams {
            page: Some(2),
            next: Some(token),
            ..params()
        };
        assert_eq!(rejected_field(&p), "page");
    }

    #[test]
    fn test_garbage_cursor_rejected() {
        let p = QueryParams {
            next: Some("!!not-a-cursor!!".to_string()),
            ..params()
        };
        match QueryDto::parse(&p, &QueryLimits::default()) {
            Err(QueryError::InvalidCursor { param, .. }) => assert_eq!(param, "next"),
            other => panic!("expected invalid cursor, got {:?}", other),
        }
    }
}
