//! Predicate trees over span fields
//!
//! Filters arrive as a JSON string:
//!
//! ```json
//! {"and": [
//!     {"field": "status", "op": "eq", "value": "FAILURE"},
//!     {"not": {"field": "cost", "op": "gt", "value": 1.5}}
//! ]}
//! ```
//!
//! Composites are `and`, `or` and `not`. Leaves name a field, an operator
//! and a value whose type must fit the field.

use serde_json::Value as Json;

use super::dto::QueryValidationError;
use crate::span::{Span, StatusCode};

/// Deepest nesting accepted for a filter expression
pub const MAX_FILTER_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    EventName,
    EventType,
    Environment,
    Variant,
    Status,
    Cost,
    /// Span duration in milliseconds
    Latency,
    TotalTokens,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Status,
    Number,
}

impl FilterField {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "event_name" => Some(FilterField::EventName),
            "event_type" => Some(FilterField::EventType),
            "environment" => Some(FilterField::Environment),
            "variant" => Some(FilterField::Variant),
            "status" => Some(FilterField::Status),
            "cost" => Some(FilterField::Cost),
            "latency" => Some(FilterField::Latency),
            "total_tokens" => Some(FilterField::TotalTokens),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::EventName => "event_name",
            FilterField::EventType => "event_type",
            FilterField::Environment => "environment",
            FilterField::Variant => "variant",
            FilterField::Status => "status",
            FilterField::Cost => "cost",
            FilterField::Latency => "latency",
            FilterField::TotalTokens => "total_tokens",
        }
    }

    fn kind(&self) -> FieldKind {
        match self {
            FilterField::EventName
            | FilterField::EventType
            | FilterField::Environment
            | FilterField::Variant => FieldKind::Text,
            FilterField::Status => FieldKind::Status,
            FilterField::Cost | FilterField::Latency | FilterField::TotalTokens => {
                FieldKind::Number
            }
        }
    }

    fn supports(&self, op: ComparisonOp) -> bool {
        use ComparisonOp::*;
        match self.kind() {
            FieldKind::Text => matches!(op, Eq | Neq | In | Contains),
            FieldKind::Status => matches!(op, Eq | Neq | In),
            FieldKind::Number => !matches!(op, Contains),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

impl ComparisonOp {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(ComparisonOp::Eq),
            "neq" => Some(ComparisonOp::Neq),
            "gt" => Some(ComparisonOp::Gt),
            "gte" => Some(ComparisonOp::Gte),
            "lt" => Some(ComparisonOp::Lt),
            "lte" => Some(ComparisonOp::Lte),
            "in" => Some(ComparisonOp::In),
            "contains" => Some(ComparisonOp::Contains),
            _ => None,
        }
    }
}

/// Typed comparison operand
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Status(StatusCode),
    Number(f64),
    TextList(Vec<String>),
    StatusList(Vec<StatusCode>),
    NumberList(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: FilterField,
    pub op: ComparisonOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Condition(Condition),
}

impl FilterExpr {
    pub fn condition(field: FilterField, op: ComparisonOp, value: FilterValue) -> Self {
        FilterExpr::Condition(Condition { field, op, value })
    }

    /// Parse and type-check a serialized filter expression
    pub fn parse(input: &str) -> Result<Self, QueryValidationError> {
        let json: Json = serde_json::from_str(input)
            .map_err(|e| QueryValidationError::new("filtering", format!("invalid JSON: {}", e)))?;
        parse_expr(&json, "filtering", 1)
    }

    /// Evaluate against one span
    pub fn matches(&self, span: &Span) -> bool {
        match self {
            FilterExpr::And(children) => children.iter().all(|c| c.matches(span)),
            FilterExpr::Or(children) => children.iter().any(|c| c.matches(span)),
            FilterExpr::Not(inner) => !inner.matches(span),
            FilterExpr::Condition(cond) => cond.matches(span),
        }
    }
}

impl Condition {
    fn matches(&self, span: &Span) -> bool {
        match self.field.kind() {
            FieldKind::Text => {
                let actual = match self.field {
                    FilterField::EventName => Some(span.event_name.as_str()),
                    FilterField::EventType => span.event_type.as_deref(),
                    FilterField::Environment => span.environment.as_deref(),
                    FilterField::Variant => span.variant.as_ref().map(|v| v.variant_id.as_str()),
                    _ => None,
                };
                match actual {
                    Some(actual) => self.compare_text(actual),
                    None => self.op == ComparisonOp::Neq,
                }
            }
            FieldKind::Status => self.compare_status(span.status.value),
            FieldKind::Number => {
                let actual = match self.field {
                    FilterField::Cost => span.cost,
                    FilterField::Latency => Some(span.duration_ms()),
                    FilterField::TotalTokens => span.tokens.map(|t| t.total as f64),
                    _ => None,
                };
                match actual {
                    Some(actual) => self.compare_number(actual),
                    None => self.op == ComparisonOp::Neq,
                }
            }
        }
    }

    fn compare_text(&self, actual: &str) -> bool {
        match (&self.op, &self.value) {
            (ComparisonOp::Eq, FilterValue::Text(v)) => actual == v,
            (ComparisonOp::Neq, FilterValue::Text(v)) => actual != v,
            (ComparisonOp::Contains, FilterValue::Text(v)) => actual.contains(v.as_str()),
            (ComparisonOp::In, FilterValue::TextList(vs)) => vs.iter().any(|v| v == actual),
            _ => false,
        }
    }

    fn compare_status(&self, actual: StatusCode) -> bool {
        match (&self.op, &self.value) {
            (ComparisonOp::Eq, FilterValue::Status(v)) => actual == *v,
            (ComparisonOp::Neq, FilterValue::Status(v)) => actual != *v,
            (ComparisonOp::In, FilterValue::StatusList(vs)) => vs.contains(&actual),
            _ => false,
        }
    }

    fn compare_number(&self, actual: f64) -> bool {
        match (&self.op, &self.value) {
            (ComparisonOp::Eq, FilterValue::Number(v)) => actual == *v,
            (ComparisonOp::Neq, FilterValue::Number(v)) => actual != *v,
            (ComparisonOp::Gt, FilterValue::Number(v)) => actual > *v,
            (ComparisonOp::Gte, FilterValue::Number(v)) => actual >= *v,
            (ComparisonOp::Lt, FilterValue::Number(v)) => actual < *v,
            (ComparisonOp::Lte, FilterValue::Number(v)) => actual <= *v,
            (ComparisonOp::In, FilterValue::NumberList(vs)) => vs.contains(&actual),
            _ => false,
        }
    }
}

fn parse_expr(json: &Json, path: &str, depth: usize) -> Result<FilterExpr, QueryValidationError> {
    if depth > MAX_FILTER_DEPTH {
        return Err(QueryValidationError::new(
            path,
            format!("filter nesting exceeds {} levels", MAX_FILTER_DEPTH),
        ));
    }

    let obj = json
        .as_object()
        .ok_or_else(|| QueryValidationError::new(path, "expected an object"))?;

    if obj.contains_key("field") {
        return parse_condition(obj, path);
    }

    if obj.len() != 1 {
        return Err(QueryValidationError::new(
            path,
            "expected exactly one of 'and', 'or', 'not' or a condition",
        ));
    }

    let (key, inner) = obj.iter().next().ok_or_else(|| {
        QueryValidationError::new(path, "empty filter object")
    })?;
    let child_path = format!("{}.{}", path, key);

    match key.as_str() {
        "and" | "or" => {
            let items = inner
                .as_array()
                .ok_or_else(|| QueryValidationError::new(&child_path, "expected an array"))?;
            if items.is_empty() {
                return Err(QueryValidationError::new(&child_path, "must not be empty"));
            }
            let children = items
                .iter()
                .enumerate()
                .map(|(i, item)| parse_expr(item, &format!("{}[{}]", child_path, i), depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if key == "and" {
                FilterExpr::And(children)
            } else {
                FilterExpr::Or(children)
            })
        }
        "not" => Ok(FilterExpr::Not(Box::new(parse_expr(
            inner,
            &child_path,
            depth + 1,
        )?))),
        other => Err(QueryValidationError::new(
            path,
            format!("unknown operator '{}'", other),
        )),
    }
}

fn parse_condition(
    obj: &serde_json::Map<String, Json>,
    path: &str,
) -> Result<FilterExpr, QueryValidationError> {
    if let Some(extra) = obj.keys().find(|k| !matches!(k.as_str(), "field" | "op" | "value")) {
        return Err(QueryValidationError::new(
            path,
            format!("unexpected key '{}' in condition", extra),
        ));
    }

    let field_name = obj
        .get("field")
        .and_then(Json::as_str)
        .ok_or_else(|| QueryValidationError::new(format!("{}.field", path), "expected a string"))?;
    let field = FilterField::parse(field_name).ok_or_else(|| {
        QueryValidationError::new(
            format!("{}.field", path),
            format!("unknown field '{}'", field_name),
        )
    })?;

    let op_name = obj
        .get("op")
        .and_then(Json::as_str)
        .ok_or_else(|| QueryValidationError::new(format!("{}.op", path), "expected a string"))?;
    let op = ComparisonOp::parse(op_name).ok_or_else(|| {
        QueryValidationError::new(format!("{}.op", path), format!("unknown operator '{}'", op_name))
    })?;
    if !field.supports(op) {
        return Err(QueryValidationError::new(
            format!("{}.op", path),
            format!("operator '{}' is not supported for field '{}'", op_name, field.as_str()),
        ));
    }

    let value_path = format!("{}.value", path);
    let raw = obj
        .get("value")
        .ok_or_else(|| QueryValidationError::new(&value_path, "missing value"))?;
    let value = parse_value(field, op, raw, &value_path)?;

    Ok(FilterExpr::condition(field, op, value))
}

fn parse_value(
    field: FilterField,
    op: ComparisonOp,
    raw: &Json,
    path: &str,
) -> Result<FilterValue, QueryValidationError> {
    if op == ComparisonOp::In {
        let items = raw
            .as_array()
            .ok_or_else(|| QueryValidationError::new(path, "'in' expects an array"))?;
        if items.is_empty() {
            return Err(QueryValidationError::new(path, "'in' list must not be empty"));
        }
        return match field.kind() {
            FieldKind::Text => items
                .iter()
                .map(|v| text(v, path))
                .collect::<Result<_, _>>()
                .map(FilterValue::TextList),
            FieldKind::Status => items
                .iter()
                .map(|v| status(v, path))
                .collect::<Result<_, _>>()
                .map(FilterValue::StatusList),
            FieldKind::Number => items
                .iter()
                .map(|v| number(v, path))
                .collect::<Result<_, _>>()
                .map(FilterValue::NumberList),
        };
    }

    match field.kind() {
        FieldKind::Text => text(raw, path).map(FilterValue::Text),
        FieldKind::Status => status(raw, path).map(FilterValue::Status),
        FieldKind::Number => number(raw, path).map(FilterValue::Number),
    }
}

fn text(v: &Json, path: &str) -> Result<String, QueryValidationError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| QueryValidationError::new(path, "expected a string"))
}

fn status(v: &Json, path: &str) -> Result<StatusCode, QueryValidationError> {
    let s = v
        .as_str()
        .ok_or_else(|| QueryValidationError::new(path, "expected a status string"))?;
    StatusCode::parse(s).ok_or_else(|| {
        QueryValidationError::new(
            path,
            format!("unknown status '{}', expected INITIATED, SUCCESS or FAILURE", s),
        )
    })
}

fn number(v: &Json, path: &str) -> Result<f64, QueryValidationError> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| QueryValidationError::new(path, "expected a number"))
}
