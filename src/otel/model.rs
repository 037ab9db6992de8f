//! OTLP/HTTP JSON wire model

use serde::Deserialize;
use serde_json::Value as Json;

/// OpenTelemetry span kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "UNSPECIFIED",
            SpanKind::Internal => "INTERNAL",
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }
}

/// OTel status codes: 0 unset, 1 ok, 2 error
pub const STATUS_CODE_ERROR: i32 = 2;

/// OTLP JSON format structures (for HTTP/JSON ingest)
pub mod otlp_json {
    use super::*;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ExportTraceServiceRequest {
        #[serde(default)]
        pub resource_spans: Vec<ResourceSpans>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ResourceSpans {
        pub resource: Option<Resource>,
        #[serde(default)]
        pub scope_spans: Vec<ScopeSpans>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Resource {
        #[serde(default)]
        pub attributes: Vec<KeyValue>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ScopeSpans {
        pub scope: Option<InstrumentationScope>,
        #[serde(default)]
        pub spans: Vec<Json>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InstrumentationScope {
        pub name: Option<String>,
        pub version: Option<String>,
    }

    /// Spans are kept as raw JSON inside [`ScopeSpans`] and parsed one at a
    /// time, so one malformed span does not sink the whole export.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Span {
        pub trace_id: String,
        pub span_id: String,
        pub parent_span_id: Option<String>,
        pub trace_state: Option<String>,
        pub name: String,
        pub kind: Option<i32>,
        pub start_time_unix_nano: UnixNanos,
        pub end_time_unix_nano: UnixNanos,
        #[serde(default)]
        pub attributes: Vec<KeyValue>,
        #[serde(default)]
        pub events: Vec<Event>,
        pub status: Option<Status>,
    }

    /// Nanosecond timestamps arrive as decimal strings or plain numbers
    #[derive(Debug, Clone, Deserialize)]
    #[serde(untagged)]
    pub enum UnixNanos {
        Number(u64),
        Text(String),
    }

    impl UnixNanos {
        pub fn as_u64(&self) -> Option<u64> {
            match self {
                UnixNanos::Number(n) => Some(*n),
                UnixNanos::Text(s) => s.trim().parse().ok(),
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct KeyValue {
        pub key: String,
        #[serde(default)]
        pub value: AnyValue,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct AnyValue {
        pub string_value: Option<String>,
        pub int_value: Option<Json>, // string per the JSON mapping, number in practice
        pub double_value: Option<f64>,
        pub bool_value: Option<bool>,
        pub array_value: Option<ArrayValue>,
        pub kvlist_value: Option<KeyValueList>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct ArrayValue {
        #[serde(default)]
        pub values: Vec<AnyValue>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct KeyValueList {
        #[serde(default)]
        pub values: Vec<KeyValue>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Event {
        pub name: String,
        #[serde(default)]
        pub attributes: Vec<KeyValue>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Status {
        pub code: Option<i32>,
        pub message: Option<String>,
    }

    impl AnyValue {
        pub fn to_json(&self) -> Json {
            if let Some(s) = &self.string_value {
                return Json::String(s.clone());
            }
            if let Some(i) = &self.int_value {
                let parsed = match i {
                    Json::String(s) => s
                        .parse::<i64>()
                        .map(Json::from)
                        .or_else(|_| s.parse::<u64>().map(Json::from))
                        .ok(),
                    Json::Number(n) => Some(Json::Number(n.clone())),
                    _ => None,
                };
                if let Some(n) = parsed {
                    return n;
                }
            }
            if let Some(d) = self.double_value {
                return Json::from(d);
            }
            if let Some(b) = self.bool_value {
                return Json::Bool(b);
            }
            if let Some(arr) = &self.array_value {
                return Json::Array(arr.values.iter().map(AnyValue::to_json).collect());
            }
            if let Some(kv) = &self.kvlist_value {
                return Json::Object(
                    kv.values
                        .iter()
                        .map(|kv| (kv.key.clone(), kv.value.to_json()))
                        .collect(),
                );
            }
            Json::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::otlp_json::*;
    use super::*;

    #[test]
    fn test_span_kind_from_i32() {
        assert_eq!(SpanKind::from_i32(0), SpanKind::Unspecified);
        assert_eq!(SpanKind::from_i32(2), SpanKind::Server);
        assert_eq!(SpanKind::from_i32(3).as_str(), "CLIENT");
    }

    #[test]
    fn test_any_value_conversion() {
        let v: AnyValue = serde_json::from_str(r#"{"intValue": "42"}"#).unwrap();
        assert_eq!(v.to_json(), Json::from(42));

        let v: AnyValue = serde_json::from_str(r#"{"intValue": "18446744073709551615"}"#).unwrap();
        assert_eq!(v.to_json(), Json::from(u64::MAX));

        let v: AnyValue = serde_json::from_str(r#"{"intValue": 7}"#).unwrap();
        assert_eq!(v.to_json(), Json::from(7));

        let v: AnyValue = serde_json::from_str(
            r#"{"kvlistValue": {"values": [{"key": "a", "value": {"arrayValue": {"values": [{"boolValue": true}]}}}]}}"#,
        )
        .unwrap();
        assert_eq!(v.to_json(), serde_json::json!({"a": [true]}));
    }

    #[test]
    fn test_nanos_as_text_or_number() {
        let n: UnixNanos = serde_json::from_str(r#""1700000000000000000""#).unwrap();
        assert_eq!(n.as_u64(), Some(1_700_000_000_000_000_000));
        let n: UnixNanos = serde_json::from_str("1700000000000000000").unwrap();
        assert_eq!(n.as_u64(), Some(1_700_000_000_000_000_000));
    }
}
