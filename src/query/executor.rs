use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use super::cursor::Cursor;
use super::dto::{Focus, Format};
use super::planner::QueryPlan;
use crate::span::{build_trees, SortKey, Span, TraceNode};
use crate::storage::{PersistenceGateway, StorageError};

/// One trace in a trace-focused result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceItem {
    pub trace_id: String,
    /// Root trees, newest first. More than one when parents are missing.
    pub spans: Vec<TraceNode>,
    #[serde(skip)]
    key: SortKey,
}

impl TraceItem {
    /// Position of the trace in the result order
    pub fn sort_key(&self) -> SortKey {
        self.key.clone()
    }

    pub fn span_count(&self) -> usize {
        self.spans.iter().map(TraceNode::span_count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    Spans(Vec<Span>),
    Traces(Vec<TraceItem>),
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Spans(s) => s.len(),
            QueryOutput::Traces(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query execution result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Matching spans or traces before pagination
    pub count: usize,
    pub next_cursor: Option<String>,
    #[serde(flatten)]
    pub output: QueryOutput,
}

/// Execute a query plan against a gateway
pub async fn execute_query(
    gateway: &dyn PersistenceGateway,
    project_id: &str,
    plan: &QueryPlan,
) -> Result<QueryResult, StorageError> {
    let start = Instant::now();

    let result = match plan.focus {
        Focus::Span => execute_span_focus(gateway, project_id, plan).await?,
        Focus::Trace => execute_trace_focus(gateway, project_id, plan).await?,
    };

    tracing::debug!(
        project_id,
        focus = ?plan.focus,
        count = result.count,
        returned = result.output.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "query executed"
    );
    Ok(result)
}

async fn execute_span_focus(
    gateway: &dyn PersistenceGateway,
    project_id: &str,
    plan: &QueryPlan,
) -> Result<QueryResult, StorageError> {
    let scan = gateway.query(project_id, &plan.with_lookahead()).await?;
    let (spans, next_cursor) = split_page(scan.spans, plan.page.limit, Span::sort_key);

    Ok(QueryResult {
        count: scan.total,
        next_cursor,
        output: QueryOutput::Spans(spans),
    })
}

/// A trace qualifies when any of its spans matches; it is then returned whole.
/// Only the traces on the requested page are read back from the store.
async fn execute_trace_focus(
    gateway: &dyn PersistenceGateway,
    project_id: &str,
    plan: &QueryPlan,
) -> Result<QueryResult, StorageError> {
    let page = gateway.query_traces(project_id, &plan.with_lookahead()).await?;
    if page.traces.is_empty() {
        return Ok(QueryResult {
            count: page.total,
            next_cursor: None,
            output: empty_output(plan),
        });
    }

    let trace_ids: Vec<String> = page.traces.iter().map(|(_, id)| id.clone()).collect();
    let spans = gateway.read_traces(project_id, &trace_ids).await?;
    let items = group_into_traces(page.traces, build_trees(spans));
    let (items, next_cursor) = split_page(items, plan.page.limit, TraceItem::sort_key);

    let output = match plan.format {
        Format::Agenta => QueryOutput::Traces(items),
        Format::Opentelemetry => QueryOutput::Spans(
            items
                .into_iter()
                .flat_map(|item| item.spans)
                .flat_map(TraceNode::flatten)
                .collect(),
        ),
    };

    Ok(QueryResult {
        count: page.total,
        next_cursor,
        output,
    })
}

fn empty_output(plan: &QueryPlan) -> QueryOutput {
    match (plan.focus, plan.format) {
        (Focus::Trace, Format::Agenta) => QueryOutput::Traces(Vec::new()),
        _ => QueryOutput::Spans(Vec::new()),
    }
}

/// Attach trees to the paged traces, keeping page order. A trace deleted
/// between the page scan and the read drops out.
fn group_into_traces(order: Vec<(SortKey, String)>, trees: Vec<TraceNode>) -> Vec<TraceItem> {
    let mut by_trace: HashMap<String, Vec<TraceNode>> = HashMap::new();
    for tree in trees {
        by_trace.entry(tree.span.trace_id.clone()).or_default().push(tree);
    }

    order
        .into_iter()
        .filter_map(|(key, trace_id)| {
            let spans = by_trace.remove(&trace_id)?;
            Some(TraceItem {
                trace_id,
                spans,
                key,
            })
        })
        .collect()
}

/// Trim a lookahead page back to `limit`. A cursor is issued only when the lookahead
/// found at least one item beyond the page.
fn split_page<T, F>(mut items: Vec<T>, limit: Option<usize>, key: F) -> (Vec<T>, Option<String>)
where
    F: Fn(&T) -> SortKey,
{
    let Some(limit) = limit else {
        return (items, None);
    };
    if items.len() <= limit {
        return (items, None);
    }
    items.truncate(limit);
    let cursor = items.last().map(|last| Cursor::from(key(last)).encode());
    (items, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::dto::{QueryDto, QueryLimits, QueryParams};
    use crate::query::planner::plan_query;
    use crate::span::{SpanStatus, MAX_TREE_DEPTH};
    use crate::storage::{DeleteOutcome, MemoryStore, ReadMany, ScanResult, TracePage};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn span(node: &str, trace: &str, parent: Option<&str>, start: i64) -> Span {
        let s = Span::new(
            "p1",
            node,
            trace,
            node,
            Utc.timestamp_opt(start, 0).unwrap(),
            Utc.timestamp_opt(start + 1, 0).unwrap(),
        )
        .unwrap();
        match parent {
            Some(p) => s.with_parent(p),
            None => s,
        }
    }

    async fn run(store: &MemoryStore, params: QueryParams) -> QueryResult {
        let dto = QueryDto::parse(&params, &QueryLimits::default()).unwrap();
        execute_query(store, "p1", &plan_query(&dto)).await.unwrap()
    }

    fn span_ids(result: &QueryResult) -> Vec<String> {
        match &result.output {
            QueryOutput::Spans(spans) => spans.iter().map(|s| s.node_id.clone()).collect(),
            QueryOutput::Traces(_) => panic!("expected spans"),
        }
    }

    async fn five_spans() -> MemoryStore {
        let store = MemoryStore::new();
        let spans = (1..=5)
            .map(|i| span(&i.to_string(), &format!("t{}", i), None, i * 10))
            .collect();
        store.create_many(spans).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_offset_pages_with_cursor() {
        let store = five_spans().await;

        let first = run(
            &store,
            QueryParams {
                size: Some(2),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(span_ids(&first), vec!["5", "4"]);
        assert_eq!(first.count, 5);

        let second = run(
            &store,
            QueryParams {
                page: Some(2),
                size: Some(2),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(span_ids(&second), vec!["3", "2"]);

        // The cursor from page one continues where it left off
        let continued = run(
            &store,
            QueryParams {
                next: first.next_cursor.clone(),
                size: Some(2),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(span_ids(&continued), vec!["3", "2"]);
    }

    #[tokio::test]
    async fn test_cursor_stable_under_new_inserts() {
        let store = five_spans().await;
        let first = run(
            &store,
            QueryParams {
                size: Some(2),
                ..Default::default()
            },
        )
        .await;

        // A newer span lands ahead of the page already read
        store.create_one(span("6", "t6", None, 60)).await.unwrap();

        let continued = run(
            &store,
            QueryParams {
                next: first.next_cursor,
                size: Some(2),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(span_ids(&continued), vec!["3", "2"]);
    }

    #[tokio::test]
    async fn test_last_page_has_no_cursor() {
        let store = five_spans().await;
        let result = run(
            &store,
            QueryParams {
                size: Some(5),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(result.output.len(), 5);
        assert!(result.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_stop_bounds_iteration() {
        let store = five_spans().await;
        let stop = Cursor::from(SortKey::new(Utc.timestamp_opt(20, 0).unwrap(), "2")).encode();
        let result = run(
            &store,
            QueryParams {
                stop: Some(stop),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(span_ids(&result), vec!["5", "4", "3"]);
    }

    async fn two_traces() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_many(vec![
                span("R", "t1", None, 10),
                span("A", "t1", Some("R"), 11),
                span("B", "t1", Some("A"), 12).with_status(SpanStatus::failure("boom")),
                span("S", "t2", None, 20),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_trace_focus_returns_whole_trace() {
        let store = two_traces().await;
        let result = run(
            &store,
            QueryParams {
                focus: Some("trace".to_string()),
                filtering: Some(r#"{"field":"status","op":"eq","value":"FAILURE"}"#.to_string()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(result.count, 1);
        let QueryOutput::Traces(traces) = result.output else {
            panic!("expected traces");
        };
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id, "t1");
        let mut ids = traces[0].spans[0].node_ids();
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "R"]);
    }

    #[tokio::test]
    async fn test_trace_focus_flattens_for_opentelemetry() {
        let store = two_traces().await;
        let result = run(
            &store,
            QueryParams {
                focus: Some("trace".to_string()),
                format: Some("opentelemetry".to_string()),
                ..Default::default()
            },
        )
        .await;

        assert_eq!(result.count, 2);
        assert_eq!(span_ids(&result), vec!["S", "R", "A", "B"]);
    }

    #[tokio::test]
    async fn test_trace_focus_pages_by_trace() {
        let store = two_traces().await;
        let first = run(
            &store,
            QueryParams {
                focus: Some("trace".to_string()),
                size: Some(1),
                ..Default::default()
            },
        )
        .await;
        let QueryOutput::Traces(ref traces) = first.output else {
            panic!("expected traces");
        };
        assert_eq!(traces[0].trace_id, "t2");

        let second = run(
            &store,
            QueryParams {
                focus: Some("trace".to_string()),
                size: Some(1),
                next: first.next_cursor.clone(),
                ..Default::default()
            },
        )
        .await;
        let QueryOutput::Traces(traces) = second.output else {
            panic!("expected traces");
        };
        assert_eq!(traces[0].trace_id, "t1");
        assert_eq!(traces[0].span_count(), 3);
        assert!(second.next_cursor.is_none());
    }

    /// Records how many traces were read back in full
    struct ReadCounter {
        inner: MemoryStore,
        traces_read: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceGateway for ReadCounter {
        async fn query(&self, p: &str, plan: &QueryPlan) -> Result<ScanResult, StorageError> {
            self.inner.query(p, plan).await
        }
        async fn query_traces(&self, p: &str, plan: &QueryPlan) -> Result<TracePage, StorageError> {
            self.inner.query_traces(p, plan).await
        }
        async fn create_one(&self, span: Span) -> Result<(), StorageError> {
            self.inner.create_one(span).await
        }
        async fn create_many(&self, spans: Vec<Span>) -> Result<(), StorageError> {
            self.inner.create_many(spans).await
        }
        async fn read_one(&self, p: &str, id: &str) -> Result<Span, StorageError> {
            self.inner.read_one(p, id).await
        }
        async fn read_many(&self, p: &str, ids: &[String]) -> Result<ReadMany, StorageError> {
            self.inner.read_many(p, ids).await
        }
        async fn read_traces(&self, p: &str, ids: &[String]) -> Result<Vec<Span>, StorageError> {
            self.traces_read.fetch_add(ids.len(), Ordering::SeqCst);
            self.inner.read_traces(p, ids).await
        }
        async fn delete_one(&self, p: &str, id: &str) -> Result<(), StorageError> {
            self.inner.delete_one(p, id).await
        }
        async fn delete_many(&self, p: &str, ids: &[String]) -> Result<DeleteOutcome, StorageError> {
            self.inner.delete_many(p, ids).await
        }
    }

    #[tokio::test]
    async fn test_trace_focus_reads_only_the_page() {
        let gateway = ReadCounter {
            inner: MemoryStore::new(),
            traces_read: AtomicUsize::new(0),
        };
        let spans = (0..200)
            .flat_map(|i| {
                let trace = format!("t{}", i);
                let root = format!("r{}", i);
                let child = format!("c{}", i);
                vec![
                    span(&root, &trace, None, i * 10),
                    span(&child, &trace, Some(&root), i * 10 + 1),
                ]
            })
            .collect();
        gateway.create_many(spans).await.unwrap();

        let dto = QueryDto::parse(
            &QueryParams {
                focus: Some("trace".to_string()),
                size: Some(5),
                ..Default::default()
            },
            &QueryLimits::default(),
        )
        .unwrap();
        let result = execute_query(&gateway, "p1", &plan_query(&dto)).await.unwrap();

        assert_eq!(result.count, 200);
        assert!(result.next_cursor.is_some());
        let QueryOutput::Traces(traces) = result.output else {
            panic!("expected traces");
        };
        let ids: Vec<&str> = traces.iter().map(|t| t.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["t199", "t198", "t197", "t196", "t195"]);
        assert!(gateway.traces_read.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn test_trace_focus_serves_deep_chain() {
        let store = MemoryStore::new();
        let depth = 100_000;
        let chain = (0..depth)
            .map(|i| {
                let parent = (i > 0).then(|| format!("n{}", i - 1));
                span(&format!("n{}", i), "deep", parent.as_deref(), i)
            })
            .collect();
        store.create_many(chain).await.unwrap();

        let result = run(
            &store,
            QueryParams {
                focus: Some("trace".to_string()),
                size: Some(1),
                ..Default::default()
            },
        )
        .await;
        let QueryOutput::Traces(traces) = result.output else {
            panic!("expected traces");
        };
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].span_count(), depth as usize);
        assert!(traces[0].spans.iter().all(|t| t.depth() <= MAX_TREE_DEPTH));
        assert!(serde_json::to_string(&traces[0]).is_ok());
    }

    #[tokio::test]
    async fn test_empty_result() {
        let store = MemoryStore::new();
        let result = run(&store, QueryParams::default()).await;
        assert_eq!(result.count, 0);
        assert!(result.output.is_empty());
        assert!(result.next_cursor.is_none());
    }
}
