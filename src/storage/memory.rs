//! In-process span store
//!
//! One partition per project. A partition keeps the spans by id plus two
//! secondary indexes: the global sort order and trace membership. All three
//! are updated under the partition's write lock, so readers never observe a
//! span that is present in one index and absent from another.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::gateway::{
    DeleteOutcome, PersistenceGateway, ReadMany, ScanResult, StorageError, TracePage,
};
use crate::query::QueryPlan;
use crate::span::{SortKey, Span};

#[derive(Debug, Default)]
struct Partition {
    spans: HashMap<String, Span>,
    order: BTreeSet<SortKey>,
    traces: HashMap<String, HashSet<String>>,
}

impl Partition {
    fn upsert(&mut self, span: Span) {
        if let Some(previous) = self.spans.remove(&span.node_id) {
            self.unindex(&previous);
        }
        self.order.insert(span.sort_key());
        self.traces
            .entry(span.trace_id.clone())
            .or_default()
            .insert(span.node_id.clone());
        self.spans.insert(span.node_id.clone(), span);
    }

    fn remove(&mut self, node_id: &str) -> Option<Span> {
        let span = self.spans.remove(node_id)?;
        self.unindex(&span);
        Some(span)
    }

    fn unindex(&mut self, span: &Span) {
        self.order.remove(&span.sort_key());
        if let Some(members) = self.traces.get_mut(&span.trace_id) {
            members.remove(&span.node_id);
            if members.is_empty() {
                self.traces.remove(&span.trace_id);
            }
        }
    }

    /// Spans inside the plan's window that pass its filter, in sort order.
    /// Keys run newest first, so `newest` gives a lower bound on the range
    /// and `oldest` tells us when to stop.
    fn matching<'a>(&'a self, plan: &'a QueryPlan) -> impl Iterator<Item = (&'a SortKey, &'a Span)> {
        let keys = match plan.window.newest {
            Some(newest) => self.order.range(SortKey::new(newest, "")..),
            None => self.order.range(..),
        };
        keys.take_while(move |key| plan.window.oldest.map_or(true, |o| key.start_time() >= o))
            .filter_map(move |key| self.spans.get(key.node_id()).map(|span| (key, span)))
            .filter(move |(_, span)| plan.matches(span))
    }

    fn scan(&self, plan: &QueryPlan) -> ScanResult {
        let page = &plan.page;
        let mut total = 0;
        let mut skipped = 0;
        let mut spans = Vec::new();

        for (key, span) in self.matching(plan) {
            total += 1;

            if !page.admits(key) {
                continue;
            }
            if skipped < page.offset {
                skipped += 1;
                continue;
            }
            if page.limit.map_or(true, |l| spans.len() < l) {
                spans.push(span.clone());
            }
        }

        ScanResult { spans, total }
    }

    fn scan_traces(&self, plan: &QueryPlan) -> TracePage {
        let mut matched: HashSet<&str> = HashSet::new();
        for (_, span) in self.matching(plan) {
            matched.insert(span.trace_id.as_str());
        }

        let mut positioned: Vec<(SortKey, String)> = matched
            .into_iter()
            .filter_map(|trace_id| {
                self.trace_position(trace_id)
                    .map(|key| (key, trace_id.to_string()))
            })
            .collect();
        positioned.sort();

        let total = positioned.len();
        TracePage {
            traces: plan.page.select(positioned, |(key, _)| key.clone()),
            total,
        }
    }

    /// Sort key of the trace's newest root, or of its newest span when every
    /// member has a parent inside the trace
    fn trace_position(&self, trace_id: &str) -> Option<SortKey> {
        let members = self.traces.get(trace_id)?;
        let mut newest_root: Option<SortKey> = None;
        let mut newest: Option<SortKey> = None;

        for span in members.iter().filter_map(|id| self.spans.get(id)) {
            let key = span.sort_key();
            let has_parent = span
                .parent_span_id
                .as_ref()
                .is_some_and(|p| members.contains(p));
            if !has_parent && newest_root.as_ref().map_or(true, |k| key < *k) {
                newest_root = Some(key.clone());
            }
            if newest.as_ref().map_or(true, |k| key < *k) {
                newest = Some(key);
            }
        }
        newest_root.or(newest)
    }
}

/// Spans held in memory, partitioned by project
#[derive(Default)]
pub struct MemoryStore {
    partitions: DashMap<String, Arc<RwLock<Partition>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, project_id: &str) -> Option<Arc<RwLock<Partition>>> {
        self.partitions.get(project_id).map(|p| Arc::clone(&p))
    }

    fn partition_or_create(&self, project_id: &str) -> Arc<RwLock<Partition>> {
        if let Some(p) = self.partition(project_id) {
            return p;
        }
        Arc::clone(
            self.partitions
                .entry(project_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Insert spans directly, bypassing the gateway. Used on restore.
    pub fn load(&self, spans: Vec<Span>) -> usize {
        let count = spans.len();
        for (project_id, group) in group_by_project(spans) {
            let partition = self.partition_or_create(&project_id);
            let mut guard = partition.write();
            for span in group {
                guard.upsert(span);
            }
        }
        count
    }

    /// Copy of every partition's spans, keyed by project
    pub fn export(&self) -> Vec<(String, Vec<Span>)> {
        let partitions: Vec<(String, Arc<RwLock<Partition>>)> = self
            .partitions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        partitions
            .into_iter()
            .map(|(project_id, p)| {
                let spans = p.read().spans.values().cloned().collect();
                (project_id, spans)
            })
            .collect()
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.partitions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn span_count(&self) -> usize {
        self.partitions.iter().map(|e| e.value().read().spans.len()).sum()
    }
}

fn group_by_project(spans: Vec<Span>) -> HashMap<String, Vec<Span>> {
    let mut groups: HashMap<String, Vec<Span>> = HashMap::new();
    for span in spans {
        groups.entry(span.project_id.clone()).or_default().push(span);
    }
    groups
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn query(&self, project_id: &str, plan: &QueryPlan) -> Result<ScanResult, StorageError> {
        Ok(self
            .partition(project_id)
            .map(|p| p.read().scan(plan))
            .unwrap_or_default())
    }

    async fn query_traces(
        &self,
        project_id: &str,
        plan: &QueryPlan,
    ) -> Result<TracePage, StorageError> {
        Ok(self
            .partition(project_id)
            .map(|p| p.read().scan_traces(plan))
            .unwrap_or_default())
    }

    async fn create_one(&self, span: Span) -> Result<(), StorageError> {
        let partition = self.partition_or_create(&span.project_id);
        partition.write().upsert(span);
        Ok(())
    }

    async fn create_many(&self, spans: Vec<Span>) -> Result<(), StorageError> {
        self.load(spans);
        Ok(())
    }

    async fn read_one(&self, project_id: &str, node_id: &str) -> Result<Span, StorageError> {
        self.partition(project_id)
            .and_then(|p| p.read().spans.get(node_id).cloned())
            .ok_or_else(|| StorageError::not_found(node_id))
    }

    async fn read_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<ReadMany, StorageError> {
        let Some(partition) = self.partition(project_id) else {
            return Ok(ReadMany {
                found: Vec::new(),
                missing: node_ids.to_vec(),
            });
        };

        let guard = partition.read();
        let mut out = ReadMany::default();
        for id in node_ids {
            match guard.spans.get(id) {
                Some(span) => out.found.push(span.clone()),
                None => out.missing.push(id.clone()),
            }
        }
        Ok(out)
    }

    async fn read_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<Vec<Span>, StorageError> {
        let Some(partition) = self.partition(project_id) else {
            return Ok(Vec::new());
        };

        let guard = partition.read();
        let mut spans = Vec::new();
        for trace_id in trace_ids {
            let Some(members) = guard.traces.get(trace_id) else {
                continue;
            };
            spans.extend(members.iter().filter_map(|id| guard.spans.get(id)).cloned());
        }
        Ok(spans)
    }

    async fn delete_one(&self, project_id: &str, node_id: &str) -> Result<(), StorageError> {
        self.partition(project_id)
            .and_then(|p| p.write().remove(node_id))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(node_id))
    }

    async fn delete_many(
        &self,
        project_id: &str,
        node_ids: &[String],
    ) -> Result<DeleteOutcome, StorageError> {
        let Some(partition) = self.partition(project_id) else {
            return Ok(DeleteOutcome {
                deleted: Vec::new(),
                missing: node_ids.to_vec(),
            });
        };

        let mut guard = partition.write();
        let mut out = DeleteOutcome::default();
        for id in node_ids {
            match guard.remove(id) {
                Some(_) => out.deleted.push(id.clone()),
                None => out.missing.push(id.clone()),
            }
        }
        Ok(out)
    }
}
