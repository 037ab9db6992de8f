//! Trace reconstruction
//!
//! Spans are stored flat, each carrying `trace_id` and `parent_span_id`.
//! Trees are rebuilt on read by walking an index keyed by
//! `(trace_id, parent_span_id)`; nodes own their children, so there are no
//! back-references.
//!
//! Nesting is capped at [`MAX_TREE_DEPTH`]. A span that would sit deeper is
//! emitted as another root of its trace, so every walk over a `TraceNode`
//! (serialization, drop, clone) stays within a bounded stack.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::model::{SortKey, Span};

/// Deepest nesting level a rebuilt tree may have; the root is level 0
pub const MAX_TREE_DEPTH: usize = 128;

/// A span together with its reconstructed subtree
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    #[serde(flatten)]
    pub span: Span,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    pub fn sort_key(&self) -> SortKey {
        self.span.sort_key()
    }

    /// Number of spans in this subtree, including this one
    pub fn span_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }

    /// Levels below this node; a leaf has depth 0
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self, 0)];
        while let Some((node, level)) = stack.pop() {
            deepest = deepest.max(level);
            stack.extend(node.children.iter().map(|c| (c, level + 1)));
        }
        deepest
    }

    /// Depth-first, parent before children
    pub fn flatten(self) -> Vec<Span> {
        let mut out = Vec::with_capacity(self.span_count());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            stack.extend(node.children.into_iter().rev());
            out.push(node.span);
        }
        out
    }

    /// Depth-first, parent before children
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            ids.push(node.span.node_id.as_str());
            stack.extend(node.children.iter().rev());
        }
        ids
    }
}

type ParentKey = (String, Option<String>);

/// Index over a flat span collection
pub struct TraceIndex {
    spans: Vec<Span>,
    by_id: HashMap<(String, String), usize>,
    children: HashMap<ParentKey, Vec<usize>>,
}

impl TraceIndex {
    pub fn new(spans: Vec<Span>) -> Self {
        let mut by_id = HashMap::with_capacity(spans.len());
        let mut children: HashMap<ParentKey, Vec<usize>> = HashMap::new();

        for (idx, span) in spans.iter().enumerate() {
            by_id.insert((span.trace_id.clone(), span.node_id.clone()), idx);
            children
                .entry((span.trace_id.clone(), span.parent_span_id.clone()))
                .or_default()
                .push(idx);
        }

        // Children run in execution order
        for list in children.values_mut() {
            list.sort_by(|&a, &b| {
                spans[a]
                    .start_time
                    .cmp(&spans[b].start_time)
                    .then_with(|| spans[a].node_id.cmp(&spans[b].node_id))
            });
        }

        Self {
            spans,
            by_id,
            children,
        }
    }

    fn has_parent_in_set(&self, idx: usize) -> bool {
        let span = &self.spans[idx];
        match &span.parent_span_id {
            Some(parent) => self
                .by_id
                .contains_key(&(span.trace_id.clone(), parent.clone())),
            None => false,
        }
    }

    fn child_indices(&self, idx: usize) -> &[usize] {
        let span = &self.spans[idx];
        self.children
            .get(&(span.trace_id.clone(), Some(span.node_id.clone())))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All node ids below `node_id` in `trace_id`, excluding `node_id` itself.
    pub fn descendants(&self, trace_id: &str, node_id: &str) -> Vec<String> {
        let Some(&start) = self.by_id.get(&(trace_id.to_string(), node_id.to_string())) else {
            return Vec::new();
        };

        let mut visited = HashSet::from([start]);
        let mut stack = self.child_indices(start).to_vec();
        let mut out = Vec::new();
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            out.push(self.spans[idx].node_id.clone());
            stack.extend_from_slice(self.child_indices(idx));
        }
        out
    }

    /// Rebuild every tree in the index.
    ///
    /// Spans whose parent is missing from the set are treated as roots. Spans
    /// caught in a parent cycle are emitted once, rooted at the earliest one
    /// in sort order. Spans below [`MAX_TREE_DEPTH`] start a new root.
    pub fn into_trees(self) -> Vec<TraceNode> {
        let n = self.spans.len();
        let mut walk = Walk {
            visited: vec![false; n],
            parent: vec![None; n],
            order: Vec::with_capacity(n),
        };

        for root in (0..n).filter(|&idx| !self.has_parent_in_set(idx)) {
            self.walk_from(root, &mut walk);
        }

        let mut leftovers: Vec<usize> = (0..n).filter(|&i| !walk.visited[i]).collect();
        leftovers.sort_by_key(|&i| self.spans[i].sort_key());
        for idx in leftovers {
            self.walk_from(idx, &mut walk);
        }

        // Reverse pre-order finishes every child before its parent
        let mut slots: Vec<Option<Span>> = self.spans.into_iter().map(Some).collect();
        let mut built: Vec<Vec<TraceNode>> = (0..n).map(|_| Vec::new()).collect();
        let mut trees = Vec::new();
        for &idx in walk.order.iter().rev() {
            let Some(span) = slots[idx].take() else {
                continue;
            };
            let mut children = std::mem::take(&mut built[idx]);
            children.reverse();
            let node = TraceNode { span, children };
            match walk.parent[idx] {
                Some(parent) => built[parent].push(node),
                None => trees.push(node),
            }
        }

        trees.sort_by_key(TraceNode::sort_key);
        trees
    }

    /// Iterative pre-order walk that claims every unvisited span below `root`
    fn walk_from(&self, root: usize, walk: &mut Walk) {
        let mut stack: Vec<(usize, Option<usize>, usize)> = vec![(root, None, 0)];
        while let Some((idx, parent, level)) = stack.pop() {
            if walk.visited[idx] {
                continue;
            }
            walk.visited[idx] = true;
            walk.parent[idx] = parent;
            walk.order.push(idx);

            let (child_parent, child_level) = if level + 1 > MAX_TREE_DEPTH {
                (None, 0)
            } else {
                (Some(idx), level + 1)
            };
            stack.extend(
                self.child_indices(idx)
                    .iter()
                    .rev()
                    .filter(|&&child| !walk.visited[child])
                    .map(|&child| (child, child_parent, child_level)),
            );
        }
    }
}

/// Bookkeeping shared by every walk in one `into_trees` call
struct Walk {
    visited: Vec<bool>,
    parent: Vec<Option<usize>>,
    order: Vec<usize>,
}

/// Convenience wrapper around [`TraceIndex::into_trees`]
pub fn build_trees(spans: Vec<Span>) -> Vec<TraceNode> {
    TraceIndex::new(spans).into_trees()
}
