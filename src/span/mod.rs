//! Span model and trace reconstruction

pub mod model;
pub mod tree;

pub use model::{
    CreateSpan, SortKey, Span, SpanError, SpanStatus, SpanVariant, StatusCode, Tokens,
    ValidationError,
};
pub use tree::{build_trees, TraceIndex, TraceNode, MAX_TREE_DEPTH};
