use super::dto::{Focus, Format, Pagination, QueryDto, Window};
use super::filter::FilterExpr;
use crate::span::{SortKey, Span};

/// Query execution plan
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    /// Start-time window, half-open
    pub window: Window,
    /// Span predicate, `None` matches everything
    pub filter: Option<FilterExpr>,
    pub focus: Focus,
    pub format: Format,
    /// Slice of the ordered result to return
    pub page: PagePlan,
}

impl QueryPlan {
    /// Does a stored span satisfy the window and the filter?
    pub fn matches(&self, span: &Span) -> bool {
        self.window.contains(span.start_time)
            && self.filter.as_ref().map_or(true, |f| f.matches(span))
    }

    /// Same selection with the limit raised by one, so the executor can tell
    /// whether another page exists.
    pub fn with_lookahead(&self) -> Self {
        Self {
            page: PagePlan {
                limit: self.page.limit.map(|l| l + 1),
                ..self.page.clone()
            },
            ..self.clone()
        }
    }
}

/// Normalized paging window over the sort order.
///
/// Offset and cursor pagination both reduce to this: skip everything up to
/// and including `after`, stop before `stop`, then skip `offset` more items
/// and return at most `limit`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagePlan {
    pub after: Option<SortKey>,
    pub stop: Option<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl PagePlan {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Is `key` inside the `(after, stop)` range?
    pub fn admits(&self, key: &SortKey) -> bool {
        self.after.as_ref().map_or(true, |a| key > a) && self.stop.as_ref().map_or(true, |s| key < s)
    }

    /// Apply the plan to items already sorted by `key`.
    pub fn select<T, F>(&self, items: Vec<T>, key: F) -> Vec<T>
    where
        F: Fn(&T) -> SortKey,
    {
        let admitted = items
            .into_iter()
            .filter(|item| self.admits(&key(item)))
            .skip(self.offset);
        match self.limit {
            Some(limit) => admitted.take(limit).collect(),
            None => admitted.collect(),
        }
    }
}

/// Create an execution plan from a validated query
pub fn plan_query(dto: &QueryDto) -> QueryPlan {
    let stop = dto.stop.as_ref().map(|c| c.key().clone());

    let page = match &dto.pagination {
        Pagination::Offset { page, size } => PagePlan {
            after: None,
            stop,
            offset: page.saturating_sub(1).saturating_mul(*size),
            limit: Some(*size),
        },
        Pagination::Cursor { next, size } => PagePlan {
            after: Some(next.key().clone()),
            stop,
            offset: 0,
            limit: Some(*size),
        },
    };

    QueryPlan {
        window: dto.window,
        filter: dto.filter.clone(),
        focus: dto.focus,
        format: dto.format,
        page,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cursor::Cursor;
    use crate::query::dto::{QueryLimits, QueryParams};
    use chrono::{TimeZone, Utc};

    fn key(secs: i64, node: &str) -> SortKey {
        SortKey::new(Utc.timestamp_opt(secs, 0).unwrap(), node)
    }

    fn dto(params: QueryParams) -> QueryDto {
        QueryDto::parse(&params, &QueryLimits::default()).unwrap()
    }

    #[test]
    fn test_offset_plan() {
        let plan = plan_query(&dto(QueryParams {
            page: Some(3),
            size: Some(20),
            ..Default::default()
        }));
        assert_eq!(plan.page.offset, 40);
        assert_eq!(plan.page.limit, Some(20));
        assert!(plan.page.after.is_none());
    }

    #[test]
    fn test_cursor_plan() {
        let plan = plan_query(&dto(QueryParams {
            next: Some(Cursor::from(key(50, "n5")).encode()),
            stop: Some(Cursor::from(key(10, "n1")).encode()),
            size: Some(2),
            ..Default::default()
        }));
        assert_eq!(plan.page.after, Some(key(50, "n5")));
        assert_eq!(plan.page.stop, Some(key(10, "n1")));
        assert_eq!(plan.page.offset, 0);
        assert_eq!(plan.with_lookahead().page.limit, Some(3));
    }

    #[test]
    fn test_select_respects_bounds() {
        // Sorted newest first
        let items: Vec<SortKey> = (1..=6).rev().map(|i| key(i * 10, &format!("n{}", i))).collect();
        let page = PagePlan {
            after: Some(key(60, "n6")),
            stop: Some(key(20, "n2")),
            offset: 1,
            limit: Some(5),
        };
        let picked: Vec<String> = page
            .select(items, Clone::clone)
            .into_iter()
            .map(|k| k.node_id().to_string())
            .collect();
        assert_eq!(picked, vec!["n4", "n3"]);
    }

    #[test]
    fn test_same_instant_ties_use_node_id() {
        let after = key(10, "b");
        let page = PagePlan {
            after: Some(after),
            ..PagePlan::unbounded()
        };
        assert!(!page.admits(&key(10, "a")));
        assert!(page.admits(&key(10, "c")));
        assert!(page.admits(&key(9, "a")));
    }
}
