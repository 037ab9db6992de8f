pub mod aggregates;
pub mod cache;
pub mod cursor;
pub mod dto;
pub mod executor;
pub mod filter;
pub mod planner;

pub use aggregates::{
    aggregate, run_analytics, AnalyticsParams, AnalyticsQuery, AnalyticsReport, Granularity,
    TimeRange,
};
pub use cache::{AnalyticsCache, CacheKey, CacheStats};
pub use cursor::{Cursor, CursorError};
pub use dto::{
    Focus, Format, Pagination, QueryDto, QueryLimits, QueryParams, QueryValidationError, Window,
};
pub use executor::{execute_query, QueryOutput, QueryResult, TraceItem};
pub use filter::FilterExpr;
pub use planner::{plan_query, PagePlan, QueryPlan};

use crate::storage::{PersistenceGateway, StorageError};

/// Convenience function to validate, plan, and execute a query
pub async fn run_query(
    gateway: &dyn PersistenceGateway,
    project_id: &str,
    params: &QueryParams,
    limits: &QueryLimits,
) -> Result<QueryResult, QueryError> {
    let dto = QueryDto::parse(params, limits)?;
    let plan = plan_query(&dto);
    let result = execute_query(gateway, project_id, &plan).await?;
    Ok(result)
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] QueryValidationError),

    #[error("invalid {param} cursor: {source}")]
    InvalidCursor {
        param: &'static str,
        #[source]
        source: CursorError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl QueryError {
    pub fn invalid_cursor(param: &'static str, source: CursorError) -> Self {
        Self::InvalidCursor { param, source }
    }
}
