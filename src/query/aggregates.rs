//! Time-bucketed rollups for the analytics dashboard

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::dto::{Focus, Format, QueryValidationError, Window};
use super::filter::{ComparisonOp, FilterExpr, FilterField, FilterValue};
use super::planner::{PagePlan, QueryPlan};
use crate::span::{Span, StatusCode};
use crate::storage::{PersistenceGateway, StorageError};

/// Accumulator trait for rollup state
pub trait Accumulator: Default {
    /// Fold one span into the state
    fn accumulate(&mut self, span: &Span);

    /// Merge another accumulator into this one
    fn merge(&mut self, other: &Self);
}

/// Counters for one bucket, or for a whole report when merged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketAccumulator {
    total: u64,
    success: u64,
    failure: u64,
    cost: f64,
    latency_ms: f64,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

impl Accumulator for BucketAccumulator {
    fn accumulate(&mut self, span: &Span) {
        self.total += 1;
        match span.status.value {
            StatusCode::Success => self.success += 1,
            StatusCode::Failure => self.failure += 1,
            StatusCode::Initiated => {}
        }
        self.cost += span.cost.unwrap_or(0.0);
        self.latency_ms += span.duration_ms();
        if let Some(tokens) = &span.tokens {
            self.prompt_tokens = self.prompt_tokens.saturating_add(tokens.prompt);
            self.completion_tokens = self.completion_tokens.saturating_add(tokens.completion);
            self.total_tokens = self.total_tokens.saturating_add(tokens.total);
        }
    }

    fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.success += other.success;
        self.failure += other.failure;
        self.cost += other.cost;
        self.latency_ms += other.latency_ms;
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

impl BucketAccumulator {
    fn mean(&self, sum: f64) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            sum / self.total as f64
        }
    }

    fn failure_rate(&self) -> f64 {
        let finished = self.success + self.failure;
        if finished == 0 {
            0.0
        } else {
            self.failure as f64 / finished as f64
        }
    }

    fn bucket(&self, timestamp: DateTime<Utc>) -> Bucket {
        Bucket {
            timestamp,
            total_count: self.total,
            success_count: self.success,
            failure_count: self.failure,
            cost: self.cost,
            latency: self.mean(self.latency_ms),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }

    fn summary(&self) -> Summary {
        Summary {
            total_count: self.total,
            success_count: self.success,
            failure_count: self.failure,
            failure_rate: self.failure_rate(),
            total_cost: self.cost,
            avg_cost: self.mean(self.cost),
            avg_latency: self.mean(self.latency_ms),
            total_tokens: self.total_tokens,
            avg_tokens: self.mean(self.total_tokens as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub timestamp: DateTime<Utc>,
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub cost: f64,
    /// Mean span duration in milliseconds
    pub latency: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub failure_rate: f64,
    pub total_cost: f64,
    pub avg_cost: f64,
    pub avg_latency: f64,
    pub total_tokens: u64,
    pub avg_tokens: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub granularity: Granularity,
    /// Buckets in ascending time order; empty buckets are omitted
    pub data: Vec<Bucket>,
    #[serde(flatten)]
    pub summary: Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Granularity::Minute),
            "hour" => Some(Granularity::Hour),
            "day" => Some(Granularity::Day),
            _ => None,
        }
    }

    fn step_secs(&self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
        }
    }

    /// Start of the bucket containing `t`
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = t.timestamp();
        let start = secs - secs.rem_euclid(self.step_secs());
        DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(t)
    }
}

/// Roll spans up into buckets plus an overall summary.
///
/// Every span counts toward `total_count`; only finished spans count toward
/// the failure rate.
pub fn aggregate(spans: &[Span], granularity: Granularity) -> AnalyticsReport {
    let mut buckets: BTreeMap<DateTime<Utc>, BucketAccumulator> = BTreeMap::new();
    for span in spans {
        buckets
            .entry(granularity.truncate(span.start_time))
            .or_default()
            .accumulate(span);
    }

    let mut overall = BucketAccumulator::default();
    let data = buckets
        .iter()
        .map(|(ts, acc)| {
            overall.merge(acc);
            acc.bucket(*ts)
        })
        .collect();

    AnalyticsReport {
        granularity,
        data,
        summary: overall.summary(),
    }
}

// ============================================================================
// Dashboard requests
// ============================================================================

/// Lookback presets offered by the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeRange {
    ThirtyMinutes,
    OneHour,
    SixHours,
    TwentyFourHours,
    ThreeDays,
    SevenDays,
    FourteenDays,
    ThirtyDays,
}

impl TimeRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "30_minutes" => Some(TimeRange::ThirtyMinutes),
            "1_hour" => Some(TimeRange::OneHour),
            "6_hours" => Some(TimeRange::SixHours),
            "24_hours" => Some(TimeRange::TwentyFourHours),
            "3_days" => Some(TimeRange::ThreeDays),
            "7_days" => Some(TimeRange::SevenDays),
            "14_days" => Some(TimeRange::FourteenDays),
            "30_days" => Some(TimeRange::ThirtyDays),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            TimeRange::ThirtyMinutes => Duration::minutes(30),
            TimeRange::OneHour => Duration::hours(1),
            TimeRange::SixHours => Duration::hours(6),
            TimeRange::TwentyFourHours => Duration::hours(24),
            TimeRange::ThreeDays => Duration::days(3),
            TimeRange::SevenDays => Duration::days(7),
            TimeRange::FourteenDays => Duration::days(14),
            TimeRange::ThirtyDays => Duration::days(30),
        }
    }

    pub fn default_granularity(&self) -> Granularity {
        if self.duration() <= Duration::hours(1) {
            Granularity::Minute
        } else if self.duration() <= Duration::days(3) {
            Granularity::Hour
        } else {
            Granularity::Day
        }
    }

    /// Window ending at `now`
    pub fn window(&self, now: DateTime<Utc>) -> Window {
        Window::new(Some(now - self.duration()), Some(now))
    }
}

/// Raw dashboard parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsParams {
    pub time_range: Option<String>,
    pub granularity: Option<String>,
    pub environment: Option<String>,
    pub variant: Option<String>,
    pub filtering: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsQuery {
    pub time_range: TimeRange,
    pub granularity: Granularity,
    pub filter: Option<FilterExpr>,
}

impl AnalyticsQuery {
    pub fn parse(params: &AnalyticsParams) -> Result<Self, QueryValidationError> {
        let time_range = match non_empty(&params.time_range) {
            None => TimeRange::TwentyFourHours,
            Some(s) => TimeRange::parse(s).ok_or_else(|| {
                QueryValidationError::new("time_range", format!("unknown time range '{}'", s))
            })?,
        };

        let granularity = match non_empty(&params.granularity) {
            None => time_range.default_granularity(),
            Some(s) => Granularity::parse(s).ok_or_else(|| {
                QueryValidationError::new(
                    "granularity",
                    format!("unknown granularity '{}', expected minute, hour or day", s),
                )
            })?,
        };

        let mut clauses = Vec::new();
        if let Some(env) = non_empty(&params.environment) {
            clauses.push(FilterExpr::condition(
                FilterField::Environment,
                ComparisonOp::Eq,
                FilterValue::Text(env.to_string()),
            ));
        }
        if let Some(variant) = non_empty(&params.variant) {
            clauses.push(FilterExpr::condition(
                FilterField::Variant,
                ComparisonOp::Eq,
                FilterValue::Text(variant.to_string()),
            ));
        }
        if let Some(raw) = non_empty(&params.filtering) {
            clauses.push(FilterExpr::parse(raw)?);
        }

        let filter = match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(FilterExpr::And(clauses)),
        };

        Ok(Self {
            time_range,
            granularity,
            filter,
        })
    }

    pub fn plan(&self, now: DateTime<Utc>) -> QueryPlan {
        QueryPlan {
            window: self.time_range.window(now),
            filter: self.filter.clone(),
            focus: Focus::Span,
            format: Format::Agenta,
            page: PagePlan::unbounded(),
        }
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Fetch the spans of the dashboard window and roll them up
pub async fn run_analytics(
    gateway: &dyn PersistenceGateway,
    project_id: &str,
    query: &AnalyticsQuery,
    now: DateTime<Utc>,
) -> Result<AnalyticsReport, StorageError> {
    let scan = gateway.query(project_id, &query.plan(now)).await?;
    Ok(aggregate(&scan.spans, query.granularity))
}
