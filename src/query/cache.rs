//! Dashboard result caching
//!
//! Uses moka for thread-safe concurrent caching with TTL-based expiration.
//! Entries are dropped per project whenever that project's spans change.
//! Each project carries a write generation so that a report computed across
//! a write is never cached.

use dashmap::DashMap;
use moka::sync::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::aggregates::{AnalyticsParams, AnalyticsReport};

/// Cache key for dashboard results
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    project_id: String,
    /// Request parameters, whitespace-trimmed
    request: String,
}

impl CacheKey {
    pub fn new(project_id: &str, params: &AnalyticsParams) -> Self {
        let part = |v: &Option<String>| v.as_deref().map(str::trim).unwrap_or_default().to_string();
        Self {
            project_id: project_id.to_string(),
            request: [
                part(&params.time_range),
                part(&params.granularity),
                part(&params.environment),
                part(&params.variant),
                part(&params.filtering),
            ]
            .join("\u{1f}"),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

pub struct AnalyticsCache {
    cache: Cache<CacheKey, AnalyticsReport>,
    hits: AtomicU64,
    misses: AtomicU64,
    ttl: Duration,
    generations: DashMap<String, u64>,
}

impl AnalyticsCache {
    pub fn new() -> Self {
        Self::with_config(1000, Duration::from_secs(30))
    }

    pub fn with_config(max_entries: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            ttl,
            generations: DashMap::new(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<AnalyticsReport> {
        if let Some(report) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(report)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Current write generation of a project. Read it before computing the
    /// report that will be passed to `put`.
    pub fn generation(&self, project_id: &str) -> u64 {
        self.generations.get(project_id).map_or(0, |g| *g)
    }

    /// Cache a report computed at `generation`; stale reports are discarded
    pub fn put(&self, key: CacheKey, report: AnalyticsReport, generation: u64) {
        if self.generation(key.project_id()) != generation {
            return;
        }
        self.cache.insert(key.clone(), report);
        // A write may have landed between the check and the insert
        if self.generation(key.project_id()) != generation {
            self.cache.invalidate(&key);
        }
    }

    /// Drop every entry belonging to `project_id`
    pub fn invalidate_project(&self, project_id: &str) {
        *self.generations.entry(project_id.to_string()).or_insert(0) += 1;

        let stale: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.project_id() == project_id)
            .map(|(key, _)| (*key).clone())
            .collect();

        for key in stale {
            self.cache.invalidate(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entry_count: self.cache.entry_count(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

impl Default for AnalyticsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    pub entry_count: u64,
    pub ttl_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::aggregates::{aggregate, Granularity};

    fn report() -> AnalyticsReport {
        aggregate(&[], Granularity::Hour)
    }

    fn params(range: &str) -> AnalyticsParams {
        AnalyticsParams {
            time_range: Some(range.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cache_put_get() {
        let cache = AnalyticsCache::new();
        cache.put(CacheKey::new("p1", &params("24_hours")), report(), 0);

        // Surrounding whitespace does not change the key
        assert!(cache.get(&CacheKey::new("p1", &params(" 24_hours "))).is_some());
        assert!(cache.get(&CacheKey::new("p1", &params("7_days"))).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_invalidate_project() {
        let cache = AnalyticsCache::new();
        cache.put(CacheKey::new("p1", &params("24_hours")), report(), 0);
        cache.put(CacheKey::new("p1", &params("7_days")), report(), 0);
        cache.put(CacheKey::new("p2", &params("24_hours")), report(), 0);

        cache.invalidate_project("p1");

        assert!(cache.get(&CacheKey::new("p1", &params("24_hours"))).is_none());
        assert!(cache.get(&CacheKey::new("p1", &params("7_days"))).is_none());
        assert!(cache.get(&CacheKey::new("p2", &params("24_hours"))).is_some());
    }

    #[test]
    fn test_report_computed_across_write_not_cached() {
        let cache = AnalyticsCache::new();
        let key = CacheKey::new("p1", &params("24_hours"));

        // Report computation starts, then a write lands before it finishes
        let started = cache.generation("p1");
        cache.invalidate_project("p1");
        cache.put(key.clone(), report(), started);
        assert!(cache.get(&key).is_none());

        // A report computed after the write is cached normally
        let fresh = cache.generation("p1");
        assert_eq!(fresh, started + 1);
        cache.put(key.clone(), report(), fresh);
        assert!(cache.get(&key).is_some());

        // Other projects keep their own generation
        assert_eq!(cache.generation("p2"), 0);
    }
}
