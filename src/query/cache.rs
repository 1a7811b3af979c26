//! Bounded cache of resolved query plans.

use std::any::Any;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::PlanCacheOptions;
use crate::query::cache_key::CacheKey;
use crate::query::profile::{record_profile_event, PlanProfileEvent};
use crate::query::spi::{NonSelectQueryPlan, SelectQueryPlan};
use crate::types::Result;

#[derive(Clone)]
enum CachedPlan {
    // Holds an `Arc<dyn SelectQueryPlan<R>>`; the key's result type selects `R`.
    Select(Arc<dyn Any + Send + Sync>),
    NonSelect(Arc<dyn NonSelectQueryPlan>),
}

/// Hit and miss counters of an [`InterpretationCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Cached plans.
    pub size: usize,
    /// Maximum cached plans; zero when disabled.
    pub capacity: usize,
}

/// Plans keyed by [`CacheKey`], evicted least recently used first.
pub struct InterpretationCache {
    entries: Option<Mutex<LruCache<CacheKey, CachedPlan>>>,
    criteria_plan_cache: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InterpretationCache {
    /// Creates a cache according to `options`.
    pub fn new(options: &PlanCacheOptions) -> Self {
        let entries = if options.enabled {
            NonZeroUsize::new(options.max_entries).map(|cap| Mutex::new(LruCache::new(cap)))
        } else {
            None
        };
        Self {
            entries,
            criteria_plan_cache: options.criteria_plan_cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache that stores nothing.
    pub fn disabled() -> Self {
        Self::new(&PlanCacheOptions::disabled())
    }

    /// Returns `true` when plans are stored.
    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    /// Whether plans of tree-built queries may be stored.
    pub fn caches_criteria_plans(&self) -> bool {
        self.criteria_plan_cache
    }

    /// Returns the cached select plan for `key`, building and storing it on
    /// a miss. Without a key the plan is built and not stored.
    pub fn resolve_select_plan<R, F>(
        &self,
        key: Option<&CacheKey>,
        build: F,
    ) -> Result<Arc<dyn SelectQueryPlan<R>>>
    where
        R: 'static,
        F: FnOnce() -> Result<Arc<dyn SelectQueryPlan<R>>>,
    {
        let (Some(entries), Some(key)) = (&self.entries, key) else {
            return build();
        };
        if let Some(plan) = lookup_select::<R>(&mut entries.lock(), key) {
            self.record_hit(key);
            return Ok(plan);
        }
        self.record_miss(key);
        let plan = build()?;
        let mut guard = entries.lock();
        // Another caller may have stored a plan while this one was building.
        if let Some(existing) = lookup_select::<R>(&mut guard, key) {
            return Ok(existing);
        }
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(Arc::clone(&plan));
        guard.put(key.prepare_for_store(), CachedPlan::Select(erased));
        Ok(plan)
    }

    /// Cached mutation plan for `key`.
    pub fn get_non_select_plan(&self, key: &CacheKey) -> Option<Arc<dyn NonSelectQueryPlan>> {
        let entries = self.entries.as_ref()?;
        let found = match entries.lock().get(key) {
            Some(CachedPlan::NonSelect(plan)) => Some(Arc::clone(plan)),
            _ => None,
        };
        match found {
            Some(plan) => {
                self.record_hit(key);
                Some(plan)
            }
            None => {
                self.record_miss(key);
                None
            }
        }
    }

    /// Stores a mutation plan under `key`.
    pub fn cache_non_select_plan(&self, key: &CacheKey, plan: Arc<dyn NonSelectQueryPlan>) {
        if let Some(entries) = &self.entries {
            entries
                .lock()
                .put(key.prepare_for_store(), CachedPlan::NonSelect(plan));
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let (size, capacity) = match &self.entries {
            Some(entries) => {
                let guard = entries.lock();
                (guard.len(), guard.cap().get())
            }
            None => (0, 0),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size,
            capacity,
        }
    }

    /// Drops every cached plan.
    pub fn clear(&self) {
        if let Some(entries) = &self.entries {
            entries.lock().clear();
        }
    }

    fn record_hit(&self, key: &CacheKey) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        record_profile_event(PlanProfileEvent::CacheHit);
        debug!(query = %key.identity(), "plan.cache.hit");
    }

    fn record_miss(&self, key: &CacheKey) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        record_profile_event(PlanProfileEvent::CacheMiss);
        debug!(query = %key.identity(), "plan.cache.miss");
    }
}

impl Default for InterpretationCache {
    fn default() -> Self {
        Self::new(&PlanCacheOptions::default())
    }
}

fn lookup_select<R: 'static>(
    entries: &mut LruCache<CacheKey, CachedPlan>,
    key: &CacheKey,
) -> Option<Arc<dyn SelectQueryPlan<R>>> {
    match entries.get(key) {
        Some(CachedPlan::Select(erased)) => erased
            .downcast_ref::<Arc<dyn SelectQueryPlan<R>>>()
            .map(Arc::clone),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cache_key::{FetchProfileNames, QueryIdentity, ResultType};
    use crate::query::options::QueryOptions;
    use crate::query::spi::ExecutionContext;

    struct Fixed(u64);

    impl NonSelectQueryPlan for Fixed {
        fn execute_update(&self, _ctx: &ExecutionContext<'_>) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn key(text: &str) -> CacheKey {
        CacheKey::new(
            QueryIdentity::Text(Arc::from(text)),
            ResultType::mutation(),
            &QueryOptions::default(),
            FetchProfileNames::default(),
        )
    }

    #[test]
    fn stores_and_evicts_least_recently_used() {
        let cache = InterpretationCache::new(&PlanCacheOptions::bounded(2));
        cache.cache_non_select_plan(&key("a"), Arc::new(Fixed(1)));
        cache.cache_non_select_plan(&key("b"), Arc::new(Fixed(2)));
        assert!(cache.get_non_select_plan(&key("a")).is_some());
        cache.cache_non_select_plan(&key("c"), Arc::new(Fixed(3)));
        assert!(cache.get_non_select_plan(&key("b")).is_none());
        assert!(cache.get_non_select_plan(&key("a")).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 2);
        assert_eq!(stats.capacity, 2);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = InterpretationCache::disabled();
        assert!(!cache.is_enabled());
        cache.cache_non_select_plan(&key("a"), Arc::new(Fixed(1)));
        assert!(cache.get_non_select_plan(&key("a")).is_none());
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = InterpretationCache::default();
        cache.cache_non_select_plan(&key("a"), Arc::new(Fixed(1)));
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
