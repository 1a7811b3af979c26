use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A snapshot of plan profiling metrics.
///
/// Profiling is enabled via the `ORMPLAN_PROFILE` environment variable and
/// tracks how often plans are translated, reused, and executed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanProfileSnapshot {
    /// Total nanoseconds spent translating statements.
    pub translate_ns: u64,
    /// Number of translations.
    pub translate_count: u64,
    /// Total nanoseconds spent in the statement executor.
    pub execute_ns: u64,
    /// Number of executed low-level statements.
    pub execute_count: u64,
    /// Interpretations built on first use.
    pub interpretation_builds: u64,
    /// Interpretations rebuilt after an incompatibility.
    pub interpretation_rebuilds: u64,
    /// Executions that reused a published interpretation.
    pub interpretation_reuses: u64,
    /// Multi-table handlers built.
    pub handler_builds: u64,
    /// Plan cache hits.
    pub cache_hits: u64,
    /// Plan cache misses.
    pub cache_misses: u64,
}

#[derive(Default)]
struct PlanProfileCounters {
    translate_ns: AtomicU64,
    translate_count: AtomicU64,
    execute_ns: AtomicU64,
    execute_count: AtomicU64,
    interpretation_builds: AtomicU64,
    interpretation_rebuilds: AtomicU64,
    interpretation_reuses: AtomicU64,
    handler_builds: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

static PROFILE_ENABLED: OnceLock<bool> = OnceLock::new();
static PROFILE_COUNTERS: OnceLock<PlanProfileCounters> = OnceLock::new();

fn profiling_enabled() -> bool {
    *PROFILE_ENABLED.get_or_init(|| std::env::var_os("ORMPLAN_PROFILE").is_some())
}

fn counters() -> Option<&'static PlanProfileCounters> {
    profiling_enabled().then(|| PROFILE_COUNTERS.get_or_init(PlanProfileCounters::default))
}

pub(crate) fn profile_timer() -> Option<Instant> {
    profiling_enabled().then(Instant::now)
}

pub(crate) enum PlanProfileKind {
    /// Domain-to-SQL translation.
    Translate,
    /// Low-level statement execution.
    Execute,
}

pub(crate) enum PlanProfileEvent {
    InterpretationBuild,
    InterpretationRebuild,
    InterpretationReuse,
    HandlerBuild,
    CacheHit,
    CacheMiss,
}

pub(crate) fn record_profile_timer(kind: PlanProfileKind, start: Option<Instant>) {
    let Some(start) = start else {
        return;
    };
    let Some(counters) = counters() else {
        return;
    };
    let nanos = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
    match kind {
        PlanProfileKind::Translate => {
            counters.translate_ns.fetch_add(nanos, Ordering::Relaxed);
            counters.translate_count.fetch_add(1, Ordering::Relaxed);
        }
        PlanProfileKind::Execute => {
            counters.execute_ns.fetch_add(nanos, Ordering::Relaxed);
            counters.execute_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub(crate) fn record_profile_event(event: PlanProfileEvent) {
    let Some(counters) = counters() else {
        return;
    };
    let counter = match event {
        PlanProfileEvent::InterpretationBuild => &counters.interpretation_builds,
        PlanProfileEvent::InterpretationRebuild => &counters.interpretation_rebuilds,
        PlanProfileEvent::InterpretationReuse => &counters.interpretation_reuses,
        PlanProfileEvent::HandlerBuild => &counters.handler_builds,
        PlanProfileEvent::CacheHit => &counters.cache_hits,
        PlanProfileEvent::CacheMiss => &counters.cache_misses,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Retrieves a snapshot of current plan profiling metrics.
///
/// Returns `None` unless `ORMPLAN_PROFILE` was set when the process first
/// checked it. With `reset`, counters are zeroed as they are read.
pub fn profile_snapshot(reset: bool) -> Option<PlanProfileSnapshot> {
    let counters = counters()?;
    let load = |counter: &AtomicU64| {
        if reset {
            counter.swap(0, Ordering::Relaxed)
        } else {
            counter.load(Ordering::Relaxed)
        }
    };
    Some(PlanProfileSnapshot {
        translate_ns: load(&counters.translate_ns),
        translate_count: load(&counters.translate_count),
        execute_ns: load(&counters.execute_ns),
        execute_count: load(&counters.execute_count),
        interpretation_builds: load(&counters.interpretation_builds),
        interpretation_rebuilds: load(&counters.interpretation_rebuilds),
        interpretation_reuses: load(&counters.interpretation_reuses),
        handler_builds: load(&counters.handler_builds),
        cache_hits: load(&counters.cache_hits),
        cache_misses: load(&counters.cache_misses),
    })
}
