//! Query plan construction, caching, and execution.
//!
//! Domain statements are translated into low-level statements once and the
//! result is reused across executions until the bound values or options make
//! it incompatible.

/// Per-execution options: locking, row window, applied graph.
pub mod options;

/// Domain-level and placeholder-level parameter bindings.
pub mod bindings;

/// Cross-reference between domain parameters and their occurrences.
pub mod xref;

/// Reusable translation results.
pub mod interpretation;

/// Collaborator contracts and plan interfaces.
pub mod spi;

/// Lazily built values published to concurrent readers.
pub mod handle;

/// Reference statement translator.
pub mod translator;

/// Single-statement mutation plans.
///
/// Includes soft-delete rewriting and collection-table cascades.
pub mod mutation;

/// Multi-table mutation plans and the inline-id strategy.
pub mod multi_table;

/// Select plans over one concrete entity.
pub mod select;

/// Plans fanning out over polymorphic implementors.
pub mod aggregated;

/// Key-based pagination.
pub mod keyset;

/// Plan cache keys and the cacheability policy.
pub mod cache_key;

/// Bounded plan cache.
pub mod cache;

/// Query creation and plan resolution.
pub mod engine;

/// Performance profiling for plan operations.
///
/// Collects timing and count statistics when `ORMPLAN_PROFILE` is set.
pub mod profile;

pub use aggregated::{AggregatedMutationPlan, AggregatedSelectPlan};
pub use bindings::{BindValue, JdbcParameterBindings, ParameterBindings};
pub use cache::{CacheStats, InterpretationCache};
pub use cache_key::{CacheKey, FetchProfileNames, QueryIdentity, ResultType};
pub use engine::{Query, QueryEngine};
pub use interpretation::{CacheableInterpretation, CompiledOperation, ParameterIndex};
pub use keyset::{
    paginate, KeyDefinition, KeyInterpretation, KeyOrder, KeyedPage, KeyedResult,
    KeyedResultList, Page,
};
pub use multi_table::{InlineIdStrategy, MultiTableMutationPlan};
pub use mutation::SimpleMutationPlan;
pub use options::{Limit, LockMode, LockOptions, QueryOptions};
pub use profile::{profile_snapshot, PlanProfileSnapshot};
pub use select::{ConcreteSelectPlan, RowTransformer, ScrollMode, ScrollableResults};
pub use spi::{
    BulkOperationCleanup, ExecutionContext, MultiTableHandler, MultiTableStrategy,
    NonSelectQueryPlan, PlanServices, SelectQueryPlan, SessionContext, StatementExecutor,
    StatementTranslator,
};
pub use xref::ParameterCrossReference;
