//! Cache keys for translated plans and the policy deciding cacheability.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::SmallVec;
use xxhash_rust::xxh64::Xxh64;

use crate::query::bindings::ParameterBindings;
use crate::query::options::{LockOptions, QueryOptions};
use crate::query::spi::SessionContext;

/// Identity of the query a plan was built for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryIdentity {
    /// Query created from text; the text is the identity.
    Text(Arc<str>),
    /// Query created from a statement tree; structural fingerprint.
    Tree(u64),
}

impl QueryIdentity {
    /// Returns `true` for tree-only identities.
    pub fn is_tree(&self) -> bool {
        matches!(self, QueryIdentity::Tree(_))
    }
}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryIdentity::Text(text) => f.write_str(text),
            QueryIdentity::Tree(fingerprint) => write!(f, "<tree {fingerprint:016x}>"),
        }
    }
}

/// Result type a select plan produces.
#[derive(Copy, Clone, Debug)]
pub struct ResultType {
    id: TypeId,
    name: &'static str,
}

impl ResultType {
    /// Result type of `R`.
    pub fn of<R: 'static>() -> Self {
        Self {
            id: TypeId::of::<R>(),
            name: std::any::type_name::<R>(),
        }
    }

    /// Result type of mutation plans.
    pub fn mutation() -> Self {
        Self::of::<u64>()
    }

    /// Type name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ResultType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ResultType {}

impl Hash for ResultType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Sorted, de-duplicated set of enabled fetch profile names. Up to two names
/// are stored inline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FetchProfileNames(SmallVec<[Arc<str>; 2]>);

impl FetchProfileNames {
    /// Copies `names` into a normalized set.
    pub fn new<I>(names: I) -> Self
    where
        I: IntoIterator<Item = Arc<str>>,
    {
        let mut set: SmallVec<[Arc<str>; 2]> = names.into_iter().collect();
        set.sort();
        set.dedup();
        Self(set)
    }

    /// Names in sorted order.
    pub fn names(&self) -> &[Arc<str>] {
        &self.0
    }

    /// Returns `true` when no profile is enabled.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` when the names live inline.
    pub fn is_inline(&self) -> bool {
        !self.0.spilled()
    }
}

/// Key under which a translated plan is cached.
///
/// Equality compares every component; the hash is computed once.
#[derive(Clone, Debug)]
pub struct CacheKey {
    identity: QueryIdentity,
    result_type: ResultType,
    lock_options: Arc<LockOptions>,
    tuple_transformer: Option<Arc<str>>,
    result_list_transformer: Option<Arc<str>>,
    fetch_profiles: FetchProfileNames,
    hash: u64,
}

impl CacheKey {
    /// Builds a key from its components.
    pub fn new(
        identity: QueryIdentity,
        result_type: ResultType,
        options: &QueryOptions,
        fetch_profiles: FetchProfileNames,
    ) -> Self {
        let lock_options = Arc::clone(options.lock_options_handle());
        let mut hasher = Xxh64::new(0);
        identity.hash(&mut hasher);
        result_type.hash(&mut hasher);
        lock_options.hash(&mut hasher);
        options.tuple_transformer.hash(&mut hasher);
        options.result_list_transformer.hash(&mut hasher);
        fetch_profiles.hash(&mut hasher);
        Self {
            identity,
            result_type,
            lock_options,
            tuple_transformer: options.tuple_transformer.clone(),
            result_list_transformer: options.result_list_transformer.clone(),
            fetch_profiles,
            hash: hasher.finish(),
        }
    }

    /// Key ready for insertion: the lock options are detached from the
    /// caller's instance.
    pub fn prepare_for_store(&self) -> Self {
        Self {
            lock_options: Arc::new(LockOptions::clone(&self.lock_options)),
            ..self.clone()
        }
    }

    /// Query identity.
    pub fn identity(&self) -> &QueryIdentity {
        &self.identity
    }

    /// Result type.
    pub fn result_type(&self) -> ResultType {
        self.result_type
    }

    /// Lock options captured in the key.
    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// Enabled fetch profiles captured in the key.
    pub fn fetch_profiles(&self) -> &FetchProfileNames {
        &self.fetch_profiles
    }

    /// Precomputed hash.
    pub fn hash_code(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.identity == other.identity
            && self.result_type == other.result_type
            && self.lock_options == other.lock_options
            && self.tuple_transformer == other.tuple_transformer
            && self.result_list_transformer == other.result_list_transformer
            && self.fetch_profiles == other.fetch_profiles
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Inputs a cache key is derived from.
pub trait InterpretationsKeySource {
    /// Whether the caller allows caching this query's plan.
    fn is_query_plan_cacheable(&self) -> bool;

    /// Query identity.
    fn query_identity(&self) -> &QueryIdentity;

    /// Options of the pending execution.
    fn query_options(&self) -> &QueryOptions;

    /// Bindings of the pending execution.
    fn parameter_bindings(&self) -> &ParameterBindings;
}

/// Whether a plan for `source` may be cached.
///
/// Filters and explicit graph semantics are not part of the key, and
/// multi-valued bindings are resolved per execution, so any of them makes
/// the plan uncacheable.
pub fn is_cacheable(source: &dyn InterpretationsKeySource, session: &dyn SessionContext) -> bool {
    source.is_query_plan_cacheable()
        && !session.has_enabled_filters()
        && source.query_options().applied_graph.semantic.is_none()
        && !source.parameter_bindings().has_multi_valued()
}

/// Cache key for `source`, or `None` when its plan must not be cached.
pub fn interpretations_key(
    source: &dyn InterpretationsKeySource,
    result_type: ResultType,
    session: &dyn SessionContext,
) -> Option<CacheKey> {
    if !is_cacheable(source, session) {
        return None;
    }
    Some(CacheKey::new(
        source.query_identity().clone(),
        result_type,
        source.query_options(),
        FetchProfileNames::new(session.enabled_fetch_profiles()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::options::{GraphSemantic, LockMode};
    use crate::query::spi::BulkOperationCleanup;
    use crate::types::Value;

    struct Session {
        filters: bool,
        profiles: Vec<Arc<str>>,
    }

    impl SessionContext for Session {
        fn schedule_bulk_cleanup(&self, _cleanup: BulkOperationCleanup) {}

        fn has_enabled_filters(&self) -> bool {
            self.filters
        }

        fn enabled_fetch_profiles(&self) -> Vec<Arc<str>> {
            self.profiles.clone()
        }
    }

    struct Source {
        cacheable: bool,
        identity: QueryIdentity,
        options: QueryOptions,
        bindings: ParameterBindings,
    }

    impl InterpretationsKeySource for Source {
        fn is_query_plan_cacheable(&self) -> bool {
            self.cacheable
        }

        fn query_identity(&self) -> &QueryIdentity {
            &self.identity
        }

        fn query_options(&self) -> &QueryOptions {
            &self.options
        }

        fn parameter_bindings(&self) -> &ParameterBindings {
            &self.bindings
        }
    }

    fn source() -> Source {
        Source {
            cacheable: true,
            identity: QueryIdentity::Text(Arc::from("delete from Order o")),
            options: QueryOptions::default(),
            bindings: ParameterBindings::new(),
        }
    }

    fn plain_session() -> Session {
        Session {
            filters: false,
            profiles: Vec::new(),
        }
    }

    #[test]
    fn policy_excludes_filters_graphs_and_multi_valued_bindings() {
        let session = plain_session();
        assert!(is_cacheable(&source(), &session));

        let filtered = Session {
            filters: true,
            profiles: Vec::new(),
        };
        assert!(!is_cacheable(&source(), &filtered));

        let mut graph = source();
        graph.options.applied_graph.semantic = Some(GraphSemantic::Fetch);
        assert!(!is_cacheable(&graph, &session));

        let mut multi = source();
        multi.bindings = ParameterBindings::new()
            .named_multi("ids", vec![Value::Int(1), Value::Int(2)]);
        assert!(!is_cacheable(&multi, &session));

        let mut declined = source();
        declined.cacheable = false;
        assert!(interpretations_key(&declined, ResultType::mutation(), &session).is_none());
    }

    #[test]
    fn stored_key_survives_later_lock_changes() {
        let session = plain_session();
        let mut src = source();
        src.options = QueryOptions::default().with_lock_mode(LockMode::PessimisticWrite);
        let key = interpretations_key(&src, ResultType::mutation(), &session).expect("key");
        let stored = key.prepare_for_store();

        src.options.lock_options_mut().mode = LockMode::None;
        assert_eq!(stored.lock_options().mode, LockMode::PessimisticWrite);
        src.options.lock_options_mut().mode = LockMode::PessimisticWrite;

        let lookup = interpretations_key(&src, ResultType::mutation(), &session).expect("key");
        assert_eq!(lookup, stored);
        assert_eq!(lookup.hash_code(), stored.hash_code());
    }

    #[test]
    fn result_type_and_profiles_participate() {
        let session = plain_session();
        let rows = interpretations_key(&source(), ResultType::of::<Vec<Value>>(), &session);
        let count = interpretations_key(&source(), ResultType::mutation(), &session);
        assert_ne!(rows, count);

        let profiled = Session {
            filters: false,
            profiles: vec![Arc::from("b"), Arc::from("a"), Arc::from("b")],
        };
        let key = interpretations_key(&source(), ResultType::mutation(), &profiled).expect("key");
        let names: Vec<&str> = key.fetch_profiles().names().iter().map(|n| &**n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(key.fetch_profiles().is_inline());
        assert_ne!(Some(key), count);
    }
}
