//! Per-execution query options.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Row lock requested by a query.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// No lock.
    #[default]
    None,
    /// Optimistic read consistency; no row lock is taken.
    Read,
    /// Shared row lock.
    PessimisticRead,
    /// Exclusive row lock.
    PessimisticWrite,
    /// Exclusive lock failing immediately when contended.
    UpgradeNoWait,
    /// Exclusive lock skipping contended rows.
    UpgradeSkipLocked,
}

/// Whether a lock extends to joined tables and collections.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Lock the driving rows only.
    #[default]
    Normal,
    /// Extend to joined tables.
    Extended,
}

/// Lock settings. Callers mutate these freely, so anything stored long-term
/// must hold its own copy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LockOptions {
    /// Lock mode for the root alias.
    pub mode: LockMode,
    /// Lock wait timeout.
    pub timeout: Option<Duration>,
    /// Lock scope.
    pub scope: LockScope,
    /// Per-alias overrides.
    pub alias_modes: BTreeMap<Arc<str>, LockMode>,
}

impl LockOptions {
    /// Options with the given root mode.
    pub fn with_mode(mode: LockMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Returns `true` when no lock of any kind is requested.
    pub fn is_empty(&self) -> bool {
        self.mode == LockMode::None
            && self.timeout.is_none()
            && self.alias_modes.values().all(|mode| *mode == LockMode::None)
    }

    /// Effective mode for an alias.
    pub fn mode_for(&self, alias: &str) -> LockMode {
        self.alias_modes.get(alias).copied().unwrap_or(self.mode)
    }
}

/// Row window applied to a query result.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Limit {
    /// Rows to skip.
    pub first_row: Option<u64>,
    /// Maximum rows to return.
    pub max_rows: Option<u64>,
}

impl Limit {
    /// Window with both bounds.
    pub fn new(first_row: Option<u64>, max_rows: Option<u64>) -> Self {
        Self {
            first_row,
            max_rows,
        }
    }

    /// Returns `true` when neither bound is set.
    pub fn is_empty(&self) -> bool {
        self.first_row.is_none() && self.max_rows.is_none()
    }

    /// Rows to skip, zero when unset.
    pub fn skip(&self) -> u64 {
        self.first_row.unwrap_or(0)
    }
}

/// How an applied entity graph changes fetching.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum GraphSemantic {
    /// Graph attributes are fetched; the rest are lazy.
    Fetch,
    /// Graph attributes are fetched in addition to mapped defaults.
    Load,
}

/// Entity graph applied to a query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AppliedGraph {
    /// Graph name.
    pub graph_name: Option<Arc<str>>,
    /// Explicit semantic; `None` keeps mapped fetching.
    pub semantic: Option<GraphSemantic>,
}

/// Options governing one execution.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    lock_options: Arc<LockOptions>,
    /// Row window.
    pub limit: Limit,
    /// Applied entity graph.
    pub applied_graph: AppliedGraph,
    /// Tuple transformer identity.
    pub tuple_transformer: Option<Arc<str>>,
    /// Result-list transformer identity.
    pub result_list_transformer: Option<Arc<str>>,
}

impl QueryOptions {
    /// Current lock options.
    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// Shared handle on the lock options.
    pub fn lock_options_handle(&self) -> &Arc<LockOptions> {
        &self.lock_options
    }

    /// Mutable lock options; clones first when the value is shared.
    pub fn lock_options_mut(&mut self) -> &mut LockOptions {
        Arc::make_mut(&mut self.lock_options)
    }

    /// Replaces the lock options.
    pub fn set_lock_options(&mut self, options: LockOptions) {
        self.lock_options = Arc::new(options);
    }

    /// Sets the row window.
    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the root lock mode.
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_options_mut().mode = mode;
        self
    }

    /// Copy of these options without the row window.
    pub fn without_limit(&self) -> Self {
        Self {
            limit: Limit::default(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_mutation_does_not_leak_into_clones() {
        let original = QueryOptions::default().with_lock_mode(LockMode::PessimisticRead);
        let mut copy = original.clone();
        copy.lock_options_mut().mode = LockMode::PessimisticWrite;
        assert_eq!(original.lock_options().mode, LockMode::PessimisticRead);
        assert_eq!(copy.lock_options().mode, LockMode::PessimisticWrite);
    }

    #[test]
    fn alias_modes_override_root() {
        let mut lock = LockOptions::with_mode(LockMode::PessimisticRead);
        lock.alias_modes
            .insert(Arc::from("o"), LockMode::PessimisticWrite);
        assert_eq!(lock.mode_for("o"), LockMode::PessimisticWrite);
        assert_eq!(lock.mode_for("c"), LockMode::PessimisticRead);
    }
}
