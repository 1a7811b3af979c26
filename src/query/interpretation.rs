//! Translated statements and the cached interpretation built from them.

use std::sync::Arc;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::query::bindings::{BindValue, JdbcParameterBindings, ParameterBindings};
use crate::query::options::{Limit, LockOptions, QueryOptions};
use crate::sql::{RenderedSql, SqlStatement};
use crate::tree::DomainParameter;
use crate::types::{JdbcParameterId, PlanError, Result, ValueType};

/// Placeholders allocated for one occurrence of a domain parameter.
pub type OccurrenceSlots = SmallVec<[JdbcParameterId; 4]>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ParameterSlots {
    occurrences: Vec<OccurrenceSlots>,
    expanded_len: Option<usize>,
}

/// Maps each domain parameter to the placeholders compiled for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterIndex {
    entries: IndexMap<DomainParameter, ParameterSlots>,
}

impl ParameterIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single-valued occurrence.
    pub fn push_single(&mut self, parameter: DomainParameter, id: JdbcParameterId) {
        let mut slots = OccurrenceSlots::new();
        slots.push(id);
        self.entries
            .entry(parameter)
            .or_default()
            .occurrences
            .push(slots);
    }

    /// Records an occurrence expanded to one placeholder per bound value.
    pub fn push_expanded(
        &mut self,
        parameter: DomainParameter,
        ids: OccurrenceSlots,
    ) -> Result<()> {
        let entry = self.entries.entry(parameter.clone()).or_default();
        match entry.expanded_len {
            Some(len) if len != ids.len() => {
                return Err(PlanError::invariant(format!(
                    "{parameter} expanded to {} and {len} placeholders",
                    ids.len()
                )))
            }
            None if !entry.occurrences.is_empty() => {
                return Err(PlanError::MultiValuedNotAllowed {
                    parameter: parameter.to_string(),
                })
            }
            _ => {}
        }
        entry.expanded_len = Some(ids.len());
        entry.occurrences.push(ids);
        Ok(())
    }

    /// Returns `true` if any parameter was expanded.
    pub fn has_expansions(&self) -> bool {
        self.entries.values().any(|slots| slots.expanded_len.is_some())
    }

    /// Number of indexed domain parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Placeholders of every occurrence of `parameter`.
    pub fn slots_for(&self, parameter: &DomainParameter) -> &[OccurrenceSlots] {
        self.entries
            .get(parameter)
            .map(|slots| slots.occurrences.as_slice())
            .unwrap_or(&[])
    }

    /// Whether `bindings` have the shape this index was compiled for.
    pub fn accepts(&self, bindings: &ParameterBindings) -> bool {
        self.entries.iter().all(|(parameter, slots)| {
            match (bindings.get(parameter.key()), slots.expanded_len) {
                (Some(BindValue::Single(_)), None) => true,
                (Some(BindValue::Multi(values)), Some(len)) => values.len() == len,
                _ => false,
            }
        })
    }

    /// Derives placeholder bindings from domain bindings.
    pub fn bind(&self, bindings: &ParameterBindings) -> Result<JdbcParameterBindings> {
        let mut jdbc = JdbcParameterBindings::new();
        for (parameter, slots) in &self.entries {
            let bound = bindings
                .get(parameter.key())
                .ok_or_else(|| PlanError::MissingBinding {
                    parameter: parameter.to_string(),
                })?;
            match (bound, slots.expanded_len) {
                (BindValue::Single(value), None) => {
                    for occurrence in &slots.occurrences {
                        for id in occurrence {
                            jdbc.insert(*id, value.clone());
                        }
                    }
                }
                (BindValue::Multi(values), Some(len)) if values.len() == len => {
                    for occurrence in &slots.occurrences {
                        for (id, value) in occurrence.iter().zip(values) {
                            jdbc.insert(*id, value.clone());
                        }
                    }
                }
                _ => {
                    return Err(PlanError::invariant(format!(
                        "binding for {parameter} no longer matches the compiled statement"
                    )))
                }
            }
        }
        Ok(jdbc)
    }
}

/// Output of the statement translator.
#[derive(Clone, Debug)]
pub struct TranslatedStatement {
    /// Compiled low-level statement.
    pub statement: SqlStatement,
    /// Placeholders per domain parameter.
    pub parameter_index: ParameterIndex,
    /// Bindable type resolved per domain parameter.
    pub resolved_types: IndexMap<DomainParameter, ValueType>,
}

/// Executable form of a compiled statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledOperation {
    /// Statement text.
    pub sql: Arc<str>,
    /// Placeholder identities in binding order.
    pub parameter_order: Vec<JdbcParameterId>,
    /// Tables the statement touches.
    pub affected_tables: Vec<Arc<str>>,
}

impl CompiledOperation {
    /// Pairs rendered text with the tables of `statement`.
    pub fn new(rendered: RenderedSql, statement: &SqlStatement) -> Self {
        Self {
            sql: Arc::from(rendered.sql),
            parameter_order: rendered.parameter_order,
            affected_tables: statement.affected_tables(),
        }
    }
}

/// Immutable result of translating a statement for reuse across executions.
///
/// Never mutated after construction; an incompatible interpretation is
/// replaced by a fresh one.
#[derive(Debug)]
pub struct CacheableInterpretation {
    statement: Arc<SqlStatement>,
    operation: CompiledOperation,
    parameter_index: ParameterIndex,
    resolved_types: IndexMap<DomainParameter, ValueType>,
    applied_lock: LockOptions,
    applied_limit: Option<Limit>,
}

impl CacheableInterpretation {
    /// Assembles an interpretation. `applied_limit` is `None` for mutations.
    pub fn new(
        statement: SqlStatement,
        operation: CompiledOperation,
        parameter_index: ParameterIndex,
        resolved_types: IndexMap<DomainParameter, ValueType>,
        options: &QueryOptions,
        applied_limit: Option<Limit>,
    ) -> Self {
        Self {
            statement: Arc::new(statement),
            operation,
            parameter_index,
            resolved_types,
            applied_lock: options.lock_options().clone(),
            applied_limit,
        }
    }

    /// Compiled statement.
    pub fn statement(&self) -> &Arc<SqlStatement> {
        &self.statement
    }

    /// Executable operation.
    pub fn operation(&self) -> &CompiledOperation {
        &self.operation
    }

    /// Placeholder index.
    pub fn parameter_index(&self) -> &ParameterIndex {
        &self.parameter_index
    }

    /// Resolved parameter types.
    pub fn resolved_types(&self) -> &IndexMap<DomainParameter, ValueType> {
        &self.resolved_types
    }

    /// Lock options the statement was compiled with.
    pub fn applied_lock(&self) -> &LockOptions {
        &self.applied_lock
    }

    /// Returns `true` when the compiled text depends on the shape of the
    /// bound values.
    pub fn depends_on_parameter_bindings(&self) -> bool {
        self.parameter_index.has_expansions()
    }

    /// Whether this interpretation can serve an execution with these inputs.
    pub fn is_compatible_with(&self, bindings: &ParameterBindings, options: &QueryOptions) -> bool {
        if self.applied_lock != *options.lock_options() {
            return false;
        }
        if let Some(limit) = &self.applied_limit {
            if *limit != options.limit {
                return false;
            }
        }
        self.parameter_index.accepts(bindings)
    }

    /// Placeholder bindings for one execution.
    pub fn bind(&self, bindings: &ParameterBindings) -> Result<JdbcParameterBindings> {
        self.parameter_index.bind(bindings)
    }
}
