//! Collaborator contracts and the plan interfaces exposed to callers.

use std::fmt;
use std::sync::Arc;

use crate::model::MappingModel;
use crate::query::bindings::{JdbcParameterBindings, ParameterBindings};
use crate::query::interpretation::{CompiledOperation, TranslatedStatement};
use crate::query::options::QueryOptions;
use crate::query::select::{ScrollMode, ScrollableResults};
use crate::query::xref::ParameterCrossReference;
use crate::sql::SqlRenderer;
use crate::tree::Statement;
use crate::types::{Result, Row, Value};

/// Translates a domain statement into a low-level statement.
pub trait StatementTranslator: Send + Sync {
    /// Translates `statement`.
    ///
    /// Multi-valued bindings are expanded into one placeholder per value and
    /// each expansion is registered in `xref`, which must be owned by the
    /// calling execution.
    fn translate(
        &self,
        statement: &Statement,
        options: &QueryOptions,
        xref: &mut ParameterCrossReference,
        bindings: &ParameterBindings,
    ) -> Result<TranslatedStatement>;
}

/// Runs compiled statements.
pub trait StatementExecutor: Send + Sync {
    /// Executes a mutation and returns the affected row count.
    fn execute_update(&self, operation: &CompiledOperation, parameters: &[Value]) -> Result<u64>;

    /// Executes a query, handing each row to `consumer`.
    fn execute_query(
        &self,
        operation: &CompiledOperation,
        parameters: &[Value],
        consumer: &mut dyn FnMut(Row) -> Result<()>,
    ) -> Result<()>;
}

/// Cache invalidation request issued before a bulk mutation runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkOperationCleanup {
    /// Mutated entity.
    pub entity: Arc<str>,
    /// Every table the mutation may touch.
    pub tables: Vec<Arc<str>>,
}

/// Session services consumed by plans.
pub trait SessionContext: Send + Sync {
    /// Schedules invalidation of cached state for the affected entity.
    fn schedule_bulk_cleanup(&self, cleanup: BulkOperationCleanup);

    /// Returns `true` if dynamic filters are enabled.
    fn has_enabled_filters(&self) -> bool {
        false
    }

    /// Names of the enabled fetch profiles.
    fn enabled_fetch_profiles(&self) -> Vec<Arc<str>> {
        Vec::new()
    }
}

/// Shared collaborators used to build and run plans.
#[derive(Clone)]
pub struct PlanServices {
    /// Mapping model.
    pub model: Arc<dyn MappingModel>,
    /// Statement translator.
    pub translator: Arc<dyn StatementTranslator>,
    /// SQL renderer.
    pub renderer: Arc<dyn SqlRenderer>,
    /// Statement executor.
    pub executor: Arc<dyn StatementExecutor>,
}

impl fmt::Debug for PlanServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanServices").finish_non_exhaustive()
    }
}

/// Inputs of one plan execution.
#[derive(Clone, Copy)]
pub struct ExecutionContext<'a> {
    /// Query options.
    pub options: &'a QueryOptions,
    /// Domain parameter bindings.
    pub bindings: &'a ParameterBindings,
    /// Session services.
    pub session: &'a dyn SessionContext,
    /// Plan collaborators.
    pub services: &'a PlanServices,
}

impl<'a> ExecutionContext<'a> {
    /// Bundles execution inputs.
    pub fn new(
        options: &'a QueryOptions,
        bindings: &'a ParameterBindings,
        session: &'a dyn SessionContext,
        services: &'a PlanServices,
    ) -> Self {
        Self {
            options,
            bindings,
            session,
            services,
        }
    }

    /// Same context with different options.
    pub fn with_options<'b>(&self, options: &'b QueryOptions) -> ExecutionContext<'b>
    where
        'a: 'b,
    {
        ExecutionContext {
            options,
            bindings: self.bindings,
            session: self.session,
            services: self.services,
        }
    }
}

/// Plan for a delete, update, or insert.
pub trait NonSelectQueryPlan: Send + Sync {
    /// Executes the mutation and returns the affected row count.
    fn execute_update(&self, ctx: &ExecutionContext<'_>) -> Result<u64>;
}

/// Plan for a query producing `R` values.
pub trait SelectQueryPlan<R>: Send + Sync {
    /// Materializes every result.
    fn perform_list(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<R>>;

    /// Opens a cursor over the results.
    fn perform_scroll(
        &self,
        mode: ScrollMode,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ScrollableResults<R>>;

    /// Streams results into `consumer`.
    fn execute_query(
        &self,
        ctx: &ExecutionContext<'_>,
        consumer: &mut dyn FnMut(R) -> Result<()>,
    ) -> Result<()>;
}

/// Multi-statement execution strategy for one statement.
pub trait MultiTableHandler: Send + Sync {
    /// Returns `true` if the handler's compiled statements depend on the
    /// shape of the bound values.
    fn depends_on_parameter_bindings(&self) -> bool;

    /// Whether this handler can serve an execution with these inputs.
    /// Must be free of side effects; callers race on it.
    fn is_compatible_with(&self, bindings: &ParameterBindings, options: &QueryOptions) -> bool;

    /// Derives placeholder bindings for one execution.
    fn create_parameter_bindings(&self, ctx: &ExecutionContext<'_>) -> Result<JdbcParameterBindings>;

    /// Runs the statement sequence and returns the root-table row count.
    fn execute(&self, bindings: &JdbcParameterBindings, ctx: &ExecutionContext<'_>) -> Result<u64>;
}

/// A freshly built handler with the bindings derived while building it.
pub struct HandlerBuild {
    /// Built handler.
    pub handler: Arc<dyn MultiTableHandler>,
    /// Bindings for the execution that triggered the build.
    pub first_bindings: JdbcParameterBindings,
}

/// Builds handlers for entities spanning several tables.
///
/// Deletes of a soft-deleted entity must only update its indicator column;
/// handlers never physically remove those rows.
pub trait MultiTableStrategy: Send + Sync + fmt::Debug {
    /// Builds a handler for `statement`. `xref` is the statement's shared
    /// cross-reference; builders take their own copy before expanding.
    fn build_handler(
        &self,
        statement: &Statement,
        xref: &ParameterCrossReference,
        ctx: &ExecutionContext<'_>,
    ) -> Result<HandlerBuild>;
}
