//! Query entry points: plan resolution, caching, and execution.

use std::sync::Arc;

use tracing::debug;

use crate::config::PlanCacheOptions;
use crate::model::{EntityDescriptor, MappingModel};
use crate::query::aggregated::{AggregatedMutationPlan, AggregatedSelectPlan};
use crate::query::bindings::{BindValue, ParameterBindings};
use crate::query::cache::InterpretationCache;
use crate::query::cache_key::{
    interpretations_key, is_cacheable, CacheKey, FetchProfileNames, InterpretationsKeySource,
    QueryIdentity, ResultType,
};
use crate::query::keyset::{paginate, KeyedPage, KeyedResult, KeyedResultList};
use crate::query::multi_table::{InlineIdStrategy, MultiTableMutationPlan};
use crate::query::mutation::SimpleMutationPlan;
use crate::query::options::{Limit, LockMode, QueryOptions};
use crate::query::select::{ConcreteSelectPlan, RowTransformer, ScrollMode, ScrollableResults};
use crate::query::spi::{
    ExecutionContext, NonSelectQueryPlan, PlanServices, SelectQueryPlan, SessionContext,
    StatementExecutor,
};
use crate::query::translator::StandardTranslator;
use crate::query::xref::ParameterCrossReference;
use crate::sql::AnsiRenderer;
use crate::tree::{ParameterKey, Statement};
use crate::types::{PlanError, Result, Row, Value};

/// Creates queries and owns the plan cache shared by them.
pub struct QueryEngine {
    services: PlanServices,
    cache: InterpretationCache,
}

impl QueryEngine {
    /// Engine over the given collaborators.
    pub fn new(services: PlanServices, options: &PlanCacheOptions) -> Self {
        Self {
            services,
            cache: InterpretationCache::new(options),
        }
    }

    /// Engine using [`StandardTranslator`] and [`AnsiRenderer`].
    pub fn standard(
        model: Arc<dyn MappingModel>,
        executor: Arc<dyn StatementExecutor>,
        options: &PlanCacheOptions,
    ) -> Self {
        let services = PlanServices {
            translator: Arc::new(StandardTranslator::new(Arc::clone(&model))),
            renderer: Arc::new(AnsiRenderer),
            executor,
            model,
        };
        Self::new(services, options)
    }

    /// Plan collaborators.
    pub fn services(&self) -> &PlanServices {
        &self.services
    }

    /// Plan cache.
    pub fn cache(&self) -> &InterpretationCache {
        &self.cache
    }

    /// Query for `statement`. With `text`, the text identifies the query;
    /// otherwise the statement's structure does and the plan is cached only
    /// when the criteria plan cache is on.
    pub fn create_query(&self, text: Option<&str>, statement: Statement) -> Result<Query<'_>> {
        let xref = ParameterCrossReference::build(&statement)?;
        let (identity, plan_cacheable) = match text {
            Some(text) => (QueryIdentity::Text(Arc::from(text)), true),
            None => (
                QueryIdentity::Tree(statement.fingerprint()),
                self.cache.caches_criteria_plans(),
            ),
        };
        Ok(Query {
            engine: self,
            statement: Arc::new(statement),
            identity,
            xref,
            options: QueryOptions::default(),
            bindings: ParameterBindings::new(),
            plan_cacheable,
        })
    }
}

/// One query with its bindings and options.
pub struct Query<'e> {
    engine: &'e QueryEngine,
    statement: Arc<Statement>,
    identity: QueryIdentity,
    xref: Arc<ParameterCrossReference>,
    options: QueryOptions,
    bindings: ParameterBindings,
    plan_cacheable: bool,
}

impl<'e> Query<'e> {
    /// Domain statement.
    pub fn statement(&self) -> &Arc<Statement> {
        &self.statement
    }

    /// Parameter cross-reference of the statement.
    pub fn parameter_xref(&self) -> &Arc<ParameterCrossReference> {
        &self.xref
    }

    /// Current options.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Mutable options.
    pub fn options_mut(&mut self) -> &mut QueryOptions {
        &mut self.options
    }

    /// Current bindings.
    pub fn bindings(&self) -> &ParameterBindings {
        &self.bindings
    }

    /// Binds a named parameter.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.bindings
            .set(ParameterKey::Named(Arc::from(name)), BindValue::Single(value.into()));
        self
    }

    /// Binds a named parameter to a list of values.
    pub fn set_parameter_list(&mut self, name: &str, values: Vec<Value>) -> &mut Self {
        self.bindings
            .set(ParameterKey::Named(Arc::from(name)), BindValue::Multi(values));
        self
    }

    /// Binds a positional parameter.
    pub fn set_positional_parameter(&mut self, position: u32, value: impl Into<Value>) -> &mut Self {
        self.bindings
            .set(ParameterKey::Positional(position), BindValue::Single(value.into()));
        self
    }

    /// Rows to skip.
    pub fn set_first_result(&mut self, first: u64) -> &mut Self {
        self.options.limit.first_row = Some(first);
        self
    }

    /// Maximum rows to return.
    pub fn set_max_results(&mut self, max: u64) -> &mut Self {
        self.options.limit.max_rows = Some(max);
        self
    }

    /// Root lock mode.
    pub fn set_lock_mode(&mut self, mode: LockMode) -> &mut Self {
        self.options.lock_options_mut().mode = mode;
        self
    }

    /// Allows or forbids caching this query's plan.
    pub fn set_query_plan_cacheable(&mut self, cacheable: bool) -> &mut Self {
        self.plan_cacheable = cacheable;
        self
    }

    /// Executes a delete, update, or insert and returns the affected row count.
    pub fn execute_update(&self, session: &dyn SessionContext) -> Result<u64> {
        if self.statement.is_select() {
            return Err(PlanError::invalid("execute_update called for a select"));
        }
        let plan = self.non_select_plan(session)?;
        let ctx = self.context(&self.options, session);
        plan.execute_update(&ctx)
    }

    /// Executes a select and maps every row through `transformer`.
    ///
    /// Cached plans are keyed by result type and the transformer identities
    /// in [`QueryOptions`]; callers using several transformers producing the
    /// same type must name them there.
    pub fn list<R>(
        &self,
        session: &dyn SessionContext,
        transformer: RowTransformer<R>,
    ) -> Result<Vec<R>>
    where
        R: Send + Sync + 'static,
    {
        let plan = self.select_plan(session, transformer)?;
        plan.perform_list(&self.context(&self.options, session))
    }

    /// Executes a select and returns a cursor over the mapped rows.
    pub fn scroll<R>(
        &self,
        session: &dyn SessionContext,
        mode: ScrollMode,
        transformer: RowTransformer<R>,
    ) -> Result<ScrollableResults<R>>
    where
        R: Send + Sync + 'static,
    {
        let plan = self.select_plan(session, transformer)?;
        plan.perform_scroll(mode, &self.context(&self.options, session))
    }

    /// Executes a select for one keyed page.
    ///
    /// The statement is rewritten for the page's key definition, one row
    /// past the page is fetched to detect a following page, and the offset
    /// applies only to pages without a key.
    pub fn keyed_result_list<R>(
        &self,
        session: &dyn SessionContext,
        page: &KeyedPage,
        transformer: RowTransformer<R>,
    ) -> Result<KeyedResultList<R>>
    where
        R: Send + Sync + 'static,
    {
        let Statement::Select(select) = self.statement.as_ref() else {
            return Err(PlanError::invalid("keyed pagination requires a select"));
        };
        let definition = page.effective_definition();
        let rewritten = Arc::new(Statement::Select(paginate(&definition, page.key(), select)?));
        // Sub-plans would append their rows instead of merging them by key,
        // so the next-page boundary could skip rows of later entities.
        if self
            .engine
            .services
            .model
            .implementors(self.statement.target_entity())
            .len()
            > 1
        {
            return Err(PlanError::Unsupported(
                "keyed pages over several concrete entities",
            ));
        }
        let key_len = definition.keys().len();
        let keyed: RowTransformer<KeyedResult<R>> = Arc::new(move |mut row: Row| {
            if row.len() < key_len {
                return Err(PlanError::invariant(format!(
                    "keyed row has {} columns for a {key_len}-column key",
                    row.len()
                )));
            }
            let key = row.split_off(row.len() - key_len);
            Ok(KeyedResult {
                result: transformer(row)?,
                key,
            })
        });

        let mut options = self.options.clone();
        options.limit = Limit::new(page.first_row(), Some(page.fetch_size()));
        let cache_key = (is_cacheable(self, session) && self.engine.cache.caches_criteria_plans())
            .then(|| {
                CacheKey::new(
                    QueryIdentity::Tree(rewritten.fingerprint()),
                    ResultType::of::<KeyedResult<R>>(),
                    &options,
                    FetchProfileNames::new(session.enabled_fetch_profiles()),
                )
            });
        let plan = self.engine.cache.resolve_select_plan(cache_key.as_ref(), || {
            self.build_select_plan(&rewritten, keyed)
        })?;
        let executed = plan.perform_list(&self.context(&options, session))?;
        debug!(
            page = page.page().number(),
            rows = executed.len(),
            "plan.engine.keyed_page"
        );
        Ok(KeyedResultList::from_executed(executed, page.clone()))
    }

    fn context<'a>(
        &'a self,
        options: &'a QueryOptions,
        session: &'a dyn SessionContext,
    ) -> ExecutionContext<'a> {
        ExecutionContext::new(options, &self.bindings, session, &self.engine.services)
    }

    fn select_plan<R>(
        &self,
        session: &dyn SessionContext,
        transformer: RowTransformer<R>,
    ) -> Result<Arc<dyn SelectQueryPlan<R>>>
    where
        R: Send + Sync + 'static,
    {
        if !self.statement.is_select() {
            return Err(PlanError::invalid("select execution requested for a mutation"));
        }
        let key = interpretations_key(self, ResultType::of::<R>(), session);
        self.engine.cache.resolve_select_plan(key.as_ref(), || {
            self.build_select_plan(&self.statement, transformer)
        })
    }

    fn build_select_plan<R>(
        &self,
        statement: &Arc<Statement>,
        transformer: RowTransformer<R>,
    ) -> Result<Arc<dyn SelectQueryPlan<R>>>
    where
        R: Send + Sync + 'static,
    {
        let concrete = self.concrete_statements(statement)?;
        debug!(
            entity = %statement.target_entity(),
            partitions = concrete.len(),
            "plan.engine.select_plan"
        );
        let mut plans: Vec<Arc<dyn SelectQueryPlan<R>>> = concrete
            .into_iter()
            .map(|(_, stmt)| {
                Arc::new(ConcreteSelectPlan::new(
                    stmt,
                    Arc::clone(&self.xref),
                    Arc::clone(&transformer),
                )) as Arc<dyn SelectQueryPlan<R>>
            })
            .collect();
        if plans.len() == 1 {
            return Ok(plans.remove(0));
        }
        Ok(Arc::new(AggregatedSelectPlan::new(plans)))
    }

    fn non_select_plan(&self, session: &dyn SessionContext) -> Result<Arc<dyn NonSelectQueryPlan>> {
        let key = interpretations_key(self, ResultType::mutation(), session);
        if let Some(key) = &key {
            if let Some(plan) = self.engine.cache.get_non_select_plan(key) {
                return Ok(plan);
            }
        }
        let plan = self.build_non_select_plan()?;
        if let Some(key) = &key {
            self.engine.cache.cache_non_select_plan(key, Arc::clone(&plan));
        }
        Ok(plan)
    }

    fn build_non_select_plan(&self) -> Result<Arc<dyn NonSelectQueryPlan>> {
        let model = &self.engine.services.model;
        match self.statement.as_ref() {
            Statement::Delete(_) => {
                let concrete = self.concrete_statements(&self.statement)?;
                debug!(
                    entity = %self.statement.target_entity(),
                    partitions = concrete.len(),
                    "plan.engine.delete_plan"
                );
                let mut plans = Vec::with_capacity(concrete.len());
                for (descriptor, stmt) in concrete {
                    plans.push(self.mutation_plan(stmt, &descriptor));
                }
                if plans.len() == 1 {
                    return Ok(plans.remove(0));
                }
                Ok(Arc::new(AggregatedMutationPlan::new(plans)))
            }
            Statement::Update(_) => {
                let descriptor = model.descriptor(self.statement.target_entity())?;
                Ok(self.mutation_plan(Arc::clone(&self.statement), &descriptor))
            }
            Statement::Insert(_) => {
                let descriptor = model.descriptor(self.statement.target_entity())?;
                Ok(self.mutation_plan(Arc::clone(&self.statement), &descriptor))
            }
            Statement::Select(_) => Err(PlanError::invariant(
                "mutation plan requested for a select statement",
            )),
        }
    }

    // Entities spanning several tables always get coordinated statements,
    // through their declared strategy or the inline one.
    fn mutation_plan(
        &self,
        statement: Arc<Statement>,
        descriptor: &EntityDescriptor,
    ) -> Arc<dyn NonSelectQueryPlan> {
        let xref = Arc::clone(&self.xref);
        match descriptor.multi_table_strategy() {
            Some(strategy) => Arc::new(MultiTableMutationPlan::new(
                statement,
                xref,
                descriptor,
                Arc::clone(strategy),
            )),
            None if descriptor.is_multi_table() => Arc::new(MultiTableMutationPlan::new(
                statement,
                xref,
                descriptor,
                Arc::new(InlineIdStrategy),
            )),
            None => Arc::new(SimpleMutationPlan::new(statement, xref, descriptor)),
        }
    }

    // One statement per concrete entity the target covers.
    fn concrete_statements(
        &self,
        statement: &Arc<Statement>,
    ) -> Result<Vec<(Arc<EntityDescriptor>, Arc<Statement>)>> {
        let model = &self.engine.services.model;
        let target = statement.target_entity();
        let implementors = model.implementors(target);
        if implementors.is_empty() {
            return Err(PlanError::UnknownEntity {
                entity: target.to_owned(),
            });
        }
        implementors
            .iter()
            .map(|name| {
                let descriptor = model.descriptor(name)?;
                let concrete = if name.as_ref() == target {
                    Arc::clone(statement)
                } else {
                    Arc::new(statement.with_target(name))
                };
                Ok((descriptor, concrete))
            })
            .collect()
    }
}

impl InterpretationsKeySource for Query<'_> {
    fn is_query_plan_cacheable(&self) -> bool {
        self.plan_cacheable
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
