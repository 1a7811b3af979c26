//! Select plans over one concrete entity, and in-memory cursors.

use std::sync::Arc;

use tracing::debug;

use crate::query::bindings::JdbcParameterBindings;
use crate::query::handle::{PublishedHandle, Resolved};
use crate::query::interpretation::{CacheableInterpretation, CompiledOperation};
use crate::query::profile::{
    profile_timer, record_profile_event, record_profile_timer, PlanProfileEvent, PlanProfileKind,
};
use crate::query::spi::{ExecutionContext, SelectQueryPlan};
use crate::query::xref::ParameterCrossReference;
use crate::tree::Statement;
use crate::types::{PlanError, Result, Row};

/// Maps a result row to the caller's result type.
pub type RowTransformer<R> = Arc<dyn Fn(Row) -> Result<R> + Send + Sync>;

/// Cursor navigation capabilities.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ScrollMode {
    /// Forward iteration only.
    #[default]
    ForwardOnly,
    /// Free navigation over a snapshot of the results.
    ScrollInsensitive,
    /// Free navigation; changes made by others may be visible.
    ScrollSensitive,
}

/// Cursor over materialized results.
#[derive(Debug)]
pub struct ScrollableResults<R> {
    rows: Vec<R>,
    mode: ScrollMode,
    // Index of the current row; `None` before the first row.
    position: Option<usize>,
}

impl<R> ScrollableResults<R> {
    /// Cursor over `rows`.
    pub fn new(rows: Vec<R>, mode: ScrollMode) -> Self {
        Self {
            rows,
            mode,
            position: None,
        }
    }

    /// Cursor with no rows.
    pub fn empty(mode: ScrollMode) -> Self {
        Self::new(Vec::new(), mode)
    }

    /// Navigation mode.
    pub fn mode(&self) -> ScrollMode {
        self.mode
    }

    /// Total rows behind the cursor.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` when there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Zero-based index of the current row.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Current row.
    pub fn get(&self) -> Option<&R> {
        self.position.and_then(|idx| self.rows.get(idx))
    }

    /// Advances and returns the new current row.
    pub fn advance(&mut self) -> Option<&R> {
        let next = self.position.map_or(0, |idx| idx + 1);
        if next >= self.rows.len() {
            self.position = Some(self.rows.len());
            return None;
        }
        self.position = Some(next);
        self.rows.get(next)
    }

    /// Moves back one row.
    pub fn previous(&mut self) -> Result<Option<&R>> {
        if self.mode == ScrollMode::ForwardOnly {
            return Err(PlanError::Unsupported("backward navigation on a forward-only cursor"));
        }
        match self.position {
            None | Some(0) => {
                self.position = None;
                Ok(None)
            }
            Some(idx) => {
                let prev = idx.min(self.rows.len()) - 1;
                self.position = Some(prev);
                Ok(self.rows.get(prev))
            }
        }
    }

    /// Consumes the cursor, returning the remaining rows.
    pub fn into_remaining(self) -> Vec<R> {
        let start = self.position.map_or(0, |idx| idx + 1);
        self.rows.into_iter().skip(start).collect()
    }
}

/// Select plan over one concrete entity.
///
/// Follows the same build, reuse, and rebuild discipline as mutation plans;
/// lock options and the row window participate in the compatibility check.
pub struct ConcreteSelectPlan<R> {
    statement: Arc<Statement>,
    xref: Arc<ParameterCrossReference>,
    transformer: RowTransformer<R>,
    handle: PublishedHandle<CacheableInterpretation>,
}

impl<R> ConcreteSelectPlan<R> {
    /// Creates a plan mapping rows through `transformer`.
    pub fn new(
        statement: Arc<Statement>,
        xref: Arc<ParameterCrossReference>,
        transformer: RowTransformer<R>,
    ) -> Self {
        Self {
            statement,
            xref,
            transformer,
            handle: PublishedHandle::new(),
        }
    }

    /// Statement this plan executes.
    pub fn statement(&self) -> &Arc<Statement> {
        &self.statement
    }

    /// Currently published interpretation.
    pub fn current_interpretation(&self) -> Option<Arc<CacheableInterpretation>> {
        self.handle.current()
    }

    fn resolve(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(Arc<CacheableInterpretation>, JdbcParameterBindings)> {
        let interpretation = match self.handle.current() {
            Some(existing) => existing,
            None => match self
                .handle
                .get_or_build(|| self.build(ctx).map(|built| (Arc::new(built), ())))?
            {
                Resolved::Built(built, ()) => {
                    record_profile_event(PlanProfileEvent::InterpretationBuild);
                    debug!(entity = %self.statement.target_entity(), "plan.select.build");
                    let bindings = built.bind(ctx.bindings)?;
                    return Ok((built, bindings));
                }
                Resolved::Existing(existing) => existing,
            },
        };
        if interpretation.is_compatible_with(ctx.bindings, ctx.options) {
            record_profile_event(PlanProfileEvent::InterpretationReuse);
            let bindings = interpretation.bind(ctx.bindings)?;
            return Ok((interpretation, bindings));
        }
        let (rebuilt, ()) = self
            .handle
            .replace_with(|| self.build(ctx).map(|built| (Arc::new(built), ())))?;
        record_profile_event(PlanProfileEvent::InterpretationRebuild);
        debug!(entity = %self.statement.target_entity(), "plan.select.rebuild");
        let bindings = rebuilt.bind(ctx.bindings)?;
        Ok((rebuilt, bindings))
    }

    fn build(&self, ctx: &ExecutionContext<'_>) -> Result<CacheableInterpretation> {
        let services = ctx.services;
        let timer = profile_timer();
        let mut xref = self.xref.copy();
        let translated =
            services
                .translator
                .translate(&self.statement, ctx.options, &mut xref, ctx.bindings);
        xref.clear_expansions();
        record_profile_timer(PlanProfileKind::Translate, timer);
        let translated = translated?;
        let rendered = services.renderer.render(&translated.statement)?;
        let operation = CompiledOperation::new(rendered, &translated.statement);
        Ok(CacheableInterpretation::new(
            translated.statement,
            operation,
            translated.parameter_index,
            translated.resolved_types,
            ctx.options,
            Some(ctx.options.limit),
        ))
    }
}

impl<R: Send + Sync> SelectQueryPlan<R> for ConcreteSelectPlan<R> {
    fn perform_list(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<R>> {
        let mut results = Vec::new();
        self.execute_query(ctx, &mut |result| {
            results.push(result);
            Ok(())
        })?;
        Ok(results)
    }

    fn perform_scroll(
        &self,
        mode: ScrollMode,
        ctx: &ExecutionContext<'_>,
    ) -> Result<ScrollableResults<R>> {
        Ok(ScrollableResults::new(self.perform_list(ctx)?, mode))
    }

    fn execute_query(
        &self,
        ctx: &ExecutionContext<'_>,
        consumer: &mut dyn FnMut(R) -> Result<()>,
    ) -> Result<()> {
        let (interpretation, bindings) = self.resolve(ctx)?;
        execute_compiled_query(ctx, interpretation.operation(), &bindings, &mut |row| {
            consumer((self.transformer)(row)?)
        })
    }
}

/// Runs one compiled query with the given placeholder bindings.
pub(crate) fn execute_compiled_query(
    ctx: &ExecutionContext<'_>,
    operation: &CompiledOperation,
    bindings: &JdbcParameterBindings,
    consumer: &mut dyn FnMut(Row) -> Result<()>,
) -> Result<()> {
    let values = bindings.values_for(&operation.parameter_order)?;
    let timer = profile_timer();
    let result = ctx
        .services
        .executor
        .execute_query(operation, &values, consumer);
    record_profile_timer(PlanProfileKind::Execute, timer);
    result
}
