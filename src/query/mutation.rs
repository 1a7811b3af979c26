//! Single-statement mutation plans.

use std::sync::Arc;

use tracing::debug;

use crate::model::{CollectionTableMapping, EntityDescriptor, SoftDeleteMapping};
use crate::query::bindings::JdbcParameterBindings;
use crate::query::handle::{PublishedHandle, Resolved};
use crate::query::interpretation::{CacheableInterpretation, CompiledOperation};
use crate::query::profile::{
    profile_timer, record_profile_event, record_profile_timer, PlanProfileEvent, PlanProfileKind,
};
use crate::query::spi::{BulkOperationCleanup, ExecutionContext, NonSelectQueryPlan};
use crate::query::xref::ParameterCrossReference;
use crate::sql::{
    ColumnReference, SqlAssignment, SqlDelete, SqlExpression, SqlPredicate, SqlSelect,
    SqlStatement, SqlUpdate, TableReference,
};
use crate::tree::Statement;
use crate::types::{PlanError, Result};

/// Compiled state of a [`SimpleMutationPlan`].
#[derive(Debug)]
pub struct MutationInterpretation {
    primary: CacheableInterpretation,
    cascades: Vec<CompiledOperation>,
}

impl MutationInterpretation {
    /// The primary statement.
    pub fn primary(&self) -> &CacheableInterpretation {
        &self.primary
    }

    /// Collection-table deletes run before the primary statement, in
    /// declaration order.
    pub fn cascades(&self) -> &[CompiledOperation] {
        &self.cascades
    }
}

/// Plan executing one translated mutation statement.
///
/// The interpretation is built on first execution and reused while it stays
/// compatible with the bound values and lock options. Deletes of soft-deleted
/// entities become updates of the indicator column; other deletes first
/// clear the entity's collection tables.
pub struct SimpleMutationPlan {
    statement: Arc<Statement>,
    xref: Arc<ParameterCrossReference>,
    cleanup: BulkOperationCleanup,
    handle: PublishedHandle<MutationInterpretation>,
}

impl SimpleMutationPlan {
    /// Creates a plan for `statement` against the entity described by `descriptor`.
    pub fn new(
        statement: Arc<Statement>,
        xref: Arc<ParameterCrossReference>,
        descriptor: &EntityDescriptor,
    ) -> Self {
        Self {
            cleanup: cleanup_for(descriptor),
            statement,
            xref,
            handle: PublishedHandle::new(),
        }
    }

    /// Statement this plan executes.
    pub fn statement(&self) -> &Arc<Statement> {
        &self.statement
    }

    /// Currently published interpretation.
    pub fn current_interpretation(&self) -> Option<Arc<MutationInterpretation>> {
        self.handle.current()
    }

    fn resolve(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(Arc<MutationInterpretation>, JdbcParameterBindings)> {
        let interpretation = match self.handle.current() {
            Some(existing) => existing,
            None => match self
                .handle
                .get_or_build(|| self.build(ctx).map(|built| (Arc::new(built), ())))?
            {
                Resolved::Built(built, ()) => {
                    record_profile_event(PlanProfileEvent::InterpretationBuild);
                    debug!(entity = %self.cleanup.entity, "plan.mutation.build");
                    let bindings = built.primary.bind(ctx.bindings)?;
                    return Ok((built, bindings));
                }
                Resolved::Existing(existing) => existing,
            },
        };
        if interpretation
            .primary
            .is_compatible_with(ctx.bindings, ctx.options)
        {
            record_profile_event(PlanProfileEvent::InterpretationReuse);
            let bindings = interpretation.primary.bind(ctx.bindings)?;
            return Ok((interpretation, bindings));
        }
        let (rebuilt, ()) = self
            .handle
            .replace_with(|| self.build(ctx).map(|built| (Arc::new(built), ())))?;
        record_profile_event(PlanProfileEvent::InterpretationRebuild);
        debug!(entity = %self.cleanup.entity, "plan.mutation.rebuild");
        let bindings = rebuilt.primary.bind(ctx.bindings)?;
        Ok((rebuilt, bindings))
    }

    fn build(&self, ctx: &ExecutionContext<'_>) -> Result<MutationInterpretation> {
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

        let mut statement = translated.statement;
        let mut cascade_statements = Vec::new();
        if let Statement::Delete(_) = self.statement.as_ref() {
            let descriptor = services.model.descriptor(self.statement.target_entity())?;
            match descriptor.soft_delete() {
                Some(soft_delete) => statement = soft_delete_rewrite(statement, soft_delete)?,
                None => {
                    cascade_statements = collection_table_deletes(
                        &descriptor,
                        statement.restriction(),
                    )
                }
            }
        }

        let mut cascades = Vec::with_capacity(cascade_statements.len());
        for cascade in &cascade_statements {
            cascades.push(CompiledOperation::new(services.renderer.render(cascade)?, cascade));
        }
        let operation = CompiledOperation::new(services.renderer.render(&statement)?, &statement);
        Ok(MutationInterpretation {
            primary: CacheableInterpretation::new(
                statement,
                operation,
                translated.parameter_index,
                translated.resolved_types,
                ctx.options,
                None,
            ),
            cascades,
        })
    }
}

impl NonSelectQueryPlan for SimpleMutationPlan {
    fn execute_update(&self, ctx: &ExecutionContext<'_>) -> Result<u64> {
        ctx.session.schedule_bulk_cleanup(self.cleanup.clone());
        let (interpretation, bindings) = self.resolve(ctx)?;
        for cascade in &interpretation.cascades {
            let removed = execute_compiled_update(ctx, cascade, &bindings)?;
            debug!(tables = ?cascade.affected_tables, removed, "plan.mutation.cascade");
        }
        let count = execute_compiled_update(ctx, interpretation.primary.operation(), &bindings)?;
        debug!(entity = %self.cleanup.entity, count, "plan.mutation.execute");
        Ok(count)
    }
}

/// Runs one compiled mutation with the given placeholder bindings.
pub(crate) fn execute_compiled_update(
    ctx: &ExecutionContext<'_>,
    operation: &CompiledOperation,
    bindings: &JdbcParameterBindings,
) -> Result<u64> {
    let values = bindings.values_for(&operation.parameter_order)?;
    let timer = profile_timer();
    let result = ctx.services.executor.execute_update(operation, &values);
    record_profile_timer(PlanProfileKind::Execute, timer);
    result
}

/// Every table a mutation of `descriptor` may touch.
pub(crate) fn cleanup_for(descriptor: &EntityDescriptor) -> BulkOperationCleanup {
    let mut tables: Vec<Arc<str>> = descriptor
        .tables()
        .iter()
        .map(|table| table.name.clone())
        .collect();
    tables.extend(
        descriptor
            .collection_tables()
            .iter()
            .map(|collection| collection.table.clone()),
    );
    BulkOperationCleanup {
        entity: descriptor.name().clone(),
        tables,
    }
}

/// Turns a compiled `DELETE` into an `UPDATE` of the soft-delete indicator,
/// keeping its table, restriction, and returning clause.
pub fn soft_delete_rewrite(
    statement: SqlStatement,
    soft_delete: &SoftDeleteMapping,
) -> Result<SqlStatement> {
    match statement {
        SqlStatement::Delete(SqlDelete {
            table,
            restriction,
            returning,
        }) => Ok(SqlStatement::Update(SqlUpdate {
            table,
            assignments: vec![SqlAssignment {
                column: ColumnReference::new(soft_delete.column.clone()),
                value: SqlExpression::Literal(soft_delete.deleted_value.clone()),
            }],
            restriction,
            returning,
        })),
        _ => Err(PlanError::invariant(
            "soft-delete rewrite applied to a statement other than a delete",
        )),
    }
}

/// Deletes clearing every collection table of `descriptor`.
///
/// When the primary statement is restricted, collection rows are matched
/// through a sub-query over the owner table with the same restriction.
pub fn collection_table_deletes(
    descriptor: &EntityDescriptor,
    primary_restriction: Option<&SqlPredicate>,
) -> Vec<SqlStatement> {
    descriptor
        .collection_tables()
        .iter()
        .map(|collection| {
            SqlStatement::Delete(SqlDelete {
                table: TableReference::new(collection.table.clone()),
                restriction: collection_restriction(descriptor, collection, primary_restriction),
                returning: Vec::new(),
            })
        })
        .collect()
}

fn collection_restriction(
    descriptor: &EntityDescriptor,
    collection: &CollectionTableMapping,
    primary_restriction: Option<&SqlPredicate>,
) -> Option<SqlPredicate> {
    let mut parts = Vec::with_capacity(2);
    if let Some(base) = &collection.base_restriction {
        parts.push(base.clone());
    }
    if let Some(restriction) = primary_restriction {
        let mut owners = SqlSelect::new(
            TableReference::new(descriptor.root_table().name.clone()),
            collection
                .owner_key_columns
                .iter()
                .map(|column| SqlExpression::column(column.clone()))
                .collect(),
        );
        owners.restriction = Some(restriction.clone());
        parts.push(SqlPredicate::InSubQuery {
            expr: SqlExpression::tuple_or_single(
                collection
                    .key_columns
                    .iter()
                    .map(|column| SqlExpression::column(column.clone()))
                    .collect(),
            ),
            query: Box::new(owners),
            negated: false,
        });
    }
    SqlPredicate::all(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{AnsiRenderer, SqlRenderer};
    use crate::types::Value;

    fn order_with_items() -> EntityDescriptor {
        EntityDescriptor::builder("Order", "orders", &["id"])
            .id("id", "id")
            .attribute("status", 0, "status")
            .collection_table(CollectionTableMapping {
                attribute: Arc::from("tags"),
                table: Arc::from("order_tags"),
                key_columns: vec![Arc::from("order_id")],
                owner_key_columns: vec![Arc::from("id")],
                base_restriction: None,
            })
            .collection_table(CollectionTableMapping {
                attribute: Arc::from("notes"),
                table: Arc::from("order_notes"),
                key_columns: vec![Arc::from("order_id")],
                owner_key_columns: vec![Arc::from("id")],
                base_restriction: Some(SqlPredicate::Fragment(Arc::from("kind = 'N'"))),
            })
            .build()
            .expect("descriptor")
    }

    fn sql(statement: &SqlStatement) -> String {
        AnsiRenderer.render(statement).expect("render").sql
    }

    #[test]
    fn soft_delete_keeps_table_and_restriction() {
        let delete = SqlStatement::Delete(SqlDelete {
            table: TableReference::new("orders"),
            restriction: Some(SqlPredicate::Fragment(Arc::from("status = 'OLD'"))),
            returning: vec![ColumnReference::new("id")],
        });
        let soft = SoftDeleteMapping {
            column: Arc::from("deleted"),
            deleted_value: Value::Bool(true),
        };
        let rewritten = soft_delete_rewrite(delete, &soft).expect("rewrite");
        assert_eq!(
            sql(&rewritten),
            "update orders set deleted = true where status = 'OLD' returning id"
        );
    }

    #[test]
    fn soft_delete_rejects_non_delete_statements() {
        let select = SqlStatement::Select(SqlSelect::new(TableReference::new("orders"), vec![]));
        let soft = SoftDeleteMapping {
            column: Arc::from("deleted"),
            deleted_value: Value::Bool(true),
        };
        assert!(soft_delete_rewrite(select, &soft)
            .expect_err("select")
            .is_invariant());
    }

    #[test]
    fn cascades_follow_declaration_order_and_restriction() {
        let descriptor = order_with_items();
        let restriction = SqlPredicate::Fragment(Arc::from("status = 'OLD'"));
        let deletes = collection_table_deletes(&descriptor, Some(&restriction));
        let rendered: Vec<String> = deletes.iter().map(sql).collect();
        assert_eq!(
            rendered,
            vec![
                "delete from order_tags where order_id in (select id from orders where status = 'OLD')",
                "delete from order_notes where kind = 'N' and order_id in (select id from orders where status = 'OLD')",
            ]
        );
    }

    #[test]
    fn unrestricted_cascade_uses_base_restriction_only() {
        let descriptor = order_with_items();
        let rendered: Vec<String> = collection_table_deletes(&descriptor, None)
            .iter()
            .map(sql)
            .collect();
        assert_eq!(
            rendered,
            vec!["delete from order_tags", "delete from order_notes where kind = 'N'"]
        );
    }

    #[test]
    fn cleanup_lists_collection_tables() {
        let cleanup = cleanup_for(&order_with_items());
        let tables: Vec<&str> = cleanup.tables.iter().map(|t| t.as_ref()).collect();
        assert_eq!(tables, vec!["orders", "order_tags", "order_notes"]);
    }
}
