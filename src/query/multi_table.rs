//! Mutations of entities spanning several tables.

use std::sync::Arc;

use tracing::debug;

use crate::model::{EntityDescriptor, SoftDeleteMapping};
use crate::query::bindings::{BindValue, JdbcParameterBindings, ParameterBindings};
use crate::query::handle::{PublishedHandle, Resolved};
use crate::query::interpretation::{CacheableInterpretation, CompiledOperation};
use crate::query::mutation::{cleanup_for, execute_compiled_update};
use crate::query::options::QueryOptions;
use crate::query::profile::{
    profile_timer, record_profile_event, record_profile_timer, PlanProfileEvent, PlanProfileKind,
};
use crate::query::select::execute_compiled_query;
use crate::query::spi::{
    BulkOperationCleanup, ExecutionContext, HandlerBuild, MultiTableHandler, MultiTableStrategy,
    NonSelectQueryPlan,
};
use crate::query::translator::table_alias;
use crate::query::xref::ParameterCrossReference;
use crate::sql::{
    ColumnReference, SqlAssignment, SqlDelete, SqlExpression, SqlInsert, SqlPredicate,
    SqlStatement, SqlUpdate, TableReference,
};
use crate::tree::{DomainParameter, Expression, Predicate, SelectStatement, Selection, Statement};
use crate::types::{PlanError, Result, Row, Value};

/// Plan delegating to a [`MultiTableHandler`] built by the entity's
/// [`MultiTableStrategy`].
///
/// The handler is built once and published; it is rebuilt only when it
/// depends on the bound values and reports itself incompatible with the
/// current execution.
pub struct MultiTableMutationPlan {
    statement: Arc<Statement>,
    xref: Arc<ParameterCrossReference>,
    cleanup: BulkOperationCleanup,
    strategy: Arc<dyn MultiTableStrategy>,
    handle: PublishedHandle<dyn MultiTableHandler>,
}

impl MultiTableMutationPlan {
    /// Creates a plan for `statement` using `strategy`.
    pub fn new(
        statement: Arc<Statement>,
        xref: Arc<ParameterCrossReference>,
        descriptor: &EntityDescriptor,
        strategy: Arc<dyn MultiTableStrategy>,
    ) -> Self {
        Self {
            cleanup: cleanup_for(descriptor),
            statement,
            xref,
            strategy,
            handle: PublishedHandle::new(),
        }
    }

    /// Statement this plan executes.
    pub fn statement(&self) -> &Arc<Statement> {
        &self.statement
    }

    /// Currently published handler.
    pub fn current_handler(&self) -> Option<Arc<dyn MultiTableHandler>> {
        self.handle.current()
    }

    fn resolve(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(Arc<dyn MultiTableHandler>, JdbcParameterBindings)> {
        let handler = match self.handle.current() {
            Some(existing) => existing,
            None => match self.handle.get_or_build(|| self.build(ctx))? {
                Resolved::Built(built, bindings) => {
                    record_profile_event(PlanProfileEvent::HandlerBuild);
                    debug!(entity = %self.cleanup.entity, "plan.multi_table.build");
                    return Ok((built, bindings));
                }
                Resolved::Existing(existing) => existing,
            },
        };
        if !handler.depends_on_parameter_bindings()
            || handler.is_compatible_with(ctx.bindings, ctx.options)
        {
            let bindings = handler.create_parameter_bindings(ctx)?;
            return Ok((handler, bindings));
        }
        let (rebuilt, bindings) = self.handle.replace_with(|| self.build(ctx))?;
        record_profile_event(PlanProfileEvent::HandlerBuild);
        debug!(entity = %self.cleanup.entity, "plan.multi_table.rebuild");
        Ok((rebuilt, bindings))
    }

    fn build(
        &self,
        ctx: &ExecutionContext<'_>,
    ) -> Result<(Arc<dyn MultiTableHandler>, JdbcParameterBindings)> {
        let HandlerBuild {
            handler,
            first_bindings,
        } = self
            .strategy
            .build_handler(&self.statement, &self.xref, ctx)?;
        Ok((handler, first_bindings))
    }
}

impl NonSelectQueryPlan for MultiTableMutationPlan {
    fn execute_update(&self, ctx: &ExecutionContext<'_>) -> Result<u64> {
        ctx.session.schedule_bulk_cleanup(self.cleanup.clone());
        let (handler, bindings) = self.resolve(ctx)?;
        let count = handler.execute(&bindings, ctx)?;
        debug!(entity = %self.cleanup.entity, count, "plan.multi_table.execute");
        Ok(count)
    }
}

/// Multi-table strategy that selects the matching ids first and then issues
/// one statement per table with the ids inlined.
///
/// Deletes clear collection tables, then secondary tables in reverse
/// declaration order, then the root table. Soft-deleted entities instead
/// flip the indicator on the root table and leave every other table
/// untouched. Updates touch only tables with
/// assigned attributes. Inserts write the root table first. The reported
/// count is the root table's.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineIdStrategy;

impl MultiTableStrategy for InlineIdStrategy {
    fn build_handler(
        &self,
        statement: &Statement,
        xref: &ParameterCrossReference,
        ctx: &ExecutionContext<'_>,
    ) -> Result<HandlerBuild> {
        let descriptor = ctx.services.model.descriptor(statement.target_entity())?;
        let (restriction, action) = match statement {
            Statement::Delete(delete) => {
                let action = match descriptor.soft_delete() {
                    Some(soft_delete) => InlineAction::SoftDelete {
                        table: descriptor.root_table().name.clone(),
                        key_columns: descriptor.root_table().key_columns.clone(),
                        soft_delete: soft_delete.clone(),
                    },
                    None => InlineAction::Delete(delete_targets(&descriptor)?),
                };
                (delete.restriction.as_ref(), action)
            }
            Statement::Update(update) => {
                let mut targets = Vec::new();
                for assignment in &update.assignments {
                    let attribute = descriptor.attribute(&assignment.attribute)?;
                    let source = ValueSource::from_expression(&assignment.value, xref)?;
                    let table = &descriptor.tables()[attribute.table];
                    let position = match targets
                        .iter()
                        .position(|t: &UpdateTarget| t.table == table.name)
                    {
                        Some(position) => position,
                        None => {
                            targets.push(UpdateTarget {
                                table: table.name.clone(),
                                key_columns: table.key_columns.clone(),
                                is_root: attribute.table == 0,
                                assignments: Vec::new(),
                            });
                            targets.len() - 1
                        }
                    };
                    targets[position]
                        .assignments
                        .push((attribute.column.clone(), source));
                }
                if targets.is_empty() {
                    return Err(PlanError::invalid("update statement without assignments"));
                }
                (update.restriction.as_ref(), InlineAction::Update(targets))
            }
            Statement::Insert(insert) => {
                let mut rows = Vec::with_capacity(insert.rows.len());
                for row in &insert.rows {
                    if row.len() != insert.attributes.len() {
                        return Err(PlanError::invalid(format!(
                            "insert row has {} values for {} attributes",
                            row.len(),
                            insert.attributes.len()
                        )));
                    }
                    rows.push(
                        row.iter()
                            .map(|value| ValueSource::from_expression(value, xref))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                let targets = insert_targets(&descriptor, &insert.attributes)?;
                let handler = InlineIdHandler {
                    entity: descriptor.name().clone(),
                    id_select: None,
                    action: InlineAction::Insert { targets, rows },
                };
                return Ok(HandlerBuild {
                    handler: Arc::new(handler),
                    first_bindings: JdbcParameterBindings::new(),
                });
            }
            Statement::Select(_) => {
                return Err(PlanError::invariant(
                    "multi-table strategy invoked for a select statement",
                ))
            }
        };

        let id_select = compile_id_select(statement, restriction, &descriptor, xref, ctx)?;
        let first_bindings = id_select.bind(ctx.bindings)?;
        let handler = InlineIdHandler {
            entity: descriptor.name().clone(),
            id_select: Some(id_select),
            action,
        };
        Ok(HandlerBuild {
            handler: Arc::new(handler),
            first_bindings,
        })
    }
}

fn compile_id_select(
    statement: &Statement,
    restriction: Option<&Predicate>,
    descriptor: &EntityDescriptor,
    xref: &ParameterCrossReference,
    ctx: &ExecutionContext<'_>,
) -> Result<CacheableInterpretation> {
    let root = statement.root().clone();
    let select = Statement::Select(SelectStatement {
        selections: vec![Selection::Entity(root.alias.clone())],
        from: root,
        restriction: restriction.cloned(),
        order_by: Vec::new(),
    });
    let options = ctx.options.without_limit();
    let timer = profile_timer();
    let mut own = xref.copy();
    let translated = ctx
        .services
        .translator
        .translate(&select, &options, &mut own, ctx.bindings);
    own.clear_expansions();
    record_profile_timer(PlanProfileKind::Translate, timer);
    let mut translated = translated?;

    let SqlStatement::Select(sql) = &mut translated.statement else {
        return Err(PlanError::invariant("id select translated to a non-select"));
    };
    let root_alias = table_alias(0);
    sql.projection = descriptor
        .root_table()
        .key_columns
        .iter()
        .map(|column| {
            SqlExpression::Column(ColumnReference::qualified(
                root_alias.clone(),
                column.clone(),
            ))
        })
        .collect();
    let rendered = ctx.services.renderer.render(&translated.statement)?;
    let operation = CompiledOperation::new(rendered, &translated.statement);
    Ok(CacheableInterpretation::new(
        translated.statement,
        operation,
        translated.parameter_index,
        translated.resolved_types,
        &options,
        None,
    ))
}

fn delete_targets(descriptor: &EntityDescriptor) -> Result<Vec<TableTarget>> {
    let root = descriptor.root_table();
    let mut targets = Vec::new();
    for collection in descriptor.collection_tables() {
        if collection.owner_key_columns != root.key_columns {
            return Err(PlanError::Unsupported(
                "collection tables keyed on columns other than the owner's primary key",
            ));
        }
        targets.push(TableTarget {
            table: collection.table.clone(),
            key_columns: collection.key_columns.clone(),
            base_restriction: collection.base_restriction.clone(),
            is_root: false,
        });
    }
    for table in descriptor.tables().iter().skip(1).rev() {
        targets.push(TableTarget {
            table: table.name.clone(),
            key_columns: table.key_columns.clone(),
            base_restriction: None,
            is_root: false,
        });
    }
    targets.push(TableTarget {
        table: root.name.clone(),
        key_columns: root.key_columns.clone(),
        base_restriction: None,
        is_root: true,
    });
    Ok(targets)
}

fn insert_targets(
    descriptor: &EntityDescriptor,
    attributes: &[Arc<str>],
) -> Result<Vec<InsertTarget>> {
    let root = descriptor.root_table();
    // Position of each root key column among the inserted attributes.
    let mut key_positions = Vec::with_capacity(root.key_columns.len());
    for key in &root.key_columns {
        let position = attributes.iter().position(|name| {
            descriptor
                .attribute(name)
                .map(|a| a.table == 0 && a.column == *key)
                .unwrap_or(false)
        });
        match position {
            Some(position) => key_positions.push(position),
            None => {
                return Err(PlanError::invalid(format!(
                    "insert into '{}' must assign key column '{key}'",
                    descriptor.name()
                )))
            }
        }
    }

    let mut targets: Vec<InsertTarget> = descriptor
        .tables()
        .iter()
        .enumerate()
        .map(|(idx, table)| {
            let (columns, positions) = if idx == 0 {
                (Vec::new(), Vec::new())
            } else {
                (table.key_columns.clone(), key_positions.clone())
            };
            InsertTarget {
                table: table.name.clone(),
                columns,
                positions,
            }
        })
        .collect();
    for (position, name) in attributes.iter().enumerate() {
        let attribute = descriptor.attribute(name)?;
        let target = &mut targets[attribute.table];
        target.columns.push(attribute.column.clone());
        target.positions.push(position);
    }
    Ok(targets)
}

#[derive(Debug, Clone)]
enum ValueSource {
    Literal(Value),
    Parameter(DomainParameter),
}

impl ValueSource {
    fn from_expression(expr: &Expression, xref: &ParameterCrossReference) -> Result<Self> {
        match expr {
            Expression::Literal(value) => Ok(ValueSource::Literal(value.clone())),
            Expression::Parameter(node) => xref
                .query_parameter_for(node)
                .map(ValueSource::Parameter)
                .ok_or_else(|| {
                    PlanError::invariant(format!("parameter occurrence {node} was never resolved"))
                }),
            _ => Err(PlanError::Unsupported(
                "multi-table values other than literals and parameters",
            )),
        }
    }

    fn resolve(&self, bindings: &ParameterBindings) -> Result<Value> {
        match self {
            ValueSource::Literal(value) => Ok(value.clone()),
            ValueSource::Parameter(parameter) => match bindings.get(parameter.key()) {
                Some(BindValue::Single(value)) => Ok(value.clone()),
                Some(BindValue::Multi(_)) => Err(PlanError::MultiValuedNotAllowed {
                    parameter: parameter.to_string(),
                }),
                None => Err(PlanError::MissingBinding {
                    parameter: parameter.to_string(),
                }),
            },
        }
    }
}

#[derive(Debug)]
struct TableTarget {
    table: Arc<str>,
    key_columns: Vec<Arc<str>>,
    base_restriction: Option<SqlPredicate>,
    is_root: bool,
}

#[derive(Debug)]
struct UpdateTarget {
    table: Arc<str>,
    key_columns: Vec<Arc<str>>,
    is_root: bool,
    assignments: Vec<(Arc<str>, ValueSource)>,
}

#[derive(Debug)]
struct InsertTarget {
    table: Arc<str>,
    columns: Vec<Arc<str>>,
    // Index into each inserted row, per column.
    positions: Vec<usize>,
}

#[derive(Debug)]
enum InlineAction {
    Delete(Vec<TableTarget>),
    SoftDelete {
        table: Arc<str>,
        key_columns: Vec<Arc<str>>,
        soft_delete: SoftDeleteMapping,
    },
    Update(Vec<UpdateTarget>),
    Insert {
        targets: Vec<InsertTarget>,
        rows: Vec<Vec<ValueSource>>,
    },
}

#[derive(Debug)]
struct InlineIdHandler {
    entity: Arc<str>,
    id_select: Option<CacheableInterpretation>,
    action: InlineAction,
}

impl InlineIdHandler {
    fn matching_ids(
        &self,
        bindings: &JdbcParameterBindings,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Vec<Row>> {
        let Some(id_select) = &self.id_select else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        execute_compiled_query(ctx, id_select.operation(), bindings, &mut |row| {
            ids.push(row);
            Ok(())
        })?;
        Ok(ids)
    }

    fn run(&self, statement: SqlStatement, ctx: &ExecutionContext<'_>) -> Result<u64> {
        let operation = CompiledOperation::new(ctx.services.renderer.render(&statement)?, &statement);
        execute_compiled_update(ctx, &operation, &JdbcParameterBindings::new())
    }
}

fn id_restriction(key_columns: &[Arc<str>], ids: &[Row]) -> SqlPredicate {
    SqlPredicate::InList {
        expr: SqlExpression::tuple_or_single(
            key_columns
                .iter()
                .map(|column| SqlExpression::column(column.clone()))
                .collect(),
        ),
        list: ids
            .iter()
            .map(|row| {
                SqlExpression::tuple_or_single(
                    row.iter().cloned().map(SqlExpression::Literal).collect(),
                )
            })
            .collect(),
        negated: false,
    }
}

impl MultiTableHandler for InlineIdHandler {
    fn depends_on_parameter_bindings(&self) -> bool {
        self.id_select
            .as_ref()
            .is_some_and(|select| !select.parameter_index().is_empty())
    }

    fn is_compatible_with(&self, bindings: &ParameterBindings, options: &QueryOptions) -> bool {
        match &self.id_select {
            Some(select) => select.is_compatible_with(bindings, options),
            None => true,
        }
    }

    fn create_parameter_bindings(&self, ctx: &ExecutionContext<'_>) -> Result<JdbcParameterBindings> {
        match &self.id_select {
            Some(select) => select.bind(ctx.bindings),
            None => Ok(JdbcParameterBindings::new()),
        }
    }

    fn execute(&self, bindings: &JdbcParameterBindings, ctx: &ExecutionContext<'_>) -> Result<u64> {
        match &self.action {
            InlineAction::Delete(targets) => {
                let ids = self.matching_ids(bindings, ctx)?;
                if ids.is_empty() {
                    debug!(entity = %self.entity, "plan.multi_table.no_rows");
                    return Ok(0);
                }
                let mut root_count = 0;
                for target in targets {
                    let restriction = SqlPredicate::all(
                        target
                            .base_restriction
                            .iter()
                            .cloned()
                            .chain(std::iter::once(id_restriction(&target.key_columns, &ids)))
                            .collect(),
                    );
                    let count = self.run(
                        SqlStatement::Delete(SqlDelete {
                            table: TableReference::new(target.table.clone()),
                            restriction,
                            returning: Vec::new(),
                        }),
                        ctx,
                    )?;
                    debug!(table = %target.table, count, "plan.multi_table.table_delete");
                    if target.is_root {
                        root_count = count;
                    }
                }
                Ok(root_count)
            }
            InlineAction::SoftDelete {
                table,
                key_columns,
                soft_delete,
            } => {
                let ids = self.matching_ids(bindings, ctx)?;
                if ids.is_empty() {
                    debug!(entity = %self.entity, "plan.multi_table.no_rows");
                    return Ok(0);
                }
                let count = self.run(
                    SqlStatement::Update(SqlUpdate {
                        table: TableReference::new(table.clone()),
                        assignments: vec![SqlAssignment {
                            column: ColumnReference::new(soft_delete.column.clone()),
                            value: SqlExpression::Literal(soft_delete.deleted_value.clone()),
                        }],
                        restriction: Some(id_restriction(key_columns, &ids)),
                        returning: Vec::new(),
                    }),
                    ctx,
                )?;
                debug!(table = %table, count, "plan.multi_table.soft_delete");
                Ok(count)
            }
            InlineAction::Update(targets) => {
                let ids = self.matching_ids(bindings, ctx)?;
                if ids.is_empty() {
                    debug!(entity = %self.entity, "plan.multi_table.no_rows");
                    return Ok(0);
                }
                let mut first_count = None;
                let mut root_count = None;
                for target in targets {
                    let mut assignments = Vec::with_capacity(target.assignments.len());
                    for (column, source) in &target.assignments {
                        assignments.push(SqlAssignment {
                            column: ColumnReference::new(column.clone()),
                            value: SqlExpression::Literal(source.resolve(ctx.bindings)?),
                        });
                    }
                    let count = self.run(
                        SqlStatement::Update(SqlUpdate {
                            table: TableReference::new(target.table.clone()),
                            assignments,
                            restriction: Some(id_restriction(&target.key_columns, &ids)),
                            returning: Vec::new(),
                        }),
                        ctx,
                    )?;
                    debug!(table = %target.table, count, "plan.multi_table.table_update");
                    first_count.get_or_insert(count);
                    if target.is_root {
                        root_count = Some(count);
                    }
                }
                Ok(root_count.or(first_count).unwrap_or(0))
            }
            InlineAction::Insert { targets, rows } => {
                let mut resolved = Vec::with_capacity(rows.len());
                for row in rows {
                    resolved.push(
                        row.iter()
                            .map(|source| source.resolve(ctx.bindings))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                let mut root_count = 0;
                for (idx, target) in targets.iter().enumerate() {
                    if target.columns.is_empty() {
                        continue;
                    }
                    let count = self.run(
                        SqlStatement::Insert(SqlInsert {
                            table: TableReference::new(target.table.clone()),
                            columns: target.columns.clone(),
                            rows: resolved
                                .iter()
                                .map(|row| {
                                    target
                                        .positions
                                        .iter()
                                        .map(|position| {
                                            SqlExpression::Literal(row[*position].clone())
                                        })
                                        .collect()
                                })
                                .collect(),
                        }),
                        ctx,
                    )?;
                    debug!(table = %target.table, count, "plan.multi_table.table_insert");
                    if idx == 0 {
                        root_count = count;
                    }
                }
                Ok(root_count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CollectionTableMapping;

    fn account() -> EntityDescriptor {
        EntityDescriptor::builder("Account", "accounts", &["id"])
            .id("id", "id")
            .attribute("owner", 0, "owner")
            .secondary_table("account_limits", &["account_id"])
            .attribute("daily_limit", 1, "daily_limit")
            .secondary_table("account_flags", &["account_id"])
            .collection_table(CollectionTableMapping {
                attribute: Arc::from("aliases"),
                table: Arc::from("account_aliases"),
                key_columns: vec![Arc::from("account_id")],
                owner_key_columns: vec![Arc::from("id")],
                base_restriction: None,
            })
            .build()
            .expect("account")
    }

    #[test]
    fn deletes_run_children_first_and_root_last() {
        let targets = delete_targets(&account()).expect("targets");
        let order: Vec<&str> = targets.iter().map(|t| t.table.as_ref()).collect();
        assert_eq!(
            order,
            vec!["account_aliases", "account_flags", "account_limits", "accounts"]
        );
        assert!(targets.last().expect("root").is_root);
    }

    #[test]
    fn insert_targets_copy_keys_into_secondary_tables() {
        let attributes: Vec<Arc<str>> = vec![
            Arc::from("owner"),
            Arc::from("daily_limit"),
            Arc::from("id"),
        ];
        let targets = insert_targets(&account(), &attributes).expect("targets");
        assert_eq!(targets[0].columns, vec![Arc::from("owner"), Arc::from("id")]);
        assert_eq!(targets[0].positions, vec![0, 2]);
        assert_eq!(
            targets[1].columns,
            vec![Arc::from("account_id"), Arc::from("daily_limit")]
        );
        assert_eq!(targets[1].positions, vec![2, 1]);
        assert_eq!(targets[2].columns, vec![Arc::<str>::from("account_id")]);
    }

    #[test]
    fn insert_without_key_is_rejected() {
        let attributes: Vec<Arc<str>> = vec![Arc::from("owner")];
        let err = insert_targets(&account(), &attributes).expect_err("no key");
        assert!(err.is_usage());
    }

    #[test]
    fn id_restriction_uses_tuples_for_composite_keys() {
        let ids = vec![
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(3), Value::Int(4)],
        ];
        let keys: Vec<Arc<str>> = vec![Arc::from("a"), Arc::from("b")];
        match id_restriction(&keys, &ids) {
            SqlPredicate::InList { expr, list, .. } => {
                assert!(matches!(expr, SqlExpression::Tuple(ref items) if items.len() == 2));
                assert_eq!(list.len(), 2);
            }
            other => panic!("unexpected restriction {other:?}"),
        }
    }
}
