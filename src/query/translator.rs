//! Reference statement translator: domain tree to SQL tree.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::model::{EntityDescriptor, MappingModel};
use crate::query::bindings::{BindValue, ParameterBindings};
use crate::query::interpretation::{OccurrenceSlots, ParameterIndex, TranslatedStatement};
use crate::query::options::{LockMode, QueryOptions};
use crate::query::spi::StatementTranslator;
use crate::query::xref::ParameterCrossReference;
use crate::sql::{
    ColumnReference, SqlAssignment, SqlDelete, SqlExpression, SqlInsert, SqlJoin, SqlPredicate,
    SqlSelect, SqlSortItem, SqlStatement, SqlUpdate, TableReference,
};
use crate::tree::{
    ComparisonOp, DomainParameter, Expression, ParameterNode, Path, Predicate, SelectStatement,
    Selection, Statement,
};
use crate::types::{JdbcParameterId, PlanError, Result, ValueType};

/// Alias given to the table at `index` of an entity in select translation.
pub fn table_alias(index: usize) -> Arc<str> {
    Arc::from(format!("t{index}"))
}

/// Translates against a [`MappingModel`].
///
/// Selects join every table of the entity and qualify columns; mutations
/// address the root table with unqualified columns. Multi-valued bindings
/// are only accepted as the sole element of an `IN` list.
pub struct StandardTranslator {
    model: Arc<dyn MappingModel>,
}

impl StandardTranslator {
    /// Creates a translator over `model`.
    pub fn new(model: Arc<dyn MappingModel>) -> Self {
        Self { model }
    }
}

impl StatementTranslator for StandardTranslator {
    fn translate(
        &self,
        statement: &Statement,
        options: &QueryOptions,
        xref: &mut ParameterCrossReference,
        bindings: &ParameterBindings,
    ) -> Result<TranslatedStatement> {
        let descriptor = self.model.descriptor(statement.target_entity())?;
        let root = statement.root();
        let mut scope = Scope {
            descriptor: &*descriptor,
            alias: &*root.alias,
            qualify: statement.is_select(),
            xref,
            bindings,
            next_id: 0,
            index: ParameterIndex::new(),
            types: IndexMap::new(),
        };
        let sql = match statement {
            Statement::Select(select) => SqlStatement::Select(scope.select(select, options)?),
            Statement::Delete(delete) => SqlStatement::Delete(SqlDelete {
                table: TableReference::new(descriptor.root_table().name.clone()),
                restriction: scope.restriction(delete.restriction.as_ref())?,
                returning: Vec::new(),
            }),
            Statement::Update(update) => {
                if update.assignments.is_empty() {
                    return Err(PlanError::invalid("update statement without assignments"));
                }
                let mut assignments = Vec::with_capacity(update.assignments.len());
                for assignment in &update.assignments {
                    let column = scope.column_reference(&Path {
                        alias: root.alias.clone(),
                        attribute: assignment.attribute.clone(),
                    })?;
                    assignments.push(SqlAssignment {
                        column,
                        value: scope.expression(&assignment.value)?,
                    });
                }
                let restriction = scope.restriction(update.restriction.as_ref())?;
                SqlStatement::Update(SqlUpdate {
                    table: TableReference::new(descriptor.root_table().name.clone()),
                    assignments,
                    restriction: scope.live_rows(restriction),
                    returning: Vec::new(),
                })
            }
            Statement::Insert(insert) => {
                let mut columns = Vec::with_capacity(insert.attributes.len());
                for attribute in &insert.attributes {
                    let column = scope.column_reference(&Path {
                        alias: root.alias.clone(),
                        attribute: attribute.clone(),
                    })?;
                    columns.push(column.column);
                }
                let mut rows = Vec::with_capacity(insert.rows.len());
                for row in &insert.rows {
                    if row.len() != columns.len() {
                        return Err(PlanError::invalid(format!(
                            "insert row has {} values for {} attributes",
                            row.len(),
                            columns.len()
                        )));
                    }
                    rows.push(
                        row.iter()
                            .map(|value| scope.expression(value))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                SqlStatement::Insert(SqlInsert {
                    table: TableReference::new(descriptor.root_table().name.clone()),
                    columns,
                    rows,
                })
            }
        };
        debug!(
            entity = %descriptor.name(),
            parameters = scope.index.len(),
            expanded = scope.index.has_expansions(),
            "plan.translator.translate"
        );
        Ok(TranslatedStatement {
            statement: sql,
            parameter_index: scope.index,
            resolved_types: scope.types,
        })
    }
}

struct Scope<'a> {
    descriptor: &'a EntityDescriptor,
    alias: &'a str,
    qualify: bool,
    xref: &'a mut ParameterCrossReference,
    bindings: &'a ParameterBindings,
    next_id: u32,
    index: ParameterIndex,
    types: IndexMap<DomainParameter, ValueType>,
}

impl<'a> Scope<'a> {
    fn select(&mut self, select: &SelectStatement, options: &QueryOptions) -> Result<SqlSelect> {
        let descriptor = self.descriptor;
        let tables = descriptor.tables();
        let root = &tables[0];
        let root_alias = table_alias(0);
        let mut joins = Vec::with_capacity(tables.len().saturating_sub(1));
        for (idx, table) in tables.iter().enumerate().skip(1) {
            let alias = table_alias(idx);
            let on = root
                .key_columns
                .iter()
                .zip(&table.key_columns)
                .map(|(root_key, key)| SqlPredicate::Comparison {
                    left: SqlExpression::Column(ColumnReference::qualified(
                        root_alias.clone(),
                        root_key.clone(),
                    )),
                    op: ComparisonOp::Eq,
                    right: SqlExpression::Column(ColumnReference::qualified(
                        alias.clone(),
                        key.clone(),
                    )),
                })
                .collect();
            joins.push(SqlJoin {
                table: TableReference::aliased(table.name.clone(), alias),
                on: SqlPredicate::all(on).ok_or_else(|| {
                    PlanError::invariant(format!("table '{}' has no key columns", table.name))
                })?,
            });
        }
        let mut projection = Vec::new();
        for selection in &select.selections {
            self.selection(selection, &mut projection)?;
        }
        let restriction = self.restriction(select.restriction.as_ref())?;
        let restriction = self.live_rows(restriction);
        let mut order_by = Vec::with_capacity(select.order_by.len());
        for sort in &select.order_by {
            order_by.push(SqlSortItem {
                expression: self.expression(&sort.expression)?,
                direction: sort.direction,
            });
        }
        let lock = match options.lock_options().mode_for(self.alias) {
            LockMode::None => None,
            mode => Some(mode),
        };
        Ok(SqlSelect {
            projection,
            from: TableReference::aliased(root.name.clone(), root_alias),
            joins,
            restriction,
            order_by,
            offset: options.limit.first_row,
            fetch: options.limit.max_rows,
            lock,
        })
    }

    fn selection(&mut self, selection: &Selection, out: &mut Vec<SqlExpression>) -> Result<()> {
        match selection {
            Selection::Entity(alias) => {
                self.check_alias(alias)?;
                for attribute in self.descriptor.attributes() {
                    out.push(SqlExpression::Column(ColumnReference::qualified(
                        table_alias(attribute.table),
                        attribute.column.clone(),
                    )));
                }
            }
            Selection::Expression(expr) => out.push(self.expression(expr)?),
            Selection::Keyed { selection, key } => {
                self.selection(selection, out)?;
                for expr in key {
                    out.push(self.expression(expr)?);
                }
            }
        }
        Ok(())
    }

    fn check_alias(&self, alias: &str) -> Result<()> {
        if alias == self.alias {
            Ok(())
        } else {
            Err(PlanError::UnknownAlias {
                alias: alias.to_owned(),
            })
        }
    }

    fn column_reference(&self, path: &Path) -> Result<ColumnReference> {
        self.check_alias(&path.alias)?;
        let attribute = self.descriptor.attribute(&path.attribute)?;
        if self.qualify {
            return Ok(ColumnReference::qualified(
                table_alias(attribute.table),
                attribute.column.clone(),
            ));
        }
        if attribute.table != 0 {
            return Err(PlanError::invalid(format!(
                "attribute '{}' of '{}' is stored outside the root table",
                attribute.name,
                self.descriptor.name()
            )));
        }
        Ok(ColumnReference::new(attribute.column.clone()))
    }

    // Soft-deleted rows are invisible to selects and updates.
    fn live_rows(&self, restriction: Option<SqlPredicate>) -> Option<SqlPredicate> {
        let Some(soft_delete) = self.descriptor.soft_delete() else {
            return restriction;
        };
        let column = if self.qualify {
            ColumnReference::qualified(table_alias(0), soft_delete.column.clone())
        } else {
            ColumnReference::new(soft_delete.column.clone())
        };
        let filter = SqlPredicate::Comparison {
            left: SqlExpression::Column(column),
            op: ComparisonOp::Ne,
            right: SqlExpression::Literal(soft_delete.deleted_value.clone()),
        };
        SqlPredicate::all(restriction.into_iter().chain(std::iter::once(filter)).collect())
    }

    fn restriction(&mut self, predicate: Option<&Predicate>) -> Result<Option<SqlPredicate>> {
        predicate.map(|p| self.predicate(p)).transpose()
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<SqlPredicate> {
        Ok(match predicate {
            Predicate::Comparison { left, op, right } => SqlPredicate::Comparison {
                left: self.expression(left)?,
                op: *op,
                right: self.expression(right)?,
            },
            Predicate::And(parts) => SqlPredicate::And(self.predicates(parts)?),
            Predicate::Or(parts) => SqlPredicate::Or(self.predicates(parts)?),
            Predicate::Not(inner) => SqlPredicate::Not(Box::new(self.predicate(inner)?)),
            Predicate::In {
                expr,
                list,
                negated,
            } => {
                let expr = self.expression(expr)?;
                let list = self.in_list(list)?;
                SqlPredicate::InList {
                    expr,
                    list,
                    negated: *negated,
                }
            }
            Predicate::IsNull { expr, negated } => SqlPredicate::IsNull {
                expr: self.expression(expr)?,
                negated: *negated,
            },
        })
    }

    fn predicates(&mut self, parts: &[Predicate]) -> Result<Vec<SqlPredicate>> {
        parts.iter().map(|part| self.predicate(part)).collect()
    }

    fn in_list(&mut self, list: &[Expression]) -> Result<Vec<SqlExpression>> {
        if let [Expression::Parameter(node)] = list {
            let (parameter, bound) = self.resolve(node)?;
            if let BindValue::Multi(values) = bound {
                if !(node.allows_multi_valued() || parameter.allows_multi_valued()) {
                    return Err(PlanError::MultiValuedNotAllowed {
                        parameter: parameter.to_string(),
                    });
                }
                let mut ids = OccurrenceSlots::new();
                for _ in values {
                    self.xref
                        .register_expansion(&parameter, node, node.expansion())?;
                    ids.push(self.allocate());
                }
                self.record_type(&parameter, bound.value_type());
                let expanded = ids.iter().map(|id| SqlExpression::Parameter(*id)).collect();
                self.index.push_expanded(parameter, ids)?;
                return Ok(expanded);
            }
        }
        list.iter().map(|item| self.expression(item)).collect()
    }

    fn expression(&mut self, expr: &Expression) -> Result<SqlExpression> {
        Ok(match expr {
            Expression::Path(path) => SqlExpression::Column(self.column_reference(path)?),
            Expression::Literal(value) => SqlExpression::Literal(value.clone()),
            Expression::Parameter(node) => {
                let (parameter, bound) = self.resolve(node)?;
                match bound {
                    BindValue::Single(value) => {
                        let id = self.allocate();
                        self.record_type(&parameter, value.value_type());
                        self.index.push_single(parameter, id);
                        SqlExpression::Parameter(id)
                    }
                    BindValue::Multi(_) => {
                        return Err(PlanError::MultiValuedNotAllowed {
                            parameter: parameter.to_string(),
                        })
                    }
                }
            }
            Expression::Tuple(items) => SqlExpression::Tuple(
                items
                    .iter()
                    .map(|item| self.expression(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    fn resolve(&self, node: &ParameterNode) -> Result<(DomainParameter, &'a BindValue)> {
        let parameter = self.xref.query_parameter_for(node).ok_or_else(|| {
            PlanError::invariant(format!("parameter occurrence {node} was never resolved"))
        })?;
        let bindings: &'a ParameterBindings = self.bindings;
        let bound = bindings
            .get(parameter.key())
            .ok_or_else(|| PlanError::MissingBinding {
                parameter: parameter.to_string(),
            })?;
        Ok((parameter, bound))
    }

    fn allocate(&mut self) -> JdbcParameterId {
        let id = JdbcParameterId(self.next_id);
        self.next_id += 1;
        id
    }

    fn record_type(&mut self, parameter: &DomainParameter, value_type: ValueType) {
        let slot = self
            .types
            .entry(parameter.clone())
            .or_insert(ValueType::Unknown);
        if *slot == ValueType::Unknown {
            *slot = value_type;
        }
    }
}
