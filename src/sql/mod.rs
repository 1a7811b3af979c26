//! Table/column level statement tree produced by translation.

pub mod render;

use std::sync::Arc;

use crate::query::options::LockMode;
use crate::tree::{ComparisonOp, SortDirection};
use crate::types::{JdbcParameterId, Value};

pub use render::{AnsiRenderer, RenderedSql, SqlRenderer};

/// Physical table reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableReference {
    /// Table name.
    pub name: Arc<str>,
    /// Optional qualifier used by column references.
    pub alias: Option<Arc<str>>,
}

impl TableReference {
    /// Unaliased table reference.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    /// Aliased table reference.
    pub fn aliased(name: impl Into<Arc<str>>, alias: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }
}

/// Column reference, optionally qualified by a table alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnReference {
    /// Table alias.
    pub qualifier: Option<Arc<str>>,
    /// Column name.
    pub column: Arc<str>,
}

impl ColumnReference {
    /// Unqualified column.
    pub fn new(column: impl Into<Arc<str>>) -> Self {
        Self {
            qualifier: None,
            column: column.into(),
        }
    }

    /// Column qualified by a table alias.
    pub fn qualified(qualifier: impl Into<Arc<str>>, column: impl Into<Arc<str>>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            column: column.into(),
        }
    }
}

/// Scalar SQL expression.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlExpression {
    /// Column reference.
    Column(ColumnReference),
    /// Inline literal.
    Literal(Value),
    /// Positional placeholder.
    Parameter(JdbcParameterId),
    /// Row value constructor.
    Tuple(Vec<SqlExpression>),
}

impl SqlExpression {
    /// Unqualified column shorthand.
    pub fn column(name: impl Into<Arc<str>>) -> Self {
        SqlExpression::Column(ColumnReference::new(name))
    }

    /// Collapses a single-item list to the item, otherwise builds a tuple.
    pub fn tuple_or_single(mut items: Vec<SqlExpression>) -> Self {
        if items.len() == 1 {
            items.remove(0)
        } else {
            SqlExpression::Tuple(items)
        }
    }

    fn collect_parameters(&self, out: &mut Vec<JdbcParameterId>) {
        match self {
            SqlExpression::Column(_) | SqlExpression::Literal(_) => {}
            SqlExpression::Parameter(id) => out.push(*id),
            SqlExpression::Tuple(items) => {
                for item in items {
                    item.collect_parameters(out);
                }
            }
        }
    }
}

/// SQL restriction.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlPredicate {
    /// `left op right`
    Comparison {
        /// Left operand.
        left: SqlExpression,
        /// Operator.
        op: ComparisonOp,
        /// Right operand.
        right: SqlExpression,
    },
    /// Conjunction.
    And(Vec<SqlPredicate>),
    /// Disjunction.
    Or(Vec<SqlPredicate>),
    /// Negation.
    Not(Box<SqlPredicate>),
    /// `expr [NOT] IN (a, b, ...)`
    InList {
        /// Tested expression.
        expr: SqlExpression,
        /// Candidates.
        list: Vec<SqlExpression>,
        /// `NOT IN` when set.
        negated: bool,
    },
    /// `expr [NOT] IN (SELECT ...)`
    InSubQuery {
        /// Tested expression.
        expr: SqlExpression,
        /// Sub-query.
        query: Box<SqlSelect>,
        /// `NOT IN` when set.
        negated: bool,
    },
    /// `expr IS [NOT] NULL`
    IsNull {
        /// Tested expression.
        expr: SqlExpression,
        /// `IS NOT NULL` when set.
        negated: bool,
    },
    /// Verbatim SQL condition supplied by the mapping.
    Fragment(Arc<str>),
}

impl SqlPredicate {
    /// Conjunction collapsing single operands; `None` when `parts` is empty.
    pub fn all(mut parts: Vec<SqlPredicate>) -> Option<SqlPredicate> {
        match parts.len() {
            0 => None,
            1 => Some(parts.remove(0)),
            _ => Some(SqlPredicate::And(parts)),
        }
    }

    fn collect_parameters(&self, out: &mut Vec<JdbcParameterId>) {
        match self {
            SqlPredicate::Comparison { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            SqlPredicate::And(parts) | SqlPredicate::Or(parts) => {
                for part in parts {
                    part.collect_parameters(out);
                }
            }
            SqlPredicate::Not(inner) => inner.collect_parameters(out),
            SqlPredicate::InList { expr, list, .. } => {
                expr.collect_parameters(out);
                for item in list {
                    item.collect_parameters(out);
                }
            }
            SqlPredicate::InSubQuery { expr, query, .. } => {
                expr.collect_parameters(out);
                query.collect_parameters(out);
            }
            SqlPredicate::IsNull { expr, .. } => expr.collect_parameters(out),
            SqlPredicate::Fragment(_) => {}
        }
    }
}

/// Inner join.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlJoin {
    /// Joined table.
    pub table: TableReference,
    /// Join condition.
    pub on: SqlPredicate,
}

/// One `ORDER BY` item.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlSortItem {
    /// Sort expression.
    pub expression: SqlExpression,
    /// Direction.
    pub direction: SortDirection,
}

/// SQL `SELECT`.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlSelect {
    /// Select list.
    pub projection: Vec<SqlExpression>,
    /// Driving table.
    pub from: TableReference,
    /// Joined tables.
    pub joins: Vec<SqlJoin>,
    /// `WHERE` restriction.
    pub restriction: Option<SqlPredicate>,
    /// `ORDER BY` items.
    pub order_by: Vec<SqlSortItem>,
    /// `OFFSET` rows.
    pub offset: Option<u64>,
    /// `FETCH FIRST` rows.
    pub fetch: Option<u64>,
    /// Row lock requested with the read.
    pub lock: Option<LockMode>,
}

impl SqlSelect {
    /// Plain projection over one table.
    pub fn new(from: TableReference, projection: Vec<SqlExpression>) -> Self {
        Self {
            projection,
            from,
            joins: Vec::new(),
            restriction: None,
            order_by: Vec::new(),
            offset: None,
            fetch: None,
            lock: None,
        }
    }

    fn collect_parameters(&self, out: &mut Vec<JdbcParameterId>) {
        for expr in &self.projection {
            expr.collect_parameters(out);
        }
        for join in &self.joins {
            join.on.collect_parameters(out);
        }
        if let Some(restriction) = &self.restriction {
            restriction.collect_parameters(out);
        }
        for item in &self.order_by {
            item.expression.collect_parameters(out);
        }
    }
}

/// SQL `DELETE`.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlDelete {
    /// Target table.
    pub table: TableReference,
    /// `WHERE` restriction.
    pub restriction: Option<SqlPredicate>,
    /// `RETURNING` columns.
    pub returning: Vec<ColumnReference>,
}

/// `column = value` in an update.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlAssignment {
    /// Assigned column.
    pub column: ColumnReference,
    /// Assigned value.
    pub value: SqlExpression,
}

/// SQL `UPDATE`.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlUpdate {
    /// Target table.
    pub table: TableReference,
    /// `SET` items.
    pub assignments: Vec<SqlAssignment>,
    /// `WHERE` restriction.
    pub restriction: Option<SqlPredicate>,
    /// `RETURNING` columns.
    pub returning: Vec<ColumnReference>,
}

/// SQL `INSERT ... VALUES`.
#[derive(Clone, Debug, PartialEq)]
pub struct SqlInsert {
    /// Target table.
    pub table: TableReference,
    /// Inserted columns.
    pub columns: Vec<Arc<str>>,
    /// Value rows.
    pub rows: Vec<Vec<SqlExpression>>,
}

/// Any compiled statement.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlStatement {
    /// Query.
    Select(SqlSelect),
    /// Delete.
    Delete(SqlDelete),
    /// Update.
    Update(SqlUpdate),
    /// Insert.
    Insert(SqlInsert),
}

impl SqlStatement {
    /// Tables read or written by the statement, driving table first.
    pub fn affected_tables(&self) -> Vec<Arc<str>> {
        match self {
            SqlStatement::Select(select) => {
                let mut tables = vec![select.from.name.clone()];
                tables.extend(select.joins.iter().map(|join| join.table.name.clone()));
                tables
            }
            SqlStatement::Delete(delete) => vec![delete.table.name.clone()],
            SqlStatement::Update(update) => vec![update.table.name.clone()],
            SqlStatement::Insert(insert) => vec![insert.table.name.clone()],
        }
    }

    /// Placeholders in rendering order.
    pub fn parameters(&self) -> Vec<JdbcParameterId> {
        let mut out = Vec::new();
        match self {
            SqlStatement::Select(select) => select.collect_parameters(&mut out),
            SqlStatement::Delete(delete) => {
                if let Some(restriction) = &delete.restriction {
                    restriction.collect_parameters(&mut out);
                }
            }
            SqlStatement::Update(update) => {
                for assignment in &update.assignments {
                    assignment.value.collect_parameters(&mut out);
                }
                if let Some(restriction) = &update.restriction {
                    restriction.collect_parameters(&mut out);
                }
            }
            SqlStatement::Insert(insert) => {
                for row in &insert.rows {
                    for value in row {
                        value.collect_parameters(&mut out);
                    }
                }
            }
        }
        out
    }

    /// Returns the restriction of a delete, update, or select.
    pub fn restriction(&self) -> Option<&SqlPredicate> {
        match self {
            SqlStatement::Select(select) => select.restriction.as_ref(),
            SqlStatement::Delete(delete) => delete.restriction.as_ref(),
            SqlStatement::Update(update) => update.restriction.as_ref(),
            SqlStatement::Insert(_) => None,
        }
    }
}
