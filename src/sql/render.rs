//! SQL text rendering.

use std::fmt::Write;

use crate::query::options::LockMode;
use crate::sql::{
    ColumnReference, SqlExpression, SqlPredicate, SqlSelect, SqlStatement, TableReference,
};
use crate::types::{JdbcParameterId, PlanError, Result};

/// Rendered statement text plus the placeholder binding order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedSql {
    /// Statement text with `?` placeholders.
    pub sql: String,
    /// Placeholder identities in the order their `?` markers appear.
    pub parameter_order: Vec<JdbcParameterId>,
}

/// Turns a compiled statement into dialect text.
pub trait SqlRenderer: Send + Sync {
    /// Renders `statement`.
    fn render(&self, statement: &SqlStatement) -> Result<RenderedSql>;
}

/// Plain ANSI renderer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnsiRenderer;

impl SqlRenderer for AnsiRenderer {
    fn render(&self, statement: &SqlStatement) -> Result<RenderedSql> {
        let mut out = Writer::default();
        out.statement(statement)?;
        Ok(RenderedSql {
            sql: out.sql,
            parameter_order: out.order,
        })
    }
}

#[derive(Default)]
struct Writer {
    sql: String,
    order: Vec<JdbcParameterId>,
}

fn fmt_err(_: std::fmt::Error) -> PlanError {
    PlanError::invariant("failed to format SQL text")
}

impl Writer {
    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn statement(&mut self, statement: &SqlStatement) -> Result<()> {
        match statement {
            SqlStatement::Select(select) => self.select(select),
            SqlStatement::Delete(delete) => {
                self.push("delete from ");
                self.table(&delete.table);
                if let Some(restriction) = &delete.restriction {
                    self.push(" where ");
                    self.predicate(restriction)?;
                }
                self.returning(&delete.returning);
                Ok(())
            }
            SqlStatement::Update(update) => {
                if update.assignments.is_empty() {
                    return Err(PlanError::invariant("update without assignments"));
                }
                self.push("update ");
                self.table(&update.table);
                self.push(" set ");
                for (idx, assignment) in update.assignments.iter().enumerate() {
                    if idx > 0 {
                        self.push(", ");
                    }
                    self.column(&assignment.column);
                    self.push(" = ");
                    self.expression(&assignment.value)?;
                }
                if let Some(restriction) = &update.restriction {
                    self.push(" where ");
                    self.predicate(restriction)?;
                }
                self.returning(&update.returning);
                Ok(())
            }
            SqlStatement::Insert(insert) => {
                self.push("insert into ");
                self.table(&insert.table);
                self.push(" (");
                self.push(&insert.columns.join(", "));
                self.push(") values ");
                for (row_idx, row) in insert.rows.iter().enumerate() {
                    if row_idx > 0 {
                        self.push(", ");
                    }
                    self.push("(");
                    self.list(row)?;
                    self.push(")");
                }
                Ok(())
            }
        }
    }

    fn select(&mut self, select: &SqlSelect) -> Result<()> {
        self.push("select ");
        self.list(&select.projection)?;
        self.push(" from ");
        self.table(&select.from);
        for join in &select.joins {
            self.push(" join ");
            self.table(&join.table);
            self.push(" on ");
            self.predicate(&join.on)?;
        }
        if let Some(restriction) = &select.restriction {
            self.push(" where ");
            self.predicate(restriction)?;
        }
        if !select.order_by.is_empty() {
            self.push(" order by ");
            for (idx, item) in select.order_by.iter().enumerate() {
                if idx > 0 {
                    self.push(", ");
                }
                self.expression(&item.expression)?;
                write!(self.sql, " {}", item.direction.to_string().to_lowercase())
                    .map_err(fmt_err)?;
            }
        }
        if let Some(offset) = select.offset {
            write!(self.sql, " offset {offset} rows").map_err(fmt_err)?;
        }
        if let Some(fetch) = select.fetch {
            write!(self.sql, " fetch first {fetch} rows only").map_err(fmt_err)?;
        }
        match select.lock {
            None | Some(LockMode::None) | Some(LockMode::Read) => {}
            Some(LockMode::PessimisticRead) => self.push(" for share"),
            Some(LockMode::PessimisticWrite) => self.push(" for update"),
            Some(LockMode::UpgradeNoWait) => self.push(" for update nowait"),
            Some(LockMode::UpgradeSkipLocked) => self.push(" for update skip locked"),
        }
        Ok(())
    }

    fn returning(&mut self, columns: &[ColumnReference]) {
        if columns.is_empty() {
            return;
        }
        self.push(" returning ");
        for (idx, column) in columns.iter().enumerate() {
            if idx > 0 {
                self.push(", ");
            }
            self.column(column);
        }
    }

    fn table(&mut self, table: &TableReference) {
        self.push(&table.name);
        if let Some(alias) = &table.alias {
            self.push(" ");
            self.push(alias);
        }
    }

    fn column(&mut self, column: &ColumnReference) {
        if let Some(qualifier) = &column.qualifier {
            self.push(qualifier);
            self.push(".");
        }
        self.push(&column.column);
    }

    fn list(&mut self, items: &[SqlExpression]) -> Result<()> {
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                self.push(", ");
            }
            self.expression(item)?;
        }
        Ok(())
    }

    fn expression(&mut self, expr: &SqlExpression) -> Result<()> {
        match expr {
            SqlExpression::Column(column) => self.column(column),
            SqlExpression::Literal(value) => {
                write!(self.sql, "{value}").map_err(fmt_err)?;
            }
            SqlExpression::Parameter(id) => {
                self.push("?");
                self.order.push(*id);
            }
            SqlExpression::Tuple(items) => {
                self.push("(");
                self.list(items)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn predicate(&mut self, predicate: &SqlPredicate) -> Result<()> {
        match predicate {
            SqlPredicate::Comparison { left, op, right } => {
                self.expression(left)?;
                self.push(" ");
                self.push(op.symbol());
                self.push(" ");
                self.expression(right)?;
            }
            SqlPredicate::And(parts) => self.junction(parts, " and ")?,
            SqlPredicate::Or(parts) => self.junction(parts, " or ")?,
            SqlPredicate::Not(inner) => {
                self.push("not (");
                self.predicate(inner)?;
                self.push(")");
            }
            SqlPredicate::InList {
                expr,
                list,
                negated,
            } => {
                if list.is_empty() {
                    // An empty IN list is never true; NOT IN over it always is.
                    self.push(if *negated { "1=1" } else { "1=0" });
                    return Ok(());
                }
                self.expression(expr)?;
                self.push(if *negated { " not in (" } else { " in (" });
                self.list(list)?;
                self.push(")");
            }
            SqlPredicate::InSubQuery {
                expr,
                query,
                negated,
            } => {
                self.expression(expr)?;
                self.push(if *negated { " not in (" } else { " in (" });
                self.select(query)?;
                self.push(")");
            }
            SqlPredicate::IsNull { expr, negated } => {
                self.expression(expr)?;
                self.push(if *negated { " is not null" } else { " is null" });
            }
            SqlPredicate::Fragment(text) => self.push(text),
        }
        Ok(())
    }

    fn junction(&mut self, parts: &[SqlPredicate], separator: &str) -> Result<()> {
        for (idx, part) in parts.iter().enumerate() {
            if idx > 0 {
                self.push(separator);
            }
            let nested = matches!(part, SqlPredicate::And(_) | SqlPredicate::Or(_));
            if nested {
                self.push("(");
            }
            self.predicate(part)?;
            if nested {
                self.push(")");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{SqlDelete, SqlSelect};
    use crate::tree::ComparisonOp;
    use crate::types::Value;

    #[test]
    fn renders_placeholders_in_order() {
        let stmt = SqlStatement::Delete(SqlDelete {
            table: TableReference::new("orders"),
            restriction: Some(SqlPredicate::And(vec![
                SqlPredicate::Comparison {
                    left: SqlExpression::column("status"),
                    op: ComparisonOp::Eq,
                    right: SqlExpression::Parameter(JdbcParameterId(2)),
                },
                SqlPredicate::InList {
                    expr: SqlExpression::column("region"),
                    list: vec![
                        SqlExpression::Parameter(JdbcParameterId(0)),
                        SqlExpression::Parameter(JdbcParameterId(1)),
                    ],
                    negated: false,
                },
            ])),
            returning: Vec::new(),
        });
        let rendered = AnsiRenderer.render(&stmt).expect("render");
        assert_eq!(
            rendered.sql,
            "delete from orders where status = ? and region in (?, ?)"
        );
        assert_eq!(
            rendered.parameter_order,
            vec![JdbcParameterId(2), JdbcParameterId(0), JdbcParameterId(1)]
        );
        assert_eq!(rendered.parameter_order, stmt.parameters());
    }

    #[test]
    fn renders_paging_and_lock_clauses() {
        let mut select = SqlSelect::new(
            TableReference::aliased("orders", "t0"),
            vec![SqlExpression::Column(ColumnReference::qualified("t0", "id"))],
        );
        select.restriction = Some(SqlPredicate::Comparison {
            left: SqlExpression::Column(ColumnReference::qualified("t0", "total")),
            op: ComparisonOp::Gt,
            right: SqlExpression::Literal(Value::Int(10)),
        });
        select.offset = Some(20);
        select.fetch = Some(10);
        select.lock = Some(LockMode::PessimisticWrite);
        let rendered = AnsiRenderer
            .render(&SqlStatement::Select(select))
            .expect("render");
        assert_eq!(
            rendered.sql,
            "select t0.id from orders t0 where t0.total > 10 offset 20 rows fetch first 10 rows only for update"
        );
    }
}
