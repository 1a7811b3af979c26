//! Domain statement tree: entity/attribute level queries and mutations.
//!
//! Every parameter occurrence carries a [`NodeId`] assigned at construction.
//! Equality and hashing ignore that identity so two structurally equal trees
//! fingerprint the same, while the cross-reference can still tell
//! occurrences apart.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use xxhash_rust::xxh64::Xxh64;

use crate::types::{NodeId, PlanError, Value};

/// Identity of a user-visible bind variable.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ParameterKey {
    /// `:name` parameter.
    Named(Arc<str>),
    /// `?1` style parameter.
    Positional(u32),
    /// Parameter created programmatically with a synthetic identity.
    Synthetic(u64),
}

/// A user-supplied bind variable, unique within a statement.
#[derive(Clone, Debug)]
pub struct DomainParameter {
    key: ParameterKey,
    allow_multi_valued: bool,
}

impl DomainParameter {
    /// Creates a domain parameter.
    pub fn new(key: ParameterKey, allow_multi_valued: bool) -> Self {
        Self {
            key,
            allow_multi_valued,
        }
    }

    /// Named parameter shorthand.
    pub fn named(name: &str) -> Self {
        Self::new(ParameterKey::Named(Arc::from(name)), false)
    }

    /// Positional parameter shorthand.
    pub fn positional(position: u32) -> Self {
        Self::new(ParameterKey::Positional(position), false)
    }

    /// Returns the parameter identity.
    pub fn key(&self) -> &ParameterKey {
        &self.key
    }

    /// Returns whether a collection value may be bound to this parameter.
    pub fn allows_multi_valued(&self) -> bool {
        self.allow_multi_valued
    }
}

impl PartialEq for DomainParameter {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for DomainParameter {}

impl Hash for DomainParameter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for DomainParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            ParameterKey::Named(name) => write!(f, ":{name}"),
            ParameterKey::Positional(pos) => write!(f, "?{pos}"),
            ParameterKey::Synthetic(id) => write!(f, ":param{id}"),
        }
    }
}

/// A parameter created through a programmatic (criteria) builder.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CriteriaParameter {
    /// Synthetic identity.
    pub id: u64,
    /// Optional user-facing name.
    pub name: Option<Arc<str>>,
    /// Whether a collection value may be bound.
    pub allow_multi_valued: bool,
}

impl CriteriaParameter {
    /// Returns the domain parameter this criteria parameter stands for.
    pub fn domain_parameter(&self) -> DomainParameter {
        DomainParameter::new(ParameterKey::Synthetic(self.id), self.allow_multi_valued)
    }
}

/// Shape of a parameter occurrence.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// `:name` occurrence.
    Named(Arc<str>),
    /// `?n` occurrence.
    Positional(u32),
    /// Tree node wrapping a criteria parameter.
    CriteriaWrapper(CriteriaParameter),
    /// A criteria parameter used directly as a node. It is its own domain
    /// parameter and must be wrapped before parameter resolution.
    Criteria(CriteriaParameter),
}

/// One occurrence of a parameter inside a statement tree.
#[derive(Clone, Debug)]
pub struct ParameterNode {
    id: NodeId,
    kind: ParameterKind,
    allow_multi_valued: bool,
}

impl ParameterNode {
    /// Creates an occurrence with a fresh identity.
    pub fn new(kind: ParameterKind, allow_multi_valued: bool) -> Self {
        Self {
            id: NodeId::next(),
            kind,
            allow_multi_valued,
        }
    }

    /// `:name` occurrence.
    pub fn named(name: &str) -> Self {
        Self::new(ParameterKind::Named(Arc::from(name)), false)
    }

    /// `?n` occurrence.
    pub fn positional(position: u32) -> Self {
        Self::new(ParameterKind::Positional(position), false)
    }

    /// Wrapped criteria parameter occurrence.
    pub fn criteria(parameter: CriteriaParameter) -> Self {
        let multi = parameter.allow_multi_valued;
        Self::new(ParameterKind::CriteriaWrapper(parameter), multi)
    }

    /// Marks the occurrence as accepting collection values.
    pub fn multi_valued(mut self) -> Self {
        self.allow_multi_valued = true;
        self
    }

    /// Returns the node identity.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the occurrence shape.
    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    /// Returns whether collection values may be bound here.
    pub fn allows_multi_valued(&self) -> bool {
        self.allow_multi_valued
    }

    /// Returns the domain parameter this occurrence refers to.
    pub fn domain_parameter(&self) -> DomainParameter {
        match &self.kind {
            ParameterKind::Named(name) => {
                DomainParameter::new(ParameterKey::Named(name.clone()), self.allow_multi_valued)
            }
            ParameterKind::Positional(pos) => {
                DomainParameter::new(ParameterKey::Positional(*pos), self.allow_multi_valued)
            }
            ParameterKind::CriteriaWrapper(param) | ParameterKind::Criteria(param) => {
                param.domain_parameter()
            }
        }
    }

    /// Returns the domain parameter if this node is one itself.
    pub fn as_domain_parameter(&self) -> Option<DomainParameter> {
        match &self.kind {
            ParameterKind::Criteria(param) => Some(param.domain_parameter()),
            _ => None,
        }
    }

    /// Creates an expansion node standing for one value of a multi-valued binding.
    pub fn expansion(&self) -> Self {
        Self {
            id: NodeId::next(),
            kind: self.kind.clone(),
            allow_multi_valued: false,
        }
    }
}

impl PartialEq for ParameterNode {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.allow_multi_valued == other.allow_multi_valued
    }
}

impl Hash for ParameterNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.allow_multi_valued.hash(state);
    }
}

impl fmt::Display for ParameterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ParameterKind::Named(name) => write!(f, ":{name}"),
            ParameterKind::Positional(pos) => write!(f, "?{pos}"),
            ParameterKind::CriteriaWrapper(param) | ParameterKind::Criteria(param) => {
                match &param.name {
                    Some(name) => write!(f, ":{name}"),
                    None => write!(f, ":param{}", param.id),
                }
            }
        }
    }
}

/// Attribute reference through a declared alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path {
    /// Alias of the entity root.
    pub alias: Arc<str>,
    /// Attribute name.
    pub attribute: Arc<str>,
}

/// Scalar expression.
#[derive(Clone, Debug, PartialEq, Hash)]
pub enum Expression {
    /// Attribute path.
    Path(Path),
    /// Inline literal.
    Literal(Value),
    /// Parameter occurrence.
    Parameter(ParameterNode),
    /// Tuple of expressions.
    Tuple(Vec<Expression>),
}

impl Expression {
    /// Builds an attribute path expression.
    pub fn path(alias: &str, attribute: &str) -> Self {
        Expression::Path(Path {
            alias: Arc::from(alias),
            attribute: Arc::from(attribute),
        })
    }

    /// Builds a literal expression.
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    /// Builds a parameter expression.
    pub fn parameter(node: ParameterNode) -> Self {
        Expression::Parameter(node)
    }

    fn collect_parameters<'a>(&'a self, out: &mut Vec<&'a ParameterNode>) {
        match self {
            Expression::Path(_) | Expression::Literal(_) => {}
            Expression::Parameter(node) => out.push(node),
            Expression::Tuple(items) => {
                for item in items {
                    item.collect_parameters(out);
                }
            }
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Path(path) => write!(f, "{}.{}", path.alias, path.attribute),
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Parameter(node) => write!(f, "{node}"),
            Expression::Tuple(items) => {
                write!(f, "(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Binary comparison operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl ComparisonOp {
    /// Returns the operator token.
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        }
    }
}

/// Boolean restriction.
#[derive(Clone, Debug, PartialEq, Hash)]
pub enum Predicate {
    /// `left op right`
    Comparison {
        /// Left operand.
        left: Expression,
        /// Operator.
        op: ComparisonOp,
        /// Right operand.
        right: Expression,
    },
    /// Conjunction.
    And(Vec<Predicate>),
    /// Disjunction.
    Or(Vec<Predicate>),
    /// Negation.
    Not(Box<Predicate>),
    /// `expr [NOT] IN (list)`
    In {
        /// Tested expression.
        expr: Expression,
        /// Candidate values. A single multi-valued parameter expands here.
        list: Vec<Expression>,
        /// `NOT IN` when set.
        negated: bool,
    },
    /// `expr IS [NOT] NULL`
    IsNull {
        /// Tested expression.
        expr: Expression,
        /// `IS NOT NULL` when set.
        negated: bool,
    },
}

impl Predicate {
    /// Builds a comparison.
    pub fn compare(left: Expression, op: ComparisonOp, right: Expression) -> Self {
        Predicate::Comparison { left, op, right }
    }

    /// Builds an equality comparison.
    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::compare(left, ComparisonOp::Eq, right)
    }

    /// Builds an `IN` predicate.
    pub fn in_list(expr: Expression, list: Vec<Expression>) -> Self {
        Predicate::In {
            expr,
            list,
            negated: false,
        }
    }

    /// Conjunction that collapses to the single operand when only one is given.
    pub fn and(mut parts: Vec<Predicate>) -> Self {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::And(parts)
        }
    }

    /// ANDs `extra` onto an optional existing restriction.
    pub fn conjoin(existing: Option<Predicate>, extra: Predicate) -> Predicate {
        match existing {
            None => extra,
            Some(Predicate::And(mut parts)) => {
                parts.push(extra);
                Predicate::And(parts)
            }
            Some(other) => Predicate::And(vec![other, extra]),
        }
    }

    fn collect_parameters<'a>(&'a self, out: &mut Vec<&'a ParameterNode>) {
        match self {
            Predicate::Comparison { left, right, .. } => {
                left.collect_parameters(out);
                right.collect_parameters(out);
            }
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    part.collect_parameters(out);
                }
            }
            Predicate::Not(inner) => inner.collect_parameters(out),
            Predicate::In { expr, list, .. } => {
                expr.collect_parameters(out);
                for item in list {
                    item.collect_parameters(out);
                }
            }
            Predicate::IsNull { expr, .. } => expr.collect_parameters(out),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Comparison { left, op, right } => {
                write!(f, "{left} {} {right}", op.symbol())
            }
            Predicate::And(parts) => {
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " AND ")?;
                    }
                    match part {
                        Predicate::Or(_) => write!(f, "({part})")?,
                        _ => write!(f, "{part}")?,
                    }
                }
                Ok(())
            }
            Predicate::Or(parts) => {
                for (idx, part) in parts.iter().enumerate() {
                    if idx > 0 {
                        write!(f, " OR ")?;
                    }
                    write!(f, "({part})")?;
                }
                Ok(())
            }
            Predicate::Not(inner) => write!(f, "NOT ({inner})"),
            Predicate::In {
                expr,
                list,
                negated,
            } => {
                write!(f, "{expr} {}IN (", if *negated { "NOT " } else { "" })?;
                for (idx, item) in list.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Predicate::IsNull { expr, negated } => {
                write!(f, "{expr} IS {}NULL", if *negated { "NOT " } else { "" })
            }
        }
    }
}

/// Entity root declared in a `FROM` clause.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRoot {
    /// Entity name.
    pub entity: Arc<str>,
    /// Declared alias.
    pub alias: Arc<str>,
}

impl EntityRoot {
    /// Creates an entity root.
    pub fn new(entity: &str, alias: &str) -> Self {
        Self {
            entity: Arc::from(entity),
            alias: Arc::from(alias),
        }
    }
}

/// One item of a select list.
#[derive(Clone, Debug, PartialEq, Hash)]
pub enum Selection {
    /// The entity bound to an alias.
    Entity(Arc<str>),
    /// A scalar expression.
    Expression(Expression),
    /// Compound of the original selection and the key tuple added by keyed pagination.
    Keyed {
        /// Original selection.
        selection: Box<Selection>,
        /// Key expressions in key-definition order.
        key: Vec<Expression>,
    },
}

/// Sort direction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SortDirection {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

impl SortDirection {
    /// Returns the opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

impl FromStr for SortDirection {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Ascending),
            "desc" | "descending" => Ok(SortDirection::Descending),
            other => Err(PlanError::invariant(format!("unrecognized sort direction '{other}'"))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Ascending => write!(f, "ASC"),
            SortDirection::Descending => write!(f, "DESC"),
        }
    }
}

/// One `ORDER BY` item.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct SortSpecification {
    /// Sort expression.
    pub expression: Expression,
    /// Direction.
    pub direction: SortDirection,
}

/// Entity-level select.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct SelectStatement {
    /// Entity root.
    pub from: EntityRoot,
    /// Select list.
    pub selections: Vec<Selection>,
    /// `WHERE` restriction.
    pub restriction: Option<Predicate>,
    /// `ORDER BY` items.
    pub order_by: Vec<SortSpecification>,
}

impl SelectStatement {
    /// Selects the root entity itself.
    pub fn entity(root: EntityRoot) -> Self {
        let alias = root.alias.clone();
        Self {
            from: root,
            selections: vec![Selection::Entity(alias)],
            restriction: None,
            order_by: Vec::new(),
        }
    }

    /// Sets the restriction.
    pub fn with_restriction(mut self, restriction: Predicate) -> Self {
        self.restriction = Some(restriction);
        self
    }

    /// Appends an ordering item.
    pub fn order_by(mut self, expression: Expression, direction: SortDirection) -> Self {
        self.order_by.push(SortSpecification {
            expression,
            direction,
        });
        self
    }
}

/// Entity-level delete.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct DeleteStatement {
    /// Target entity root.
    pub target: EntityRoot,
    /// `WHERE` restriction.
    pub restriction: Option<Predicate>,
}

/// `attribute = value` in an update.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct Assignment {
    /// Assigned attribute.
    pub attribute: Arc<str>,
    /// Assigned value.
    pub value: Expression,
}

impl Assignment {
    /// Creates an assignment.
    pub fn new(attribute: &str, value: Expression) -> Self {
        Self {
            attribute: Arc::from(attribute),
            value,
        }
    }
}

/// Entity-level update.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct UpdateStatement {
    /// Target entity root.
    pub target: EntityRoot,
    /// `SET` items.
    pub assignments: Vec<Assignment>,
    /// `WHERE` restriction.
    pub restriction: Option<Predicate>,
}

/// Entity-level insert of literal or parameter rows.
#[derive(Clone, Debug, PartialEq, Hash)]
pub struct InsertStatement {
    /// Target entity root.
    pub target: EntityRoot,
    /// Inserted attributes.
    pub attributes: Vec<Arc<str>>,
    /// Value rows, each matching `attributes`.
    pub rows: Vec<Vec<Expression>>,
}

/// Any domain statement.
#[derive(Clone, Debug, PartialEq, Hash)]
pub enum Statement {
    /// Select.
    Select(SelectStatement),
    /// Delete.
    Delete(DeleteStatement),
    /// Update.
    Update(UpdateStatement),
    /// Insert.
    Insert(InsertStatement),
}

impl Statement {
    /// Returns the targeted entity root.
    pub fn root(&self) -> &EntityRoot {
        match self {
            Statement::Select(select) => &select.from,
            Statement::Delete(delete) => &delete.target,
            Statement::Update(update) => &update.target,
            Statement::Insert(insert) => &insert.target,
        }
    }

    /// Returns the targeted entity name.
    pub fn target_entity(&self) -> &str {
        &self.root().entity
    }

    /// Returns `true` for selects.
    pub fn is_select(&self) -> bool {
        matches!(self, Statement::Select(_))
    }

    /// Returns every parameter occurrence in encounter order.
    pub fn parameters(&self) -> Vec<&ParameterNode> {
        let mut out = Vec::new();
        match self {
            Statement::Select(select) => {
                for selection in &select.selections {
                    collect_selection(selection, &mut out);
                }
                if let Some(restriction) = &select.restriction {
                    restriction.collect_parameters(&mut out);
                }
                for sort in &select.order_by {
                    sort.expression.collect_parameters(&mut out);
                }
            }
            Statement::Delete(delete) => {
                if let Some(restriction) = &delete.restriction {
                    restriction.collect_parameters(&mut out);
                }
            }
            Statement::Update(update) => {
                for assignment in &update.assignments {
                    assignment.value.collect_parameters(&mut out);
                }
                if let Some(restriction) = &update.restriction {
                    restriction.collect_parameters(&mut out);
                }
            }
            Statement::Insert(insert) => {
                for row in &insert.rows {
                    for value in row {
                        value.collect_parameters(&mut out);
                    }
                }
            }
        }
        out
    }

    /// Returns a copy of the statement retargeted at another entity.
    pub fn with_target(&self, entity: &str) -> Statement {
        let mut copy = self.clone();
        let root = match &mut copy {
            Statement::Select(select) => &mut select.from,
            Statement::Delete(delete) => &mut delete.target,
            Statement::Update(update) => &mut update.target,
            Statement::Insert(insert) => &mut insert.target,
        };
        root.entity = Arc::from(entity);
        copy
    }

    /// Structural fingerprint; node identities do not participate.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh64::new(0);
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn collect_selection<'a>(selection: &'a Selection, out: &mut Vec<&'a ParameterNode>) {
    match selection {
        Selection::Entity(_) => {}
        Selection::Expression(expr) => expr.collect_parameters(out),
        Selection::Keyed { selection, key } => {
            collect_selection(selection, out);
            for expr in key {
                expr.collect_parameters(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted_delete() -> Statement {
        Statement::Delete(DeleteStatement {
            target: EntityRoot::new("Order", "o"),
            restriction: Some(Predicate::and(vec![
                Predicate::eq(
                    Expression::path("o", "status"),
                    Expression::parameter(ParameterNode::named("status")),
                ),
                Predicate::compare(
                    Expression::path("o", "total"),
                    ComparisonOp::Gt,
                    Expression::parameter(ParameterNode::positional(1)),
                ),
            ])),
        })
    }

    #[test]
    fn parameters_are_collected_in_encounter_order() {
        let stmt = restricted_delete();
        let params: Vec<String> = stmt.parameters().iter().map(|p| p.to_string()).collect();
        assert_eq!(params, vec![":status", "?1"]);
    }

    #[test]
    fn fingerprint_ignores_node_identity() {
        let a = restricted_delete();
        let b = restricted_delete();
        assert_ne!(a.parameters()[0].id(), b.parameters()[0].id());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), a.with_target("Invoice").fingerprint());
    }

    #[test]
    fn disjunction_inside_conjunction_is_parenthesized() {
        let pred = Predicate::conjoin(
            Some(Predicate::eq(Expression::path("e", "a"), Expression::literal(1i64))),
            Predicate::Or(vec![
                Predicate::eq(Expression::path("e", "b"), Expression::literal(2i64)),
                Predicate::eq(Expression::path("e", "c"), Expression::literal(3i64)),
            ]),
        );
        assert_eq!(pred.to_string(), "e.a = 1 AND ((e.b = 2) OR (e.c = 3))");
    }

    #[test]
    fn sort_direction_parses_and_rejects_unknown() {
        assert_eq!("DESC".parse::<SortDirection>().expect("desc"), SortDirection::Descending);
        let err = "sideways".parse::<SortDirection>().expect_err("unknown");
        assert!(err.is_invariant());
        assert!(!err.is_usage());
    }
}
