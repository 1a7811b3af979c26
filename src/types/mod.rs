//! Shared value types, identity tokens, and the crate error type.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Identity token assigned to a statement-tree node when it is constructed.
///
/// Two nodes may be structurally equal and still be distinct occurrences;
/// anything that must tell them apart keys on the `NodeId`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

impl NodeId {
    /// Allocates a process-unique node identity.
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one positional placeholder in a compiled low-level statement.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct JdbcParameterId(pub u32);

impl fmt::Display for JdbcParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Runtime value flowing through bindings, literals, and result rows.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
    /// Binary value
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the bindable type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Unknown,
            Value::Bool(_) => ValueType::Boolean,
            Value::Int(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::Text,
            Value::Bytes(_) => ValueType::Binary,
        }
    }
}

// Floats hash by bit pattern so literal-bearing trees can be fingerprinted.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Value::Bytes(v) => {
                write!(f, "X'")?;
                for byte in v {
                    write!(f, "{byte:02X}")?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Bindable type resolved for a domain parameter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ValueType {
    /// No value has been bound yet, or only nulls were bound.
    Unknown,
    /// Boolean values.
    Boolean,
    /// Signed integer values.
    Integer,
    /// Floating-point values.
    Float,
    /// Character data.
    Text,
    /// Binary data.
    Binary,
}

/// One positional result row produced by the low-level executor.
pub type Row = Vec<Value>;

/// Errors surfaced while building, caching, or executing plans.
///
/// Variants fall into four families: usage errors caused by malformed
/// requests, invariant violations that indicate a bug, unsupported
/// operations, and execution errors passed through from the executor.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A keyset rewrite was requested for a statement selecting more than one item.
    #[error("keyed pagination requires exactly one selection item (got {count})")]
    MultipleSelections {
        /// Number of selection items found.
        count: usize,
    },
    /// A keyset rewrite was requested for a statement that does not select an entity.
    #[error("keyed pagination requires the selection to be an entity root")]
    NonEntitySelection,
    /// A key definition was applied to a statement over a different entity.
    #[error("key definition for entity '{expected}' applied to a query selecting '{found}'")]
    WrongEntityType {
        /// Entity named by the key definition.
        expected: String,
        /// Entity selected by the statement.
        found: String,
    },
    /// A boundary key contained a null component.
    #[error("key value at position {index} is null")]
    NullKey {
        /// Position of the null key component.
        index: usize,
    },
    /// The boundary key tuple length does not match the key definition.
    #[error("key has {found} values but the key definition has {expected} columns")]
    KeyArity {
        /// Number of key columns in the definition.
        expected: usize,
        /// Number of supplied key values.
        found: usize,
    },
    /// No value was bound for a parameter referenced by the statement.
    #[error("no value bound for parameter {parameter}")]
    MissingBinding {
        /// Display form of the parameter.
        parameter: String,
    },
    /// A collection value was bound to a parameter that does not accept one.
    #[error("parameter {parameter} does not accept multi-valued bindings")]
    MultiValuedNotAllowed {
        /// Display form of the parameter.
        parameter: String,
    },
    /// The mapping model has no entity with this name.
    #[error("unknown entity '{entity}'")]
    UnknownEntity {
        /// Requested entity name.
        entity: String,
    },
    /// The entity has no attribute with this name.
    #[error("entity '{entity}' has no attribute '{attribute}'")]
    UnknownAttribute {
        /// Entity name.
        entity: String,
        /// Requested attribute name.
        attribute: String,
    },
    /// A path referenced an alias the statement does not declare.
    #[error("unknown alias '{alias}'")]
    UnknownAlias {
        /// Requested alias.
        alias: String,
    },
    /// Any other malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An internal assertion failed; this indicates a bug rather than bad input.
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    /// The operation is not supported by this plan.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// The low-level executor failed.
    #[error("statement execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PlanError {
    /// Builds a [`PlanError::Invariant`].
    pub fn invariant(message: impl Into<String>) -> Self {
        PlanError::Invariant(message.into())
    }

    /// Builds a [`PlanError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        PlanError::InvalidArgument(message.into())
    }

    /// Wraps an executor failure.
    pub fn execution<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        PlanError::Execution(err.into())
    }

    /// Returns `true` for errors caused by a malformed request.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            PlanError::MultipleSelections { .. }
                | PlanError::NonEntitySelection
                | PlanError::WrongEntityType { .. }
                | PlanError::NullKey { .. }
                | PlanError::KeyArity { .. }
                | PlanError::MissingBinding { .. }
                | PlanError::MultiValuedNotAllowed { .. }
                | PlanError::UnknownEntity { .. }
                | PlanError::UnknownAttribute { .. }
                | PlanError::UnknownAlias { .. }
                | PlanError::InvalidArgument(_)
        )
    }

    /// Returns `true` for internal assertion failures.
    pub fn is_invariant(&self) -> bool {
        matches!(self, PlanError::Invariant(_))
    }

    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::MultipleSelections { .. } => "MultipleSelections",
            PlanError::NonEntitySelection => "NonEntitySelection",
            PlanError::WrongEntityType { .. } => "WrongEntityType",
            PlanError::NullKey { .. } => "NullKey",
            PlanError::KeyArity { .. } => "KeyArity",
            PlanError::MissingBinding { .. } => "MissingBinding",
            PlanError::MultiValuedNotAllowed { .. } => "MultiValuedNotAllowed",
            PlanError::UnknownEntity { .. } => "UnknownEntity",
            PlanError::UnknownAttribute { .. } => "UnknownAttribute",
            PlanError::UnknownAlias { .. } => "UnknownAlias",
            PlanError::InvalidArgument(_) => "InvalidArgument",
            PlanError::Invariant(_) => "Invariant",
            PlanError::Unsupported(_) => "Unsupported",
            PlanError::Execution(_) => "Execution",
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let a = NodeId::next();
        let b = NodeId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn error_families_are_disjoint() {
        let usage = PlanError::NullKey { index: 1 };
        let bug = PlanError::invariant("unexpected parameter kind");
        let unsupported = PlanError::Unsupported("scroll");
        assert!(usage.is_usage() && !usage.is_invariant());
        assert!(bug.is_invariant() && !bug.is_usage());
        assert!(!unsupported.is_usage() && !unsupported.is_invariant());
        assert_eq!(bug.code(), "Invariant");
    }

    #[test]
    fn string_literals_escape_quotes() {
        assert_eq!(Value::from("O'Hara").to_string(), "'O''Hara'");
        assert_eq!(Value::Bytes(vec![0xAB, 0x01]).to_string(), "X'AB01'");
    }
}
