//! Domain-level and placeholder-level parameter bindings.

use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::tree::ParameterKey;
use crate::types::{JdbcParameterId, PlanError, Result, Value, ValueType};

/// Value bound to a domain parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    /// One value.
    Single(Value),
    /// Collection value, expanded into one placeholder per element.
    Multi(Vec<Value>),
}

impl BindValue {
    /// Returns `true` for collection values.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, BindValue::Multi(_))
    }

    /// Type of the first non-null value.
    pub fn value_type(&self) -> ValueType {
        match self {
            BindValue::Single(value) => value.value_type(),
            BindValue::Multi(values) => values
                .iter()
                .find(|value| !value.is_null())
                .map(Value::value_type)
                .unwrap_or(ValueType::Unknown),
        }
    }
}

/// Values bound to the domain parameters of one execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterBindings {
    values: IndexMap<ParameterKey, BindValue>,
}

impl ParameterBindings {
    /// Empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a value to a parameter key.
    pub fn bind(mut self, key: ParameterKey, value: BindValue) -> Self {
        self.values.insert(key, value);
        self
    }

    /// Binds a single value to `:name`.
    pub fn named(self, name: &str, value: impl Into<Value>) -> Self {
        self.bind(ParameterKey::Named(Arc::from(name)), BindValue::Single(value.into()))
    }

    /// Binds a collection to `:name`.
    pub fn named_multi(self, name: &str, values: Vec<Value>) -> Self {
        self.bind(ParameterKey::Named(Arc::from(name)), BindValue::Multi(values))
    }

    /// Binds a single value to `?position`.
    pub fn positional(self, position: u32, value: impl Into<Value>) -> Self {
        self.bind(ParameterKey::Positional(position), BindValue::Single(value.into()))
    }

    /// Binds in place.
    pub fn set(&mut self, key: ParameterKey, value: BindValue) {
        self.values.insert(key, value);
    }

    /// Bound value for `key`.
    pub fn get(&self, key: &ParameterKey) -> Option<&BindValue> {
        self.values.get(key)
    }

    /// Returns `true` if any binding is a collection.
    pub fn has_multi_valued(&self) -> bool {
        self.values.values().any(BindValue::is_multi_valued)
    }

    /// Returns `true` when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&ParameterKey, &BindValue)> {
        self.values.iter()
    }
}

/// Values bound to compiled placeholders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JdbcParameterBindings {
    values: FxHashMap<JdbcParameterId, Value>,
}

impl JdbcParameterBindings {
    /// Empty bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a placeholder.
    pub fn insert(&mut self, id: JdbcParameterId, value: Value) {
        self.values.insert(id, value);
    }

    /// Bound value for a placeholder.
    pub fn get(&self, id: JdbcParameterId) -> Option<&Value> {
        self.values.get(&id)
    }

    /// Number of bound placeholders.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in the given placeholder order.
    pub fn values_for(&self, order: &[JdbcParameterId]) -> Result<Vec<Value>> {
        order
            .iter()
            .map(|id| {
                self.values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| PlanError::invariant(format!("placeholder {id} was never bound")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_multi_valued_bindings() {
        let single = ParameterBindings::new().named("status", "OPEN");
        assert!(!single.has_multi_valued());
        let multi = single.named_multi("region", vec![Value::from("EU"), Value::from("US")]);
        assert!(multi.has_multi_valued());
    }

    #[test]
    fn values_for_reports_unbound_placeholders() {
        let mut jdbc = JdbcParameterBindings::new();
        jdbc.insert(JdbcParameterId(0), Value::Int(1));
        assert_eq!(
            jdbc.values_for(&[JdbcParameterId(0)]).expect("bound"),
            vec![Value::Int(1)]
        );
        let err = jdbc
            .values_for(&[JdbcParameterId(0), JdbcParameterId(1)])
            .expect_err("unbound");
        assert!(err.is_invariant());
    }
}
