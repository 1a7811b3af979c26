//! Cross-reference between domain parameters and their occurrences.
//!
//! The forward map (domain parameter to occurrences, in first-encountered
//! order) is resolved once per statement and shared between copies. The
//! reverse map and the expansion bookkeeping are owned per instance, so an
//! execution that expands multi-valued parameters works on its own
//! [`ParameterCrossReference::copy`] and clears it when done.

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::tree::{DomainParameter, ParameterKind, ParameterNode, Statement};
use crate::types::{NodeId, PlanError, Result};

#[derive(Debug, Default)]
struct SharedResolution {
    forward: IndexMap<DomainParameter, Vec<ParameterNode>>,
    node_count: usize,
}

/// Bidirectional index between domain parameters and parameter nodes.
#[derive(Debug)]
pub struct ParameterCrossReference {
    shared: Arc<SharedResolution>,
    reverse: FxHashMap<NodeId, DomainParameter>,
    expansions: IndexMap<DomainParameter, Vec<ParameterNode>>,
}

static EMPTY: OnceLock<Arc<ParameterCrossReference>> = OnceLock::new();

impl ParameterCrossReference {
    /// Process-wide instance for statements without parameters.
    pub fn empty() -> Arc<ParameterCrossReference> {
        EMPTY
            .get_or_init(|| {
                Arc::new(ParameterCrossReference {
                    shared: Arc::new(SharedResolution::default()),
                    reverse: FxHashMap::default(),
                    expansions: IndexMap::new(),
                })
            })
            .clone()
    }

    /// Resolves the parameters of `statement`.
    ///
    /// Returns the shared empty instance when the statement has none. A bare
    /// criteria parameter in the resolved set is an invariant violation: it
    /// must have been replaced by its wrapper node before resolution.
    pub fn build(statement: &Statement) -> Result<Arc<ParameterCrossReference>> {
        let nodes = statement.parameters();
        if nodes.is_empty() {
            return Ok(Self::empty());
        }
        let mut forward: IndexMap<DomainParameter, Vec<ParameterNode>> = IndexMap::new();
        let mut reverse = FxHashMap::default();
        for node in nodes {
            if let ParameterKind::Criteria(param) = node.kind() {
                return Err(PlanError::invariant(format!(
                    "unwrapped criteria parameter {} in resolved parameter set",
                    param.id
                )));
            }
            if reverse.contains_key(&node.id()) {
                continue;
            }
            let domain = node.domain_parameter();
            reverse.insert(node.id(), domain.clone());
            forward.entry(domain).or_default().push(node.clone());
        }
        let node_count = reverse.len();
        Ok(Arc::new(ParameterCrossReference {
            shared: Arc::new(SharedResolution {
                forward,
                node_count,
            }),
            reverse,
            expansions: IndexMap::new(),
        }))
    }

    /// Returns `true` when the statement has no parameters.
    pub fn is_empty(&self) -> bool {
        self.shared.forward.is_empty()
    }

    /// Domain parameters in first-encountered order.
    pub fn parameters(&self) -> impl Iterator<Item = &DomainParameter> {
        self.shared.forward.keys()
    }

    /// Number of distinct domain parameters.
    pub fn parameter_count(&self) -> usize {
        self.shared.forward.len()
    }

    /// Number of resolved occurrences, expansions excluded.
    pub fn node_count(&self) -> usize {
        self.shared.node_count
    }

    /// Occurrences of `parameter` in first-encountered order.
    pub fn nodes_for(&self, parameter: &DomainParameter) -> &[ParameterNode] {
        self.shared
            .forward
            .get(parameter)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolves an occurrence (or an expansion) to its domain parameter.
    pub fn query_parameter_for(&self, node: &ParameterNode) -> Option<DomainParameter> {
        if let Some(own) = node.as_domain_parameter() {
            return Some(own);
        }
        self.reverse.get(&node.id()).cloned()
    }

    /// Records `expansion` as standing for one value bound to `parameter`
    /// through the occurrence `original`.
    pub fn register_expansion(
        &mut self,
        parameter: &DomainParameter,
        original: &ParameterNode,
        expansion: ParameterNode,
    ) -> Result<()> {
        if self.is_empty() {
            return Err(PlanError::invariant(
                "expansion registered on a cross-reference without parameters",
            ));
        }
        match self.reverse.get(&original.id()) {
            Some(owner) if owner == parameter => {}
            Some(owner) => {
                return Err(PlanError::invariant(format!(
                    "occurrence {} belongs to {owner}, not {parameter}",
                    original.id()
                )))
            }
            None => {
                return Err(PlanError::invariant(format!(
                    "occurrence {} of {parameter} is not part of this statement",
                    original.id()
                )))
            }
        }
        if self.reverse.contains_key(&expansion.id()) {
            return Err(PlanError::invariant(format!(
                "expansion {} registered twice",
                expansion.id()
            )));
        }
        trace!(parameter = %parameter, expansion = %expansion.id(), "plan.xref.expand");
        self.reverse.insert(expansion.id(), parameter.clone());
        self.expansions
            .entry(parameter.clone())
            .or_default()
            .push(expansion);
        Ok(())
    }

    /// Expansions registered for `parameter` since the last clear.
    pub fn expansions_for(&self, parameter: &DomainParameter) -> &[ParameterNode] {
        self.expansions
            .get(parameter)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Returns `true` if any expansion is registered.
    pub fn has_expansions(&self) -> bool {
        !self.expansions.is_empty()
    }

    /// Forgets every expansion.
    pub fn clear_expansions(&mut self) {
        for nodes in self.expansions.values() {
            for node in nodes {
                self.reverse.remove(&node.id());
            }
        }
        self.expansions.clear();
    }

    /// Copy sharing the resolved forward map with an independent reverse map
    /// and no expansions.
    pub fn copy(&self) -> ParameterCrossReference {
        let mut reverse = self.reverse.clone();
        for nodes in self.expansions.values() {
            for node in nodes {
                reverse.remove(&node.id());
            }
        }
        ParameterCrossReference {
            shared: Arc::clone(&self.shared),
            reverse,
            expansions: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{
        CriteriaParameter, DeleteStatement, EntityRoot, Expression, Predicate, SelectStatement,
    };

    fn statement_with(nodes: Vec<ParameterNode>) -> Statement {
        let parts = nodes
            .into_iter()
            .map(|node| Predicate::eq(Expression::path("e", "a"), Expression::parameter(node)))
            .collect();
        Statement::Delete(DeleteStatement {
            target: EntityRoot::new("Order", "e"),
            restriction: Some(Predicate::Or(parts)),
        })
    }

    #[test]
    fn statements_without_parameters_share_the_empty_instance() {
        let stmt = Statement::Select(SelectStatement::entity(EntityRoot::new("Order", "o")));
        let xref = ParameterCrossReference::build(&stmt).expect("build");
        assert!(xref.is_empty());
        assert!(Arc::ptr_eq(&xref, &ParameterCrossReference::empty()));
    }

    #[test]
    fn reused_parameter_keeps_occurrence_order() {
        let first = ParameterNode::named("x");
        let second = ParameterNode::named("x");
        let other = ParameterNode::positional(1);
        let ids = [first.id(), second.id()];
        let stmt = statement_with(vec![first, other, second]);
        let xref = ParameterCrossReference::build(&stmt).expect("build");
        assert_eq!(xref.parameter_count(), 2);
        assert_eq!(xref.node_count(), 3);
        let x = DomainParameter::named("x");
        let found: Vec<_> = xref.nodes_for(&x).iter().map(ParameterNode::id).collect();
        assert_eq!(found, ids);
        let order: Vec<String> = xref.parameters().map(ToString::to_string).collect();
        assert_eq!(order, vec![":x", "?1"]);
    }

    #[test]
    fn bare_criteria_parameter_is_an_invariant_violation() {
        let bare = ParameterNode::new(
            ParameterKind::Criteria(CriteriaParameter {
                id: 9,
                name: None,
                allow_multi_valued: false,
            }),
            false,
        );
        let err = ParameterCrossReference::build(&statement_with(vec![bare])).expect_err("bare");
        assert!(err.is_invariant());
    }

    #[test]
    fn bare_criteria_parameter_resolves_to_itself() {
        let xref = ParameterCrossReference::empty();
        let param = CriteriaParameter {
            id: 3,
            name: Some(Arc::from("limit")),
            allow_multi_valued: false,
        };
        let node = ParameterNode::new(ParameterKind::Criteria(param.clone()), false);
        assert_eq!(xref.query_parameter_for(&node), Some(param.domain_parameter()));
    }

    #[test]
    fn expansions_resolve_until_cleared() {
        let node = ParameterNode::named("ids").multi_valued();
        let stmt = statement_with(vec![node.clone()]);
        let shared = ParameterCrossReference::build(&stmt).expect("build");
        let mut xref = shared.copy();
        let param = node.domain_parameter();
        let expansion = node.expansion();
        xref.register_expansion(&param, &node, expansion.clone())
            .expect("register");
        assert_eq!(xref.query_parameter_for(&expansion), Some(param.clone()));
        assert!(shared.query_parameter_for(&expansion).is_none());

        let err = xref
            .register_expansion(&param, &node, expansion.clone())
            .expect_err("duplicate");
        assert!(err.is_invariant());

        xref.clear_expansions();
        assert!(xref.query_parameter_for(&expansion).is_none());
        assert!(xref.expansions_for(&param).is_empty());
        assert_eq!(xref.query_parameter_for(&node), Some(param));
    }

    #[test]
    fn expanding_an_empty_reference_fails() {
        let mut xref = ParameterCrossReference::empty().copy();
        let node = ParameterNode::named("ids");
        let err = xref
            .register_expansion(&node.domain_parameter(), &node, node.expansion())
            .expect_err("empty");
        assert!(err.is_invariant());
    }
}
