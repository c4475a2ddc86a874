//! Relevance predicates: does a dependency transition matter to its dependents?

use std::sync::Arc;

use meshwire_core::{DependencyKind, ObjectState};
use rustc_hash::FxHashMap;

/// Pure function over two snapshots of the same object. No I/O, no hidden state.
pub trait RelevancePredicate: Send + Sync {
    fn name(&self) -> &str;
    fn is_relevant(&self, old: &ObjectState, new: &ObjectState) -> bool;
}

/// Relevant iff the status condition `condition` flipped between True and anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionChanged {
    condition: String,
}

impl ConditionChanged {
    pub fn new(condition: impl Into<String>) -> Self {
        Self { condition: condition.into() }
    }

    pub fn virtual_node_active() -> Self { Self::new("VirtualNodeActive") }
    pub fn virtual_router_active() -> Self { Self::new("VirtualRouterActive") }
    pub fn virtual_gateway_active() -> Self { Self::new("VirtualGatewayActive") }

    pub fn condition(&self) -> &str { &self.condition }
}

impl RelevancePredicate for ConditionChanged {
    fn name(&self) -> &str { &self.condition }

    fn is_relevant(&self, old: &ObjectState, new: &ObjectState) -> bool {
        condition_true(&old.raw, &self.condition) != condition_true(&new.raw, &self.condition)
    }
}

/// `status.conditions[type == condition].status == "True"`; absent means false.
pub fn condition_true(raw: &serde_json::Value, condition: &str) -> bool {
    raw.pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .and_then(|conds| conds.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition)))
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        == Some("True")
}

/// Predicate selection per dependency kind, resolved once when a bridge is built.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    by_kind: FxHashMap<DependencyKind, Arc<dyn RelevancePredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self { Self::default() }

    /// Active-condition predicates for every App Mesh dependency kind.
    pub fn with_defaults() -> Self {
        Self::new()
            .with(DependencyKind::VirtualNode, ConditionChanged::virtual_node_active())
            .with(DependencyKind::VirtualRouter, ConditionChanged::virtual_router_active())
            .with(DependencyKind::VirtualGateway, ConditionChanged::virtual_gateway_active())
    }

    pub fn with<P: RelevancePredicate + 'static>(mut self, kind: DependencyKind, predicate: P) -> Self {
        self.register(kind, Arc::new(predicate));
        self
    }

    pub fn register(&mut self, kind: DependencyKind, predicate: Arc<dyn RelevancePredicate>) {
        self.by_kind.insert(kind, predicate);
    }

    pub fn get(&self, kind: DependencyKind) -> Option<Arc<dyn RelevancePredicate>> {
        self.by_kind.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::ObjectKey;
    use serde_json::json;

    fn vn(conditions: serde_json::Value) -> ObjectState {
        ObjectState::new(
            ObjectKey::new("mesh", "node-a"),
            json!({ "metadata": { "name": "node-a", "namespace": "mesh" }, "status": { "conditions": conditions } }),
        )
    }

    fn active(status: &str) -> ObjectState {
        vn(json!([{ "type": "VirtualNodeActive", "status": status }]))
    }

    #[test]
    fn flip_to_active_is_relevant() {
        let p = ConditionChanged::virtual_node_active();
        assert!(p.is_relevant(&active("False"), &active("True")));
        assert!(p.is_relevant(&active("True"), &active("Unknown")));
    }

    #[test]
    fn unchanged_activity_is_not_relevant() {
        let p = ConditionChanged::virtual_node_active();
        let mut churned = active("True");
        churned.raw["status"]["observedGeneration"] = json!(7);
        assert!(!p.is_relevant(&active("True"), &churned));
        assert!(!p.is_relevant(&active("False"), &active("Unknown")));
    }

    #[test]
    fn missing_condition_counts_as_inactive() {
        let p = ConditionChanged::virtual_node_active();
        let bare = ObjectState::new(ObjectKey::new("mesh", "node-a"), json!({ "metadata": { "name": "node-a" } }));
        assert!(!p.is_relevant(&bare, &vn(json!([]))));
        assert!(p.is_relevant(&bare, &active("True")));
        let other = vn(json!([{ "type": "VirtualRouterActive", "status": "True" }]));
        assert!(!p.is_relevant(&bare, &other));
    }

    #[test]
    fn registry_resolves_per_kind() {
        let reg = PredicateRegistry::with_defaults();
        assert_eq!(reg.get(DependencyKind::VirtualNode).unwrap().name(), "VirtualNodeActive");
        assert_eq!(reg.get(DependencyKind::VirtualRouter).unwrap().name(), "VirtualRouterActive");
        assert!(PredicateRegistry::new().get(DependencyKind::VirtualGateway).is_none());
    }
}
