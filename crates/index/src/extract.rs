use meshwire_core::{DependencyKind, ObjectKey, ObjectState};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One declared reference from a dependent to a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub kind: DependencyKind,
    pub target: ObjectKey,
}

impl Reference {
    pub fn new(kind: DependencyKind, target: ObjectKey) -> Self {
        Self { kind, target }
    }
}

pub type References = SmallVec<[Reference; 4]>;

/// Derives the references an object's spec declares.
pub trait ReferenceExtractor: Send + Sync {
    fn extract(&self, state: &ObjectState) -> References;
}

/// VirtualService provider references (`spec.provider.virtualNode.virtualNodeRef`,
/// `spec.provider.virtualRouter.virtualRouterRef`). A ref without namespace points
/// into the VirtualService's own namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualServiceReferences;

impl ReferenceExtractor for VirtualServiceReferences {
    fn extract(&self, state: &ObjectState) -> References {
        let mut out = References::new();
        let Some(provider) = state.raw.pointer("/spec/provider") else { return out };
        let slots = [
            ("virtualNode", "virtualNodeRef", DependencyKind::VirtualNode),
            ("virtualRouter", "virtualRouterRef", DependencyKind::VirtualRouter),
        ];
        for (field, ref_field, kind) in slots {
            let Some(r) = provider.get(field).and_then(|p| p.get(ref_field)) else { continue };
            let Some(name) = r.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else { continue };
            let namespace = r
                .get("namespace")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(state.key.namespace.as_str());
            out.push(Reference::new(kind, ObjectKey::new(namespace, name)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vs(spec: serde_json::Value) -> ObjectState {
        ObjectState::new(ObjectKey::new("prod", "svc1"), json!({ "metadata": { "name": "svc1", "namespace": "prod" }, "spec": spec }))
    }

    #[test]
    fn node_ref_defaults_to_own_namespace() {
        let st = vs(json!({ "provider": { "virtualNode": { "virtualNodeRef": { "name": "node-a" } } } }));
        let refs = VirtualServiceReferences.extract(&st);
        assert_eq!(refs.as_slice(), &[Reference::new(DependencyKind::VirtualNode, ObjectKey::new("prod", "node-a"))]);
    }

    #[test]
    fn router_ref_keeps_explicit_namespace() {
        let st = vs(json!({ "provider": { "virtualRouter": { "virtualRouterRef": { "namespace": "edge", "name": "rt" } } } }));
        let refs = VirtualServiceReferences.extract(&st);
        assert_eq!(refs.as_slice(), &[Reference::new(DependencyKind::VirtualRouter, ObjectKey::new("edge", "rt"))]);
    }

    #[test]
    fn no_provider_no_references() {
        assert!(VirtualServiceReferences.extract(&vs(json!({ "awsName": "svc1.prod" }))).is_empty());
        assert!(VirtualServiceReferences.extract(&vs(json!({ "provider": { "virtualNode": {} } }))).is_empty());
    }
}
