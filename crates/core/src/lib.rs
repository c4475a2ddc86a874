//! meshwire core types shared by the index, the bridge and the kube wiring.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Namespaced identity of a managed object. Cluster-scoped objects carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    /// Read `metadata.namespace` / `metadata.name` from a raw object.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid object key: {0:?} (expect ns/name or name)")]
    Key(String),
    #[error("unknown dependency kind: {0:?}")]
    Kind(String),
}

impl FromStr for ObjectKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(ParseError::Key(s.to_string())),
        }
    }
}

/// Which relation a reference belongs to. Keys of different kinds never collide in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyKind {
    VirtualNode,
    VirtualRouter,
    VirtualGateway,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 3] =
        [DependencyKind::VirtualNode, DependencyKind::VirtualRouter, DependencyKind::VirtualGateway];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::VirtualNode => "virtualNode",
            DependencyKind::VirtualRouter => "virtualRouter",
            DependencyKind::VirtualGateway => "virtualGateway",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DependencyKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::Kind(s.to_string()))
    }
}

/// Observable state of one object as delivered by the watch layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub key: ObjectKey,
    /// Raw object JSON (managedFields stripped)
    pub raw: serde_json::Value,
}

impl ObjectState {
    pub fn new(key: ObjectKey, raw: serde_json::Value) -> Self {
        Self { key, raw }
    }

    pub fn from_raw(raw: serde_json::Value) -> Option<Self> {
        let key = ObjectKey::from_raw(&raw)?;
        Some(Self { key, raw })
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.raw.get("metadata")?.get("resourceVersion")?.as_str()
    }
}

/// Lifecycle notification for one watched object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Created(ObjectState),
    Updated { old: ObjectState, new: ObjectState },
    Deleted(ObjectState),
    /// Non-differential re-notification; carries at most the identity it was raised for.
    Resynced(Option<ObjectKey>),
}

impl LifecycleEvent {
    pub fn key(&self) -> Option<&ObjectKey> {
        match self {
            LifecycleEvent::Created(s) | LifecycleEvent::Deleted(s) => Some(&s.key),
            LifecycleEvent::Updated { new, .. } => Some(&new.key),
            LifecycleEvent::Resynced(k) => k.as_ref(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LifecycleEvent::Created(_) => "create",
            LifecycleEvent::Updated { .. } => "update",
            LifecycleEvent::Deleted(_) => "delete",
            LifecycleEvent::Resynced(_) => "generic",
        }
    }
}

/// Request to converge one dependent object. The kind is implied by the queue it lands on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub key: ObjectKey,
}

impl From<ObjectKey> for ReconcileRequest {
    fn from(key: ObjectKey) -> Self {
        Self { key }
    }
}

pub mod prelude {
    pub use super::{DependencyKind, LifecycleEvent, ObjectKey, ObjectState, ReconcileRequest};
}
