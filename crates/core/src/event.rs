//! Event normalization: lifecycle callbacks -> [`NormalizedEvent`].

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "ADDED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource name and API group a handler reports events under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetIdentity {
    pub resource: String,
    pub group: String,
}

/// Uniform record of one observed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub kind: EventKind,
    pub resource_type: String,
    pub resource_group: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
}

/// Borrowed namespace/name of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataView<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

/// Capability check for "has standard object metadata".
///
/// Returns `None` when the payload has no usable metadata (no name).
pub trait HasMetadata {
    fn metadata_view(&self) -> Option<MetadataView<'_>>;
}

impl HasMetadata for ObjectMeta {
    fn metadata_view(&self) -> Option<MetadataView<'_>> {
        let name = self.name.as_deref().filter(|n| !n.is_empty())?;
        Some(MetadataView { namespace: self.namespace.as_deref().unwrap_or(""), name })
    }
}

impl HasMetadata for serde_json::Value {
    fn metadata_view(&self) -> Option<MetadataView<'_>> {
        let meta = self.get("metadata")?.as_object()?;
        let name = meta.get("name")?.as_str().filter(|n| !n.is_empty())?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        Some(MetadataView { namespace, name })
    }
}

impl<T: HasMetadata + ?Sized> HasMetadata for &T {
    fn metadata_view(&self) -> Option<MetadataView<'_>> {
        (**self).metadata_view()
    }
}

/// Build the event for `obj` observed under `identity`, or `None` if `obj`
/// lacks metadata. For updates pass the new object; the old one is not read.
pub fn normalize<O: HasMetadata + ?Sized>(kind: EventKind, identity: &TargetIdentity, obj: &O) -> Option<NormalizedEvent> {
    let meta = obj.metadata_view()?;
    Some(NormalizedEvent {
        kind,
        resource_type: identity.resource.clone(),
        resource_group: identity.group.clone(),
        namespace: meta.namespace.to_string(),
        name: meta.name.to_string(),
    })
}
