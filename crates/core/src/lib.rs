//! kwatch core types: GVRs, the resource catalog and event normalization.
//!
//! Nothing in here talks to a cluster. Discovery output comes in as plain
//! [`DiscoveryEntry`] values and leaves as a [`Catalog`] of watch targets;
//! watch callbacks go through [`normalize`] before reaching an [`EventSink`].

#![forbid(unsafe_code)]

pub mod catalog;
pub mod event;
pub mod gvr;
pub mod sink;
pub mod versions;

pub use catalog::{build_catalog, ApiResourceDescriptor, Catalog, CatalogBuilder, DiscoveryEntry, SkipStats, WatchTarget};
pub use event::{normalize, EventKind, HasMetadata, MetadataView, NormalizedEvent, TargetIdentity};
pub use gvr::{GroupVersion, GroupVersionError, GroupVersionResource};
pub use sink::{EventSink, SinkError};
pub use versions::VersionPreferences;
