//! Resource catalog: turns discovery output into a duplicate-free set of watch targets.

use rustc_hash::{FxHashSet, FxHashMap};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::event::TargetIdentity;
use crate::gvr::{GroupVersion, GroupVersionResource};
use crate::versions::VersionPreferences;

/// One resource as reported by server discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResourceDescriptor {
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
    pub verbs: SmallVec<[String; 8]>,
}

impl ApiResourceDescriptor {
    pub fn new<I, S>(name: impl Into<String>, kind: impl Into<String>, namespaced: bool, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { name: name.into(), kind: kind.into(), namespaced, verbs: verbs.into_iter().map(Into::into).collect() }
    }

    /// Subresources (`pods/status`, `deployments/scale`) are nested under a primary resource.
    pub fn is_subresource(&self) -> bool {
        self.name.contains('/')
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// All resources discovery listed for a single group/version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub group_version: String,
    pub resources: Vec<ApiResourceDescriptor>,
}

impl DiscoveryEntry {
    pub fn new(group_version: impl Into<String>, resources: Vec<ApiResourceDescriptor>) -> Self {
        Self { group_version: group_version.into(), resources }
    }
}

/// A catalog entry: what to watch plus what a dynamic API handle needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub gvr: GroupVersionResource,
    /// API group the resource was discovered under (empty for core).
    pub group: String,
    pub kind: String,
    pub namespaced: bool,
}

impl WatchTarget {
    /// Owned identity handed to the per-target event handler.
    pub fn identity(&self) -> TargetIdentity {
        TargetIdentity { resource: self.gvr.resource.clone(), group: self.group.clone() }
    }
}

/// Counters for everything the builder declined to watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipStats {
    pub empty_entries: usize,
    pub deprecated_entries: usize,
    pub malformed_entries: usize,
    pub subresources: usize,
    pub unwatchable: usize,
    pub duplicates: usize,
}

/// Final, order-independent set of watch targets.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    targets: Vec<WatchTarget>,
    watched: FxHashSet<GroupVersionResource>,
    stats: SkipStats,
    deprecated_skips: Vec<(String, String)>,
    missing_replacements: Vec<(String, String)>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, gvr: &GroupVersionResource) -> bool {
        self.watched.contains(gvr)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WatchTarget> {
        self.targets.iter()
    }

    pub fn targets(&self) -> &[WatchTarget] {
        &self.targets
    }

    pub fn stats(&self) -> SkipStats {
        self.stats
    }

    /// Every `(deprecated, preferred)` pair skipped on deprecation, sorted.
    pub fn deprecated_skips(&self) -> &[(String, String)] {
        &self.deprecated_skips
    }

    /// `(deprecated, preferred)` pairs whose preferred version was not taken into
    /// the catalog, either because discovery never listed it or because it was
    /// skipped itself. Resources under those pairs are not watched at all.
    pub fn missing_replacements(&self) -> &[(String, String)] {
        &self.missing_replacements
    }

    /// Targets sorted by GVR, for stable display.
    pub fn sorted(&self) -> Vec<&WatchTarget> {
        let mut out: Vec<_> = self.targets.iter().collect();
        out.sort_by(|a, b| a.gvr.cmp(&b.gvr));
        out
    }
}

impl IntoIterator for Catalog {
    type Item = WatchTarget;
    type IntoIter = std::vec::IntoIter<WatchTarget>;

    fn into_iter(self) -> Self::IntoIter {
        self.targets.into_iter()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a WatchTarget;
    type IntoIter = std::slice::Iter<'a, WatchTarget>;

    fn into_iter(self) -> Self::IntoIter {
        self.targets.iter()
    }
}

/// Single-pass accumulator. Feed every discovery entry, then [`finish`](Self::finish).
pub struct CatalogBuilder<'p> {
    prefs: &'p VersionPreferences,
    catalog: Catalog,
    // entries that passed the deprecation and parse checks
    accepted_group_versions: FxHashSet<String>,
    // deprecated -> preferred, for entries skipped on deprecation
    skipped_deprecated: FxHashMap<String, String>,
}

impl<'p> CatalogBuilder<'p> {
    pub fn new(prefs: &'p VersionPreferences) -> Self {
        Self {
            prefs,
            catalog: Catalog::default(),
            accepted_group_versions: FxHashSet::default(),
            skipped_deprecated: FxHashMap::default(),
        }
    }

    /// Fold one discovery entry into the catalog. Never fails: every bad entry or
    /// resource is logged, counted and skipped.
    pub fn push_entry(&mut self, entry: &DiscoveryEntry) {
        if entry.group_version.is_empty() {
            warn!(resources = entry.resources.len(), "skipping discovery entry without group/version");
            self.catalog.stats.empty_entries += 1;
            return;
        }

        if let Some(preferred) = self.prefs.preferred(&entry.group_version) {
            info!(
                group_version = %entry.group_version,
                preferred = %preferred,
                "skipping deprecated API version in favor of preferred version"
            );
            self.catalog.stats.deprecated_entries += 1;
            self.skipped_deprecated.insert(entry.group_version.clone(), preferred.to_string());
            return;
        }

        let gv: GroupVersion = match entry.group_version.parse() {
            Ok(gv) => gv,
            Err(e) => {
                warn!(group_version = %entry.group_version, error = %e, "failed to parse group/version; skipping entry");
                self.catalog.stats.malformed_entries += 1;
                return;
            }
        };
        self.accepted_group_versions.insert(entry.group_version.clone());

        for res in &entry.resources {
            if res.is_subresource() {
                debug!(group_version = %entry.group_version, resource = %res.name, "skipping subresource");
                self.catalog.stats.subresources += 1;
                continue;
            }
            if !res.supports("watch") {
                debug!(group_version = %entry.group_version, resource = %res.name, "skipping resource without watch verb");
                self.catalog.stats.unwatchable += 1;
                continue;
            }
            let gvr = GroupVersionResource::new(gv.group.clone(), gv.version.clone(), res.name.clone());
            if self.catalog.watched.contains(&gvr) {
                debug!(gvr = %gvr, "resource already in catalog");
                self.catalog.stats.duplicates += 1;
                continue;
            }
            debug!(gvr = %gvr, "adding watch target");
            self.catalog.watched.insert(gvr.clone());
            self.catalog.targets.push(WatchTarget {
                gvr,
                group: gv.group.clone(),
                kind: res.kind.clone(),
                namespaced: res.namespaced,
            });
        }
    }

    pub fn finish(mut self) -> Catalog {
        let mut skips: Vec<(String, String)> = self.skipped_deprecated.into_iter().collect();
        skips.sort();
        let missing: Vec<(String, String)> = skips
            .iter()
            .filter(|(_, preferred)| !self.accepted_group_versions.contains(preferred))
            .cloned()
            .collect();
        for (deprecated, preferred) in &missing {
            warn!(
                group_version = %deprecated,
                preferred = %preferred,
                "deprecated API version skipped but preferred version is not served; its resources stay unwatched"
            );
        }
        self.catalog.missing_replacements = missing;
        self.catalog.deprecated_skips = skips;
        self.catalog
    }
}

/// Build a catalog from a full discovery result.
pub fn build_catalog<'a, I>(entries: I, prefs: &VersionPreferences) -> Catalog
where
    I: IntoIterator<Item = &'a DiscoveryEntry>,
{
    let mut builder = CatalogBuilder::new(prefs);
    for entry in entries {
        builder.push_entry(entry);
    }
    builder.finish()
}
