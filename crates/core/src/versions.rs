//! Deprecated API group/versions and their preferred replacements.

use rustc_hash::FxHashMap;

/// Built-in table: deprecated group/version -> preferred group/version.
static PREFERRED_VERSIONS: &[(&str, &str)] = &[("flowcontrol.apiserver.k8s.io/v1beta3", "flowcontrol.apiserver.k8s.io/v1")];

/// Lookup of deprecated group/versions.
///
/// Starts from the built-in table; extra pairs can be layered on top
/// (e.g. from the command line). Lookups never check that the preferred
/// version is actually served.
#[derive(Debug, Clone, Default)]
pub struct VersionPreferences {
    overrides: FxHashMap<String, String>,
}

impl VersionPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `deprecated` as superseded by `preferred`. Later calls win.
    pub fn with_override(mut self, deprecated: impl Into<String>, preferred: impl Into<String>) -> Self {
        self.overrides.insert(deprecated.into(), preferred.into());
        self
    }

    /// Preferred replacement when `group_version` is deprecated.
    pub fn preferred(&self, group_version: &str) -> Option<&str> {
        if let Some(p) = self.overrides.get(group_version) {
            return Some(p.as_str());
        }
        PREFERRED_VERSIONS
            .iter()
            .find(|(deprecated, _)| *deprecated == group_version)
            .map(|(_, preferred)| *preferred)
    }

    pub fn is_deprecated(&self, group_version: &str) -> bool {
        self.preferred(group_version).is_some()
    }

    /// Number of known deprecated group/versions (built-in plus overrides).
    pub fn len(&self) -> usize {
        let extra = self
            .overrides
            .keys()
            .filter(|k| !PREFERRED_VERSIONS.iter().any(|(d, _)| *d == k.as_str()))
            .count();
        PREFERRED_VERSIONS.len() + extra
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
