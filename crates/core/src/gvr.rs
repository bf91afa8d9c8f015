use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Group/Version/Resource triple identifying one watch target.
///
/// `group` is empty for the core (legacy) API group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// `apiVersion` form: `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupVersionError {
    #[error("empty group/version string")]
    Empty,
    #[error("unexpected group/version string: {0:?}")]
    TooManySegments(String),
    #[error("group/version string {0:?} has no version")]
    MissingVersion(String),
}

/// Parsed `apiVersion` string as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl FromStr for GroupVersion {
    type Err = GroupVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(GroupVersionError::Empty);
        }
        let mut parts = s.split('/');
        let (group, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(version), None, _) => ("", version),
            (Some(group), Some(version), None) => (group, version),
            _ => return Err(GroupVersionError::TooManySegments(s.to_string())),
        };
        if version.is_empty() {
            return Err(GroupVersionError::MissingVersion(s.to_string()));
        }
        Ok(Self { group: group.to_string(), version: version.to_string() })
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.version)
        } else {
            write!(f, "{}/{}", self.group, self.version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_and_named_groups() {
        let core: GroupVersion = "v1".parse().unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.version, "v1");

        let apps: GroupVersion = "apps/v1".parse().unwrap();
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.version, "v1");
        assert_eq!(apps.to_string(), "apps/v1");
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("".parse::<GroupVersion>(), Err(GroupVersionError::Empty));
        assert!(matches!("a/b/c".parse::<GroupVersion>(), Err(GroupVersionError::TooManySegments(_))));
        assert!(matches!("apps/".parse::<GroupVersion>(), Err(GroupVersionError::MissingVersion(_))));
    }

    #[test]
    fn gvr_renders_api_version() {
        let pods = GroupVersionResource::new("", "v1", "pods");
        assert_eq!(pods.api_version(), "v1");
        assert_eq!(pods.to_string(), "v1/pods");

        let deploys = GroupVersionResource::new("apps", "v1", "deployments");
        assert_eq!(deploys.api_version(), "apps/v1");
        assert_eq!(deploys.to_string(), "apps/v1/deployments");
    }
}
