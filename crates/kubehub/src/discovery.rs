//! Raw server discovery: every version of every API group, not just the preferred one.

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use kwatch_core::{ApiResourceDescriptor, DiscoveryEntry};
use tracing::{debug, info, warn};

const CONCURRENT_LISTS: usize = 8;

/// Convert one server `APIResourceList` into a catalog input entry.
pub fn entry_from_list(list: APIResourceList) -> DiscoveryEntry {
    let resources = list
        .resources
        .into_iter()
        .map(|ar| ApiResourceDescriptor::new(ar.name, ar.kind, ar.namespaced, ar.verbs))
        .collect();
    DiscoveryEntry::new(list.group_version, resources)
}

/// Fetch all group/version resource lists from the API server.
///
/// Failing to list the core versions or the API groups is an error. A single
/// group/version that cannot be listed (e.g. a broken aggregated API) is
/// logged and left out.
pub async fn discover(client: &Client) -> Result<Vec<DiscoveryEntry>> {
    let core = client.list_core_api_versions().await.context("listing core API versions")?;
    let groups = client.list_api_groups().await.context("listing API groups")?;

    let mut group_versions: Vec<(bool, String)> = core.versions.into_iter().map(|v| (true, v)).collect();
    for group in groups.groups {
        for ver in group.versions {
            group_versions.push((false, ver.group_version));
        }
    }
    debug!(count = group_versions.len(), "listing group/versions");

    let results: Vec<_> = stream::iter(group_versions)
        .map(|(is_core, gv)| async move {
            let list = if is_core {
                client.list_core_api_resources(&gv).await
            } else {
                client.list_api_group_resources(&gv).await
            };
            (gv, list)
        })
        .buffer_unordered(CONCURRENT_LISTS)
        .collect()
        .await;

    let mut out = Vec::with_capacity(results.len());
    for (gv, list) in results {
        match list {
            Ok(list) => out.push(entry_from_list(list)),
            Err(e) => warn!(group_version = %gv, error = %e, "failed to list resources; skipping group/version"),
        }
    }
    out.sort_by(|a, b| a.group_version.cmp(&b.group_version));
    info!(entries = out.len(), "discovery complete");
    Ok(out)
}
