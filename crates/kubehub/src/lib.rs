//! kwatch kubehub: discovery and watcher wiring

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::{Client, Config};
use tracing::info;

pub mod discovery;
pub mod driver;
pub mod handler;
pub mod informer;

pub use discovery::{discover, entry_from_list};
pub use driver::{SyncBarrier, SyncSignal, WatchDriver};
pub use handler::EventHandler;
pub use informer::{drive, Change, InformerCache};

/// Build a kube client. `in_cluster` forces the service-account config;
/// otherwise kubeconfig is tried first, then in-cluster.
pub async fn connect(in_cluster: bool) -> Result<Client> {
    let config = if in_cluster {
        Config::incluster().context("loading in-cluster config")?
    } else {
        Config::infer().await.context("inferring kube config")?
    };
    info!(cluster_url = %config.cluster_url, in_cluster, "connecting to API server");
    Client::try_from(config).context("constructing kube client")
}
