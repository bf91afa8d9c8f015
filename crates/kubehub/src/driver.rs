//! Watch driver: registers one informer per catalog entry, starts them and
//! waits for every initial listing.

use kube::Client;
use kwatch_core::{GroupVersionResource, WatchTarget};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::EventHandler;
use crate::informer::Informer;

/// Write half of a sync flag; flipped once by an informer after its first full list.
#[derive(Debug)]
pub struct SyncSignal(watch::Sender<bool>);

impl SyncSignal {
    pub fn mark_synced(&self) {
        self.0.send_replace(true);
    }
}

/// Collects one sync flag per watch and waits for all of them.
#[derive(Debug, Default)]
pub struct SyncBarrier {
    pending: Vec<(GroupVersionResource, watch::Receiver<bool>)>,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gvr: GroupVersionResource) -> SyncSignal {
        let (tx, rx) = watch::channel(false);
        self.pending.push((gvr, rx));
        SyncSignal(tx)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Block until every registered watch reported sync. Returns `false` if
    /// cancelled first. A watch whose task ended without syncing is logged
    /// and not waited on.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        for (gvr, rx) in self.pending.iter_mut() {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                res = rx.wait_for(|synced| *synced) => {
                    if res.is_err() {
                        warn!(gvr = %gvr, "watch ended before initial sync");
                    } else {
                        debug!(gvr = %gvr, "cache synced");
                    }
                }
            }
        }
        true
    }
}

/// Owns every informer for the session.
pub struct WatchDriver {
    client: Client,
    registered: Vec<Informer>,
    barrier: SyncBarrier,
    running: Vec<JoinHandle<()>>,
}

impl WatchDriver {
    pub fn new(client: Client) -> Self {
        Self { client, registered: Vec::new(), barrier: SyncBarrier::new(), running: Vec::new() }
    }

    /// Register a watch for `target`, delivering changes to `handler`.
    pub fn register(&mut self, target: WatchTarget, handler: EventHandler) {
        debug!(gvr = %target.gvr, "registering watch");
        let signal = self.barrier.register(target.gvr.clone());
        self.registered.push(Informer::new(self.client.clone(), target, handler, signal));
    }

    /// Number of registered watches.
    pub fn len(&self) -> usize {
        self.barrier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barrier.is_empty()
    }

    /// Spawn every registered informer. Each stops when `cancel` fires.
    pub fn start(&mut self, cancel: &CancellationToken) {
        let informers = std::mem::take(&mut self.registered);
        info!(count = informers.len(), "starting watches");
        for informer in informers {
            let token = cancel.child_token();
            self.running.push(tokio::spawn(informer.run(token)));
        }
    }

    /// Wait until every started watch has completed its initial list.
    pub async fn wait_for_cache_sync(&mut self, cancel: &CancellationToken) -> bool {
        self.barrier.wait(cancel).await
    }

    /// Wait for all informer tasks to exit (after cancellation).
    pub async fn join(self) {
        for handle in self.running {
            if let Err(e) = handle.await {
                warn!(error = %e, "informer task failed");
            }
        }
    }
}
