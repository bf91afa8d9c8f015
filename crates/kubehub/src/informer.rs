//! Informer: a kube watcher stream plus a local cache that turns
//! applied/deleted/restarted into ADDED/UPDATED/DELETED.

use futures::{Stream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use kwatch_core::{GroupVersionResource, WatchTarget};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::SyncSignal;
use crate::handler::EventHandler;

/// `(namespace, name)`; namespace is empty for cluster-scoped objects.
type ObjectKey = (String, String);

/// Carries a full copy of the object spec on `kubectl apply`d resources.
const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, Clone)]
pub enum Change {
    Added(ObjectMeta),
    Updated { old: ObjectMeta, new: ObjectMeta },
    Deleted(ObjectMeta),
}

/// Keep only what the handler reads. Payloads (Secret data included),
/// managed fields and the last-applied annotation are dropped.
fn slim(obj: DynamicObject) -> ObjectMeta {
    let mut meta = obj.metadata;
    meta.managed_fields = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED);
    }
    meta
}

fn key_of(meta: &ObjectMeta) -> Option<ObjectKey> {
    let name = meta.name.clone().filter(|n| !n.is_empty())?;
    Some((meta.namespace.clone().unwrap_or_default(), name))
}

fn same_revision(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    match (&a.resource_version, &b.resource_version) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Last known metadata of every object of one watch target.
#[derive(Debug, Default)]
pub struct InformerCache {
    objects: FxHashMap<ObjectKey, ObjectMeta>,
    synced: bool,
}

impl InformerCache {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&ObjectMeta> {
        self.objects.get(&(namespace.to_string(), name.to_string()))
    }

    /// True once the first full listing has been applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Fold one watcher event into the cache and return the resulting changes.
    ///
    /// Objects without a name are passed through uncached so the handler can
    /// drop them.
    pub fn apply(&mut self, event: Event<DynamicObject>) -> Vec<Change> {
        match event {
            Event::Applied(obj) => self.applied(slim(obj)).into_iter().collect(),
            Event::Deleted(obj) => {
                let meta = slim(obj);
                if let Some(key) = key_of(&meta) {
                    self.objects.remove(&key);
                }
                vec![Change::Deleted(meta)]
            }
            Event::Restarted(list) => self.restarted(list.into_iter().map(slim)),
        }
    }

    fn applied(&mut self, meta: ObjectMeta) -> Option<Change> {
        let Some(key) = key_of(&meta) else {
            return Some(Change::Added(meta));
        };
        match self.objects.get(&key) {
            None => {
                self.objects.insert(key, meta.clone());
                Some(Change::Added(meta))
            }
            Some(prev) if same_revision(prev, &meta) => None,
            Some(_) => {
                let old = self.objects.insert(key, meta.clone())?;
                Some(Change::Updated { old, new: meta })
            }
        }
    }

    fn restarted(&mut self, list: impl Iterator<Item = ObjectMeta>) -> Vec<Change> {
        let mut previous = std::mem::take(&mut self.objects);
        let mut changes = Vec::new();
        for meta in list {
            let Some(key) = key_of(&meta) else {
                changes.push(Change::Added(meta));
                continue;
            };
            match previous.remove(&key) {
                None => changes.push(Change::Added(meta.clone())),
                Some(old) if same_revision(&old, &meta) => {}
                Some(old) => changes.push(Change::Updated { old, new: meta.clone() }),
            }
            self.objects.insert(key, meta);
        }
        // whatever was cached but not relisted is gone
        changes.extend(previous.into_values().map(Change::Deleted));
        self.synced = true;
        changes
    }
}

/// Dynamic API resource for a catalog entry.
pub fn api_resource(target: &WatchTarget) -> ApiResource {
    ApiResource {
        group: target.group.clone(),
        version: target.gvr.version.clone(),
        api_version: target.gvr.api_version(),
        kind: target.kind.clone(),
        plural: target.gvr.resource.clone(),
    }
}

/// One list+watch loop for a single target.
pub struct Informer {
    target: WatchTarget,
    api: Api<DynamicObject>,
    handler: EventHandler,
    synced: SyncSignal,
}

impl Informer {
    pub fn new(client: Client, target: WatchTarget, handler: EventHandler, synced: SyncSignal) -> Self {
        let api = Api::all_with(client, &api_resource(&target));
        Self { target, api, handler, synced }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Run until cancelled. Stream errors are retried with backoff.
    pub async fn run(self, cancel: CancellationToken) {
        let stream = watcher::watcher(self.api, watcher::Config::default()).default_backoff();
        drive(&self.target.gvr, stream, &self.handler, &self.synced, cancel).await;
    }
}

/// Feed a watcher event stream through a fresh cache into `handler`, in
/// stream order. `synced` is marked after the first full listing. Returns
/// when `cancel` fires or the stream ends.
pub async fn drive<S>(
    gvr: &GroupVersionResource,
    stream: S,
    handler: &EventHandler,
    synced: &SyncSignal,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    let mut cache = InformerCache::default();
    debug!(gvr = %gvr, "informer started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(gvr = %gvr, "informer cancelled");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        let was_synced = cache.is_synced();
                        for change in cache.apply(event) {
                            dispatch(handler, change).await;
                        }
                        if !was_synced && cache.is_synced() {
                            debug!(gvr = %gvr, objects = cache.len(), "initial list complete");
                            synced.mark_synced();
                        }
                    }
                    Some(Err(e)) => {
                        warn!(gvr = %gvr, error = %e, "watch stream error; retrying");
                    }
                    None => {
                        warn!(gvr = %gvr, "watch stream ended");
                        break;
                    }
                }
            }
        }
    }
    info!(gvr = %gvr, "informer stopped");
}

async fn dispatch(handler: &EventHandler, change: Change) {
    match change {
        Change::Added(meta) => {
            handler.on_added(&meta).await;
        }
        Change::Updated { old, new } => {
            handler.on_updated(&old, &new).await;
        }
        Change::Deleted(meta) => {
            handler.on_deleted(&meta).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;
    use kwatch_core::{EventKind, EventSink, NormalizedEvent, SinkError, TargetIdentity};

    use crate::driver::SyncBarrier;

    fn obj(ns: Option<&str>, name: &str, rv: &str) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: ns.map(|s| s.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            data: serde_json::json!({}),
        }
    }

    fn label(c: &Change) -> String {
        match c {
            Change::Added(m) => format!("+{}", m.name.as_deref().unwrap_or("")),
            Change::Updated { new, .. } => format!("~{}", new.name.as_deref().unwrap_or("")),
            Change::Deleted(m) => format!("-{}", m.name.as_deref().unwrap_or("")),
        }
    }

    fn labels(changes: &[Change]) -> Vec<String> {
        let mut out: Vec<_> = changes.iter().map(label).collect();
        out.sort();
        out
    }

    #[test]
    fn initial_list_adds_and_syncs() {
        let mut cache = InformerCache::default();
        assert!(!cache.is_synced());
        let changes = cache.apply(Event::Restarted(vec![obj(Some("a"), "x", "1"), obj(None, "y", "1")]));
        assert_eq!(labels(&changes), vec!["+x", "+y"]);
        assert!(cache.is_synced());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn applied_distinguishes_add_update_and_duplicate() {
        let mut cache = InformerCache::default();
        cache.apply(Event::Restarted(vec![]));
        assert_eq!(labels(&cache.apply(Event::Applied(obj(Some("a"), "x", "1")))), vec!["+x"]);
        assert_eq!(labels(&cache.apply(Event::Applied(obj(Some("a"), "x", "2")))), vec!["~x"]);
        assert!(cache.apply(Event::Applied(obj(Some("a"), "x", "2"))).is_empty());
        // same name, other namespace is a different object
        assert_eq!(labels(&cache.apply(Event::Applied(obj(Some("b"), "x", "1")))), vec!["+x"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn update_carries_old_state() {
        let mut cache = InformerCache::default();
        cache.apply(Event::Applied(obj(Some("a"), "x", "1")));
        let changes = cache.apply(Event::Applied(obj(Some("a"), "x", "7")));
        match &changes[..] {
            [Change::Updated { old, new }] => {
                assert_eq!(old.resource_version.as_deref(), Some("1"));
                assert_eq!(new.resource_version.as_deref(), Some("7"));
            }
            other => panic!("unexpected changes: {:?}", other),
        }
    }

    #[test]
    fn deleted_removes_from_cache() {
        let mut cache = InformerCache::default();
        cache.apply(Event::Applied(obj(Some("a"), "x", "1")));
        assert_eq!(labels(&cache.apply(Event::Deleted(obj(Some("a"), "x", "2")))), vec!["-x"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn relist_diffs_against_cache() {
        let mut cache = InformerCache::default();
        cache.apply(Event::Restarted(vec![obj(Some("a"), "keep", "1"), obj(Some("a"), "bump", "1"), obj(Some("a"), "gone", "1")]));
        let changes = cache.apply(Event::Restarted(vec![
            obj(Some("a"), "keep", "1"),
            obj(Some("a"), "bump", "2"),
            obj(Some("a"), "new", "1"),
        ]));
        assert_eq!(labels(&changes), vec!["+new", "-gone", "~bump"]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn nameless_objects_pass_through_uncached() {
        let mut cache = InformerCache::default();
        let mut anon = obj(Some("a"), "", "1");
        anon.metadata.name = None;
        let changes = cache.apply(Event::Applied(anon));
        assert_eq!(changes.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn api_resource_for_core_and_named_groups() {
        let target = WatchTarget {
            gvr: kwatch_core::GroupVersionResource::new("", "v1", "pods"),
            group: String::new(),
            kind: "Pod".into(),
            namespaced: true,
        };
        let ar = api_resource(&target);
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "pods");

        let target = WatchTarget {
            gvr: kwatch_core::GroupVersionResource::new("apps", "v1", "deployments"),
            group: "apps".into(),
            kind: "Deployment".into(),
            namespaced: true,
        };
        assert_eq!(api_resource(&target).api_version, "apps/v1");
    }

    #[test]
    fn cache_keeps_metadata_only() {
        let mut secret = obj(Some("a"), "token", "1");
        secret.data = serde_json::json!({ "data": { "password": "aHVudGVyMg==" } });
        secret.metadata.managed_fields = Some(vec![ManagedFieldsEntry { manager: Some("kubectl".into()), ..Default::default() }]);
        secret.metadata.annotations = Some(
            [
                (LAST_APPLIED.to_string(), r#"{"data":{"password":"aHVudGVyMg=="}}"#.to_string()),
                ("team".to_string(), "infra".to_string()),
            ]
            .into_iter()
            .collect(),
        );

        let mut cache = InformerCache::default();
        let changes = cache.apply(Event::Restarted(vec![secret]));
        let cached = cache.get("a", "token").expect("cached");
        assert!(cached.managed_fields.is_none());
        let annotations = cached.annotations.as_ref().expect("annotations");
        assert!(!annotations.contains_key(LAST_APPLIED));
        assert_eq!(annotations.get("team").map(String::as_str), Some("infra"));
        match &changes[..] {
            [Change::Added(meta)] => assert!(meta.managed_fields.is_none()),
            other => panic!("unexpected changes: {:?}", other),
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<NormalizedEvent>>,
    }

    impl Recording {
        fn kinds(&self) -> Vec<EventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait::async_trait]
    impl EventSink for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    type Item = Result<Event<DynamicObject>, watcher::Error>;

    async fn until(sink: &Recording, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sink.events.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sink never caught up");
    }

    #[tokio::test]
    async fn drive_syncs_on_first_list_and_stops_on_cancel() {
        let gvr = GroupVersionResource::new("", "v1", "configmaps");
        let sink = Arc::new(Recording::default());
        let handler = EventHandler::new(TargetIdentity { resource: "configmaps".into(), group: String::new() }, sink.clone());
        let mut barrier = SyncBarrier::new();
        let signal = barrier.register(gvr.clone());
        let cancel = CancellationToken::new();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Item>();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { drive(&gvr, rx, &handler, &signal, cancel).await }
        });

        // nothing listed yet
        assert!(tokio::time::timeout(Duration::from_millis(30), barrier.wait(&cancel)).await.is_err());

        tx.unbounded_send(Ok(Event::Restarted(vec![obj(Some("ns"), "cfg", "1")]))).unwrap();
        let released = tokio::time::timeout(Duration::from_secs(2), barrier.wait(&cancel)).await;
        assert_eq!(released.ok(), Some(true));
        until(&sink, 1).await;
        assert_eq!(sink.kinds(), vec![EventKind::Added]);

        tx.unbounded_send(Err(watcher::Error::NoResourceVersion)).unwrap();
        tx.unbounded_send(Ok(Event::Applied(obj(Some("ns"), "cfg", "2")))).unwrap();
        tx.unbounded_send(Ok(Event::Deleted(obj(Some("ns"), "cfg", "2")))).unwrap();
        until(&sink, 3).await;
        assert_eq!(sink.kinds(), vec![EventKind::Added, EventKind::Updated, EventKind::Deleted]);
        assert!(sink.events.lock().unwrap().iter().all(|e| e.name == "cfg" && e.namespace == "ns"));

        // sender still open: only the token can end the loop
        cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(joined, Ok(Ok(()))));
        drop(tx);
    }

    #[tokio::test]
    async fn drive_returns_when_stream_ends() {
        let gvr = GroupVersionResource::new("apps", "v1", "deployments");
        let sink = Arc::new(Recording::default());
        let handler = EventHandler::new(TargetIdentity { resource: "deployments".into(), group: "apps".into() }, sink.clone());
        let mut barrier = SyncBarrier::new();
        let signal = barrier.register(gvr.clone());
        let events: Vec<Item> = vec![
            Ok(Event::Applied(obj(Some("ns"), "web", "1"))),
            Ok(Event::Restarted(vec![obj(Some("ns"), "web", "1")])),
        ];

        let done = tokio::time::timeout(
            Duration::from_secs(2),
            drive(&gvr, futures::stream::iter(events), &handler, &signal, CancellationToken::new()),
        )
        .await;
        assert!(done.is_ok());
        // the relist matched the cached revision, so only the first ADDED went out
        assert_eq!(sink.kinds(), vec![EventKind::Added]);
        drop(signal);
        assert!(barrier.wait(&CancellationToken::new()).await);
    }
}
