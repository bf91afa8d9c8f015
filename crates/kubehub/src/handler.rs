//! Per-target event handler: normalize, count, hand to the sink.

use std::sync::Arc;

use kwatch_core::{normalize, EventKind, EventSink, HasMetadata, TargetIdentity};
use metrics::counter;
use tracing::{debug, warn};

/// Callback triple bound to one watch target.
///
/// Each handler owns its own [`TargetIdentity`]; cloning is cheap apart from
/// the two identity strings.
#[derive(Clone)]
pub struct EventHandler {
    identity: TargetIdentity,
    sink: Arc<dyn EventSink>,
}

impl EventHandler {
    pub fn new(identity: TargetIdentity, sink: Arc<dyn EventSink>) -> Self {
        Self { identity, sink }
    }

    pub fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    pub async fn on_added<O: HasMetadata + ?Sized + Sync>(&self, obj: &O) -> bool {
        self.dispatch(EventKind::Added, obj).await
    }

    /// Only `new` is read. `old` is accepted so a field-level delta can be added later.
    pub async fn on_updated<O: HasMetadata + ?Sized + Sync>(&self, _old: &O, new: &O) -> bool {
        self.dispatch(EventKind::Updated, new).await
    }

    pub async fn on_deleted<O: HasMetadata + ?Sized + Sync>(&self, obj: &O) -> bool {
        self.dispatch(EventKind::Deleted, obj).await
    }

    /// Returns whether an event was emitted. Sink failures still count as emitted.
    async fn dispatch<O: HasMetadata + ?Sized + Sync>(&self, kind: EventKind, obj: &O) -> bool {
        let Some(event) = normalize(kind, &self.identity, obj) else {
            debug!(
                resource = %self.identity.resource,
                group = %self.identity.group,
                event_type = %kind,
                "object has no metadata; dropping event"
            );
            counter!("k8s_dropped_objects_total", 1, "resource" => self.identity.resource.clone());
            return false;
        };

        counter!(
            "k8s_resource_events_total", 1,
            "event_type" => kind.as_str(),
            "group" => event.resource_group.clone(),
            "resource" => event.resource_type.clone()
        );
        counter!(
            "k8s_watch_events_total", 1,
            "resource" => event.resource_type.clone(),
            "namespace" => event.namespace.clone(),
            "event_type" => kind.as_str()
        );

        if let Err(e) = self.sink.record(&event).await {
            counter!("k8s_event_sink_errors_total", 1, "sink" => self.sink.name());
            warn!(
                sink = self.sink.name(),
                event_type = %kind,
                resource = %event.resource_type,
                namespace = %event.namespace,
                name = %event.name,
                error = %e,
                "failed to record event"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwatch_core::{NormalizedEvent, SinkError};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<NormalizedEvent>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl EventSink for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(SinkError::Write("disk full".into()));
            }
            Ok(())
        }
    }

    fn handler(sink: Arc<Recording>) -> EventHandler {
        EventHandler::new(TargetIdentity { resource: "configmaps".into(), group: String::new() }, sink)
    }

    #[tokio::test]
    async fn lifecycle_reaches_sink_in_order() {
        let sink = Arc::new(Recording::default());
        let h = handler(sink.clone());
        let v1 = json!({ "metadata": { "name": "cfg", "namespace": "ns", "resourceVersion": "1" } });
        let v2 = json!({ "metadata": { "name": "cfg", "namespace": "ns", "resourceVersion": "2" } });

        assert!(h.on_added(&v1).await);
        assert!(h.on_updated(&v1, &v2).await);
        assert!(h.on_deleted(&v2).await);

        let events = sink.events.lock().unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Added, EventKind::Updated, EventKind::Deleted]);
        assert!(events.iter().all(|e| e.name == "cfg" && e.namespace == "ns" && e.resource_type == "configmaps"));
    }

    #[tokio::test]
    async fn no_metadata_means_no_sink_call() {
        let sink = Arc::new(Recording::default());
        let h = handler(sink.clone());
        assert!(!h.on_added(&json!({ "data": {} })).await);
        assert!(!h.on_deleted(&json!(42)).await);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sink_failure_is_contained() {
        let sink = Arc::new(Recording { fail: true, ..Default::default() });
        let h = handler(sink.clone());
        let obj = json!({ "metadata": { "name": "a" } });
        assert!(h.on_added(&obj).await);
        assert!(h.on_added(&obj).await);
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }
}
