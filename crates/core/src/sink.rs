//! Event sink seam. Implementations live in `kwatch-persist`.

use std::sync::Arc;

use crate::event::NormalizedEvent;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("write failed: {0}")]
    Write(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Receives normalized events. Called concurrently from every watch task.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Short name used in logs and metric labels.
    fn name(&self) -> &'static str;

    async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError>;
}

#[async_trait::async_trait]
impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn record(&self, event: &NormalizedEvent) -> Result<(), SinkError> {
        (**self).record(event).await
    }
}
