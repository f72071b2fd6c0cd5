//! `ProgressSink` adapters.

use deployer_common::{ProgressEvent, ProgressStatus};
use tokio::sync::broadcast;

use crate::application::ports::ProgressSink;

/// One published event and the topic it was published on.
#[derive(Debug, Clone)]
pub struct TopicEvent {
    pub topic: String,
    pub event: ProgressEvent,
}

/// Fan-out to any number of subscribers. Slow subscribers lose the oldest
/// events rather than blocking publishers.
pub struct BroadcastSink {
    tx: broadcast::Sender<TopicEvent>,
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TopicEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn emit(&self, topic: &str, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(TopicEvent {
            topic: topic.to_string(),
            event,
        });
    }
}

/// Writes every event to the tracing log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, topic: &str, event: ProgressEvent) {
        match event.status {
            ProgressStatus::Failed => tracing::warn!(
                topic,
                step = %event.step,
                percent = event.progress_percent,
                detail = event.detail.as_deref().unwrap_or(""),
                "{}",
                event.message
            ),
            _ => tracing::info!(
                topic,
                step = %event.step,
                percent = event.progress_percent,
                "{}",
                event.message
            ),
        }
    }
}

/// Delivers each event to every inner sink.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }
}

impl ProgressSink for FanoutSink {
    fn emit(&self, topic: &str, event: ProgressEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(topic, event.clone());
            }
            last.emit(topic, event);
        }
    }
}
