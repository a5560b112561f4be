//! Progress reporting.
//!
//! A [`ProgressSink`] receives `{processed, total, stage}` updates
//! non-blockingly: if a sink cannot keep up, intermediate updates are
//! dropped, but a final update is always delivered. Within one store
//! invocation `processed` is non-decreasing and never exceeds `total`.
//! Progress updates never carry errors; those travel in return values.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Pipeline stage a progress update belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    ToDocuments,
    ChunkDocuments,
    ExtractFacts,
    Consolidate,
    StoreEntries,
    Query,
}

impl PipelineStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::ToDocuments => "to_documents",
            PipelineStage::ChunkDocuments => "chunk_documents",
            PipelineStage::ExtractFacts => "extract_facts",
            PipelineStage::Consolidate => "consolidate",
            PipelineStage::StoreEntries => "store_entries",
            PipelineStage::Query => "query",
        }
    }
}

/// One progress update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
    pub stage: PipelineStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    #[must_use]
    pub fn new(stage: PipelineStage, processed: u64, total: u64) -> Self {
        Self {
            processed,
            total,
            stage,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Consumer of progress updates.
///
/// `publish` must not block; `publish_final` may wait briefly so the last
/// update of an invocation is not lost.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, progress: Progress);

    fn publish_final(&self, progress: Progress) {
        self.publish(progress);
    }
}

/// Discards every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn publish(&self, _progress: Progress) {}
}

/// Logs updates through `tracing` at info level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn publish(&self, progress: Progress) {
        info!(
            stage = progress.stage.as_str(),
            processed = progress.processed,
            total = progress.total,
            message = progress.message.as_deref().unwrap_or_default(),
            "progress"
        );
    }
}

/// Forwards updates over a bounded flume channel.
///
/// `publish` uses `try_send` and silently drops when the channel is full;
/// `publish_final` waits up to 100 ms so the terminal update survives a
/// slow consumer.
pub struct ChannelProgress {
    tx: flume::Sender<Progress>,
}

impl ChannelProgress {
    /// Create the sink plus the receiving half.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<Progress>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn publish(&self, progress: Progress) {
        let _ = self.tx.try_send(progress);
    }

    fn publish_final(&self, progress: Progress) {
        let _ = self.tx.send_timeout(progress, Duration::from_millis(100));
    }
}

/// Captures every update for inspection; the test-facing sink.
#[derive(Clone, Default)]
pub struct CollectingProgress {
    entries: Arc<Mutex<Vec<Progress>>>,
}

impl CollectingProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Progress> {
        self.entries.lock().clone()
    }
}

impl ProgressSink for CollectingProgress {
    fn publish(&self, progress: Progress) {
        self.entries.lock().push(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_drops_when_full_but_final_survives() {
        let (sink, rx) = ChannelProgress::bounded(1);
        sink.publish(Progress::new(PipelineStage::StoreEntries, 1, 10));
        sink.publish(Progress::new(PipelineStage::StoreEntries, 2, 10));
        sink.publish(Progress::new(PipelineStage::StoreEntries, 3, 10));
        // Only the first fit; the rest were dropped without blocking.
        assert_eq!(rx.drain().count(), 1);
        sink.publish_final(Progress::new(PipelineStage::StoreEntries, 10, 10));
        let last = rx.recv().unwrap();
        assert_eq!(last.processed, 10);
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingProgress::new();
        for n in 0..5 {
            sink.publish(Progress::new(PipelineStage::Consolidate, n, 5));
        }
        let seen = sink.snapshot();
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0].processed <= w[1].processed));
    }

    #[test]
    fn stage_names_match_artifact_steps() {
        assert_eq!(PipelineStage::ToDocuments.as_str(), "to_documents");
        assert_eq!(PipelineStage::ChunkDocuments.as_str(), "chunk_documents");
        assert_eq!(PipelineStage::ExtractFacts.as_str(), "extract_facts");
    }
}
