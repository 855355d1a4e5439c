use taskgate_domain::{ProgressEvent, ProgressPhase};
use tokio::sync::mpsc;

/// Receives task transitions in the order the run loop observes them.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, event: ProgressEvent) {
        match event.phase {
            ProgressPhase::TaskStart | ProgressPhase::TaskEnd => {
                tracing::info!(task_id = %event.task_id, "{}", event.content);
            }
            ProgressPhase::TaskError => tracing::warn!(
                task_id = %event.task_id,
                error = event.error.as_deref().unwrap_or_default(),
                "{}",
                event.content
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.sender.send(event);
    }
}
