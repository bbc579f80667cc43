use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backend::{EngineEvent, RetryHandle, RetryScheduler};

/// Runs each retry as a sleeping tokio task that races its cancellation
/// token. Must be used from inside the runtime.
pub struct TokioRetryScheduler {
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl TokioRetryScheduler {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { events }
    }
}

impl RetryScheduler for TokioRetryScheduler {
    fn schedule(&self, delay: Duration, event: EngineEvent) -> RetryHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // receiver gone means we are shutting down
                    let _ = events.send(event);
                }
            }
        });
        RetryHandle::new(token)
    }
}
