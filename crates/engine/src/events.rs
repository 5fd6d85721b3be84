//! In-process progress event bus.
//!
//! One topic over a bounded broadcast channel. Delivery is best-effort and
//! in-order per problem; a subscriber that falls more than the backlog
//! behind is dropped and its sink is told to reconnect.

use async_trait::async_trait;
use ojforge_models::ProgressEvent;
use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_BACKLOG: usize = 100;

/// Push sink the transport layer supplies.
#[async_trait]
pub trait PushSink: Send + Sync {
    /// Deliver one event. Returning false detaches the forwarder.
    async fn push(&self, event: ProgressEvent) -> bool;
    /// Called when the subscriber lagged past the backlog and was dropped.
    async fn lagged(&self, missed: u64);
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BACKLOG)
    }
}

impl EventBus {
    pub fn new(backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog);
        Self { tx }
    }

    /// Publish one event. Publishing never blocks; with no subscribers the
    /// event is dropped.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Forward events into a transport-supplied sink until it detaches or
    /// lags out. Spawn this on its own task.
    pub async fn forward_to(&self, sink: std::sync::Arc<dyn PushSink>) {
        let mut rx = self.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !sink.push(event).await {
                        debug!("push sink detached");
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    sink.lagged(missed).await;
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}
