//! Cluster lifecycle events.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use hive_core::WorkerId;
use hive_ipc::ListenAddress;

/// Everything the supervisor (or a worker agent) reports to user code.
///
/// Worker-scoped events carry the worker id; subscribers interested in one
/// worker filter on it.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// Settings were installed by the first `setup` call
    Setup,
    /// A worker record was created and its process spawned
    Fork { id: WorkerId },
    /// The worker reported in over its channel
    Online { id: WorkerId },
    /// A shared listener is accepting in the worker
    Listening { id: WorkerId, address: ListenAddress },
    /// A non-internal message arrived from the worker
    Message { id: WorkerId, payload: Value },
    /// Something went wrong on this worker's record
    Error { id: WorkerId, message: String },
    /// The worker's IPC channel is gone
    Disconnect { id: WorkerId },
    /// The worker process exited
    Exit {
        id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
        /// True iff the exit was initiated via `disconnect` or `destroy`
        suicide: bool,
    },
}

const EVENT_CAPACITY: usize = 256;

/// Broadcast fan-out for [`ClusterEvent`]s.
///
/// Emission never blocks; with no subscribers events are simply dropped,
/// and a subscriber that falls behind loses the oldest events (tokio
/// broadcast semantics).
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClusterEvent) {
        trace!(?event, "cluster event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_emit() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(ClusterEvent::Fork { id: 1 });
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::Fork { id: 1 }
        ));
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.emit(ClusterEvent::Setup);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_every_event() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.emit(ClusterEvent::Online { id: 2 });
        assert!(matches!(a.recv().await.unwrap(), ClusterEvent::Online { id: 2 }));
        assert!(matches!(b.recv().await.unwrap(), ClusterEvent::Online { id: 2 }));
    }
}
