//! Master-side worker records.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use hive_core::{types, HiveError, Result, Timestamp, WorkerId, WorkerState};
use hive_ipc::{encode, encode_user, Channel, Envelope, InternalCmd};

use crate::events::{ClusterEvent, EventHub};

/// Handle to one live worker, as seen from the supervisor.
///
/// Cheap to clone; every clone refers to the same record. The supervisor's
/// workers map holds one clone per live worker and drops it from
/// `prepare_exit`, so user-held clones outliving the worker only pin the
/// record, never the process.
#[derive(Debug, Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

#[derive(Debug)]
struct WorkerShared {
    id: WorkerId,
    spawned_at: Timestamp,
    channel: Arc<Channel>,
    state: watch::Sender<WorkerState>,
    /// None until an intentional teardown or an exit coerces it
    suicide: Mutex<Option<bool>>,
    /// 0 until the child reports a pid
    pid: AtomicU32,
    events: EventHub,
}

impl Worker {
    pub(crate) fn new(id: WorkerId, channel: Arc<Channel>, events: EventHub) -> Self {
        let (state, _) = watch::channel(WorkerState::None);
        Self {
            shared: Arc::new(WorkerShared {
                id,
                spawned_at: types::now(),
                channel,
                state,
                suicide: Mutex::new(None),
                pid: AtomicU32::new(0),
                events,
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn spawned_at(&self) -> Timestamp {
        self.shared.spawned_at
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions. The receiver starts at the current state.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    /// The suicide flag: `Some(true)` after an intentional `disconnect` or
    /// `destroy`, `Some(false)` once an accidental exit coerced it, `None`
    /// while the worker is alive and untouched.
    pub fn suicide(&self) -> Option<bool> {
        *self.shared.suicide.lock().expect("suicide lock poisoned")
    }

    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Send a user message to the worker.
    pub async fn send(&self, msg: &Value) -> Result<()> {
        self.shared.channel.send(&encode_user(msg)?, None).await
    }

    /// Send a user message with an attached OS handle.
    pub async fn send_with_handle(&self, msg: &Value, handle: BorrowedFd<'_>) -> Result<()> {
        self.shared.channel.send(&encode_user(msg)?, Some(handle)).await
    }

    /// Ask the worker to shut down gracefully.
    ///
    /// Marks the exit as intentional and tells the worker to run its
    /// disconnect procedure; the worker closes its listeners, then its
    /// channel, which lands here as the `Disconnect` event.
    pub async fn disconnect(&self) -> Result<()> {
        self.set_suicide(true);
        self.send_internal(&Envelope::new(InternalCmd::Disconnect), None)
            .await
    }

    /// Terminate the worker.
    ///
    /// Marks the exit as intentional; if the channel is still up it is
    /// closed first and the kill signal follows the disconnect transition,
    /// otherwise the signal goes out immediately.
    pub async fn destroy(&self) {
        self.set_suicide(true);
        if self.shared.channel.is_connected() {
            let mut rx = self.shared.state.subscribe();
            self.shared.channel.close();
            let _ = rx.wait_for(|state| !state.is_connected()).await;
        }
        self.kill();
    }

    // =========================================================================
    // Crate-internal record plumbing
    // =========================================================================

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.shared.channel
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.shared.pid.store(pid, Ordering::SeqCst);
    }

    pub(crate) fn set_suicide(&self, value: bool) {
        *self.shared.suicide.lock().expect("suicide lock poisoned") = Some(value);
    }

    /// Advance the state machine; illegal transitions are ignored.
    /// Returns true when the state actually changed.
    pub(crate) fn set_state(&self, next: WorkerState) -> bool {
        let mut changed = false;
        self.shared.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                debug!(worker_id = self.shared.id, from = %state, to = %next, "worker state");
                *state = next;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    /// Terminal bookkeeping shared by the disconnect and exit paths: set
    /// the state and coerce an unset suicide flag to false. Safe to call
    /// twice; the second call reports no change.
    pub(crate) fn prepare_exit(&self, state: WorkerState) -> bool {
        let changed = self.set_state(state);
        let mut suicide = self.shared.suicide.lock().expect("suicide lock poisoned");
        if suicide.is_none() {
            *suicide = Some(false);
        }
        changed
    }

    pub(crate) async fn send_internal(
        &self,
        envelope: &Envelope,
        handle: Option<BorrowedFd<'_>>,
    ) -> Result<()> {
        if !self.shared.channel.is_connected() {
            return Err(HiveError::ChannelClosed);
        }
        self.shared.channel.send(&encode(envelope)?, handle).await
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        self.shared.events.emit(event);
    }

    /// Deliver the configured kill signal to the child, if we know its pid.
    pub(crate) fn kill(&self) {
        if let Some(pid) = self.pid() {
            debug!(worker_id = self.shared.id, pid, "signalling worker");
            // SAFETY: plain syscall; a stale pid at worst signals a reaped
            // child, which the kernel rejects with ESRCH.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker() -> (Worker, Channel) {
        let (local, peer) = Channel::pair().unwrap();
        (
            Worker::new(1, Arc::new(local), EventHub::new()),
            peer,
        )
    }

    #[tokio::test]
    async fn test_initial_record() {
        let (worker, _peer) = test_worker();
        assert_eq!(worker.id(), 1);
        assert_eq!(worker.state(), WorkerState::None);
        assert_eq!(worker.suicide(), None);
        assert_eq!(worker.pid(), None);
    }

    #[tokio::test]
    async fn test_state_transitions_enforced() {
        let (worker, _peer) = test_worker();
        assert!(worker.set_state(WorkerState::Online));
        assert!(worker.set_state(WorkerState::Listening));
        // Going backwards is ignored.
        assert!(!worker.set_state(WorkerState::Online));
        assert_eq!(worker.state(), WorkerState::Listening);
    }

    #[tokio::test]
    async fn test_prepare_exit_coerces_suicide_and_is_idempotent() {
        let (worker, _peer) = test_worker();
        assert!(worker.prepare_exit(WorkerState::Disconnected));
        assert_eq!(worker.suicide(), Some(false));
        // Second call: no state change, flag untouched.
        assert!(!worker.prepare_exit(WorkerState::Disconnected));
        assert!(worker.prepare_exit(WorkerState::Dead));
    }

    #[tokio::test]
    async fn test_prepare_exit_preserves_intentional_flag() {
        let (worker, _peer) = test_worker();
        worker.set_suicide(true);
        worker.prepare_exit(WorkerState::Disconnected);
        assert_eq!(worker.suicide(), Some(true));
    }

    #[tokio::test]
    async fn test_disconnect_sets_flag_and_sends_command() {
        let (worker, peer) = test_worker();
        worker.disconnect().await.unwrap();
        assert_eq!(worker.suicide(), Some(true));

        let frame = peer.recv().await.unwrap().unwrap();
        match hive_ipc::decode(&frame.payload).unwrap() {
            hive_ipc::Inbound::Internal(envelope) => {
                assert_eq!(envelope.internal_cmd(), Some(InternalCmd::Disconnect));
                assert!(envelope.request_echo.is_none());
            }
            hive_ipc::Inbound::User(_) => panic!("expected internal message"),
        }
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (worker, peer) = test_worker();
        peer.close();
        worker.channel().close();
        let err = worker
            .send(&serde_json::json!({"hello": 1}))
            .await
            .unwrap_err();
        assert!(err.is_channel_error());
    }
}
