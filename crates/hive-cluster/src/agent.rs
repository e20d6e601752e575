//! The worker role.
//!
//! An [`Agent`] is a worker process's view of the cluster: it reports in
//! over the inherited channel, asks the master for shared listeners instead
//! of binding its own, and runs the graceful-disconnect procedure when the
//! master (or user code) asks for it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use hive_core::{HiveError, Result, Role, WorkerId, WorkerState};
use hive_ipc::{
    decode, encode, encode_user, Channel, Envelope, Frame, Inbound, InternalCmd, ListenSpec,
    PendingQueries, QueryReply,
};

use crate::events::{ClusterEvent, EventHub};
use crate::{NODE_CHANNEL_FD, NODE_UNIQUE_ID};

/// The worker-side self record.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    /// Parsed from the environment; `None` when the marker was malformed,
    /// which is observable but not fatal
    id: Option<WorkerId>,
    channel: Arc<Channel>,
    queries: PendingQueries,
    listeners: Mutex<HashMap<String, SharedServer>>,
    state: watch::Sender<WorkerState>,
    suicide: StdMutex<Option<bool>>,
    /// The accidental-exit guard: exit 0 when the channel dies without the
    /// suicide flag set. On by default; embedders that want to outlive the
    /// supervisor can turn it off.
    exit_on_disconnect: AtomicBool,
    events: EventHub,
}

impl Agent {
    /// Bootstrap the worker role from the inherited environment: the id
    /// from `NODE_UNIQUE_ID` and the channel from `NODE_CHANNEL_FD`.
    pub fn from_env() -> Result<Self> {
        let id = std::env::var(NODE_UNIQUE_ID)
            .ok()
            .and_then(|v| v.trim().parse::<WorkerId>().ok());

        let fd_var = std::env::var(NODE_CHANNEL_FD).map_err(|_| HiveError::InvalidEnv {
            var: NODE_CHANNEL_FD,
            value: String::new(),
        })?;
        let raw: RawFd = fd_var.trim().parse().map_err(|_| HiveError::InvalidEnv {
            var: NODE_CHANNEL_FD,
            value: fd_var.clone(),
        })?;
        // SAFETY: the supervisor placed this descriptor for us and nothing
        // else in this process claims it.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self::new(id, Channel::from_fd(fd)?))
    }

    /// Wire an agent to an explicit channel. Must be called from within a
    /// tokio runtime; `from_env` is the normal entry point.
    pub fn new(id: Option<WorkerId>, channel: Channel) -> Self {
        info!(pid = std::process::id(), role = %Role::Worker, worker_id = id, "agent created");
        let (state, _) = watch::channel(WorkerState::None);
        let agent = Self {
            inner: Arc::new(AgentInner {
                id,
                channel: Arc::new(channel),
                queries: PendingQueries::new(id.unwrap_or(0)),
                listeners: Mutex::new(HashMap::new()),
                state,
                suicide: StdMutex::new(None),
                exit_on_disconnect: AtomicBool::new(true),
                events: EventHub::new(),
            }),
        };
        agent.spawn_reader();
        agent.spawn_online_report();
        agent
    }

    /// The id assigned by the supervisor; `None` if the marker was mangled.
    pub fn id(&self) -> Option<WorkerId> {
        self.inner.id
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn suicide(&self) -> Option<bool> {
        *self.inner.suicide.lock().expect("suicide lock poisoned")
    }

    /// Subscribe to this worker's lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Control the accidental-exit guard (on by default).
    pub fn set_exit_on_disconnect(&self, enabled: bool) {
        self.inner.exit_on_disconnect.store(enabled, Ordering::SeqCst);
    }

    /// Send a user message to the supervisor.
    pub async fn send(&self, msg: &Value) -> Result<()> {
        self.inner.channel.send(&encode_user(msg)?, None).await
    }

    /// Send a user message with an attached OS handle.
    pub async fn send_with_handle(&self, msg: &Value, handle: BorrowedFd<'_>) -> Result<()> {
        self.inner.channel.send(&encode_user(msg)?, Some(handle)).await
    }

    /// Listen on a shared socket.
    ///
    /// Instead of binding locally, this asks the supervisor for the
    /// listener keyed by the fingerprint of `spec`; every worker using the
    /// same fingerprint accepts on the same kernel socket, and the OS
    /// spreads connections between them. The supervisor binds on the first
    /// request and replays the socket for the rest.
    pub async fn listen(&self, spec: ListenSpec) -> Result<SharedServer> {
        let key = spec.fingerprint();
        debug!(%key, "requesting shared listener");

        let (token, rx) = self.inner.queries.register();
        let request = Envelope::new(InternalCmd::QueryServer)
            .with_request_echo(token.clone())
            .with_args(spec);
        self.inner.channel.send(&encode(&request)?, None).await?;

        let reply = rx
            .await
            .map_err(|_| HiveError::QueryDropped { token })?;
        if let Some(message) = reply.error {
            return Err(HiveError::bind(key, message));
        }
        let fd = reply.handle.ok_or_else(|| HiveError::HandleMissing {
            cmd: request.cmd.clone(),
        })?;

        // Adopt the master's socket and start accepting on it.
        let listener = std::net::TcpListener::from(fd);
        listener
            .set_nonblocking(true)
            .map_err(|e| HiveError::io("configuring shared listener", e))?;
        let listener = tokio::net::TcpListener::from_std(listener)
            .map_err(|e| HiveError::io("registering shared listener", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| HiveError::io("reading shared listener address", e))?;

        let server = SharedServer::new(key.clone(), local_addr, listener);
        self.inner
            .listeners
            .lock()
            .await
            .insert(key, server.clone());
        self.set_state(WorkerState::Listening);

        // One-way notification with the address we actually accept on, so
        // a port-0 request reports the real port.
        let note = Envelope::new(InternalCmd::Listening).with_address(local_addr.into());
        self.inner.channel.send(&encode(&note)?, None).await?;
        self.inner.events.emit(ClusterEvent::Listening {
            id: self.worker_id(),
            address: local_addr.into(),
        });
        Ok(server)
    }

    /// Graceful shutdown: announce the intent, close every shared listener,
    /// then close the channel.
    pub async fn disconnect(&self) -> Result<()> {
        self.set_suicide(true);
        let servers: Vec<SharedServer> =
            self.inner.listeners.lock().await.values().cloned().collect();
        info!(listeners = servers.len(), "worker disconnecting");

        // The ack confirms the master recorded the suicide flag before our
        // channel goes away; channel death resolves the wait too.
        let (token, rx) = self.inner.queries.register();
        let announce = Envelope::new(InternalCmd::Suicide).with_request_echo(token);
        if let Ok(bytes) = encode(&announce) {
            if self.inner.channel.send(&bytes, None).await.is_ok() {
                let _ = rx.await;
            }
        }

        let mut remaining = servers.len();
        for server in servers {
            if !server.is_closed() {
                server.close();
                server.closed().await;
            }
            remaining -= 1;
            debug!(remaining, "shared listener closed");
        }

        self.inner.channel.close();
        if self.set_state(WorkerState::Disconnected) {
            self.inner.events.emit(ClusterEvent::Disconnect {
                id: self.worker_id(),
            });
        }
        Ok(())
    }

    /// Hard termination of this worker process. Does not return.
    ///
    /// Marks the exit as intentional, tells the master if it is still
    /// reachable, and exits 0 on the ack or on channel death, whichever
    /// comes first.
    pub async fn destroy(&self) {
        self.set_suicide(true);
        if self.inner.channel.is_connected() {
            let (token, rx) = self.inner.queries.register();
            let announce = Envelope::new(InternalCmd::Suicide).with_request_echo(token);
            if let Ok(bytes) = encode(&announce) {
                if self.inner.channel.send(&bytes, None).await.is_ok() {
                    let _ = rx.await;
                }
            }
        }
        std::process::exit(0);
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn worker_id(&self) -> WorkerId {
        self.inner.id.unwrap_or(0)
    }

    fn set_suicide(&self, value: bool) {
        *self.inner.suicide.lock().expect("suicide lock poisoned") = Some(value);
    }

    fn set_state(&self, next: WorkerState) -> bool {
        let mut changed = false;
        self.inner.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    /// True when every recorded shared listener has been closed.
    #[cfg(test)]
    pub(crate) async fn listeners_closed(&self) -> bool {
        self.inner
            .listeners
            .lock()
            .await
            .values()
            .all(SharedServer::is_closed)
    }

    /// Report in. Runs on its own task so construction stays synchronous.
    fn spawn_online_report(&self) {
        let agent = self.clone();
        tokio::spawn(async move {
            let online = Envelope::new(InternalCmd::Online);
            match encode(&online) {
                Ok(bytes) => {
                    if agent.inner.channel.send(&bytes, None).await.is_ok() {
                        agent.set_state(WorkerState::Online);
                        agent.inner.events.emit(ClusterEvent::Online {
                            id: agent.worker_id(),
                        });
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode online report"),
            }
        });
    }

    fn spawn_reader(&self) {
        let agent = self.clone();
        tokio::spawn(async move {
            loop {
                match agent.inner.channel.recv().await {
                    Ok(Some(frame)) => {
                        if let Err(e) = agent.dispatch(frame).await {
                            warn!(error = %e, "dropping bad message");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !e.is_channel_error() {
                            warn!(error = %e, "channel read failed");
                        }
                        break;
                    }
                }
            }
            agent.on_channel_gone();
        });
    }

    /// Worker-side handling of one inbound frame.
    async fn dispatch(&self, frame: Frame) -> Result<()> {
        let Frame { payload, mut handle } = frame;
        let envelope = match decode(&payload)? {
            Inbound::User(value) => {
                self.inner.events.emit(ClusterEvent::Message {
                    id: self.worker_id(),
                    payload: value,
                });
                return Ok(());
            }
            Inbound::Internal(envelope) => envelope,
        };

        if let Some(token) = envelope.query_echo.as_deref() {
            self.inner.queries.resolve(
                token,
                QueryReply {
                    content: envelope.content.clone(),
                    error: envelope.error.clone(),
                    handle: handle.take(),
                },
            );
        }

        match envelope.internal_cmd() {
            Some(InternalCmd::Disconnect) => {
                // Run the procedure off the reader so we keep draining the
                // channel while listeners wind down.
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = agent.disconnect().await {
                        warn!(error = %e, "graceful disconnect failed");
                    }
                });
                self.acknowledge(&envelope).await
            }
            // Everything else is master-side; the empty echo keeps unknown
            // requesters from hanging.
            _ => self.acknowledge(&envelope).await,
        }
    }

    async fn acknowledge(&self, inbound: &Envelope) -> Result<()> {
        if let Some(token) = inbound.request_echo.clone() {
            let reply = inbound.reply(token);
            self.inner.channel.send(&encode(&reply)?, None).await?;
        }
        Ok(())
    }

    /// Channel teardown. The accidental-exit guard lives here: a worker
    /// whose channel died without the suicide flag set has lost its
    /// supervisor and must not linger.
    fn on_channel_gone(&self) {
        self.inner.queries.abandon_all();
        if self.set_state(WorkerState::Disconnected) {
            self.inner.events.emit(ClusterEvent::Disconnect {
                id: self.worker_id(),
            });
        }
        let suicide = matches!(self.suicide(), Some(true));
        if !suicide && self.inner.exit_on_disconnect.load(Ordering::SeqCst) {
            info!("channel to supervisor lost, exiting");
            std::process::exit(0);
        }
    }
}

/// A local server accepting on a listener shared with other workers.
///
/// Clones refer to the same listener. `close` is idempotent and wakes every
/// pending `accept`, which then reports end-of-service with `None`.
#[derive(Clone, Debug)]
pub struct SharedServer {
    inner: Arc<SharedServerInner>,
}

#[derive(Debug)]
struct SharedServerInner {
    key: String,
    local_addr: SocketAddr,
    listener: tokio::net::TcpListener,
    closed: watch::Sender<bool>,
}

impl SharedServer {
    fn new(key: String, local_addr: SocketAddr, listener: tokio::net::TcpListener) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(SharedServerInner {
                key,
                local_addr,
                listener,
                closed,
            }),
        }
    }

    /// Accept the next connection, or `None` once the server is closed.
    pub async fn accept(&self) -> Option<Result<(TcpStream, SocketAddr)>> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        tokio::select! {
            result = self.inner.listener.accept() => {
                Some(result.map_err(|e| HiveError::io("accept", e)))
            }
            _ = closed.wait_for(|c| *c) => None,
        }
    }

    /// The address this server accepts on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The fingerprint this server shares its socket under.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        let _ = self.inner.closed.send(true);
    }

    /// Resolves once the server is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_id_and_initial_state() {
        let (local, _peer) = Channel::pair().unwrap();
        let agent = Agent::new(Some(7), local);
        agent.set_exit_on_disconnect(false);
        assert_eq!(agent.id(), Some(7));
        assert_eq!(agent.suicide(), None);
    }

    #[tokio::test]
    async fn test_agent_reports_online() {
        let (local, peer) = Channel::pair().unwrap();
        let agent = Agent::new(Some(1), local);
        agent.set_exit_on_disconnect(false);

        let frame = peer.recv().await.unwrap().unwrap();
        match decode(&frame.payload).unwrap() {
            Inbound::Internal(envelope) => {
                assert_eq!(envelope.internal_cmd(), Some(InternalCmd::Online));
            }
            Inbound::User(_) => panic!("expected online report"),
        }
    }

    #[tokio::test]
    async fn test_null_id_falls_back_to_zero_in_tokens() {
        let (local, peer) = Channel::pair().unwrap();
        let agent = Agent::new(None, local);
        agent.set_exit_on_disconnect(false);
        assert_eq!(agent.id(), None);

        // The online report and the query race on the channel; scan for the
        // queryServer frame and check its token prefix.
        let listen = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.listen(ListenSpec::new("127.0.0.1", 0)).await })
        };
        loop {
            let frame = peer.recv().await.unwrap().unwrap();
            let Inbound::Internal(envelope) = decode(&frame.payload).unwrap() else {
                panic!("expected internal traffic");
            };
            if envelope.internal_cmd() == Some(InternalCmd::QueryServer) {
                assert!(envelope.request_echo.unwrap().starts_with("0:"));
                break;
            }
        }
        peer.close();
        assert!(listen.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_shared_server_close_is_idempotent_and_wakes_accept() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        let server = SharedServer::new("test".into(), addr, listener);

        let pending = {
            let server = server.clone();
            tokio::spawn(async move { server.accept().await.is_none() })
        };
        tokio::task::yield_now().await;
        server.close();
        server.close();
        assert!(pending.await.unwrap());
        assert!(server.is_closed());
        server.closed().await;
        // Closed servers refuse further accepts immediately.
        assert!(server.accept().await.is_none());
    }
}
