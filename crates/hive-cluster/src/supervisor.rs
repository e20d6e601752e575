//! The master role: spawning, worker tracking, internal-message dispatch,
//! the shared-listener registry, and cluster-wide graceful disconnect.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use hive_core::{HiveError, Result, Role, WorkerId, WorkerState};
use hive_ipc::{decode, Channel, Envelope, Frame, Inbound, InternalCmd, PendingQueries, QueryReply};

use crate::events::{ClusterEvent, EventHub};
use crate::registry::ListenerRegistry;
use crate::settings::ClusterSettings;
use crate::worker::Worker;
use crate::{CHANNEL_FD, NODE_CHANNEL_FD, NODE_UNIQUE_ID};

/// The cluster supervisor.
///
/// Owns the workers map, the shared-listener registry, and the spawn
/// settings. All mutation happens on the supervisor's own tasks; handles
/// are cheap clones.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    settings: Mutex<Option<ClusterSettings>>,
    next_id: AtomicU32,
    workers: RwLock<HashMap<WorkerId, Worker>>,
    registry: ListenerRegistry,
    queries: PendingQueries,
    events: EventHub,
}

impl Supervisor {
    pub fn new() -> Self {
        info!(pid = std::process::id(), role = %Role::Master, "supervisor created");
        Self {
            inner: Arc::new(SupervisorInner {
                settings: Mutex::new(None),
                next_id: AtomicU32::new(1),
                workers: RwLock::new(HashMap::new()),
                registry: ListenerRegistry::new(),
                // The master prefixes its (rare) request tokens with id 0,
                // which no worker ever holds.
                queries: PendingQueries::new(0),
                events: EventHub::new(),
            }),
        }
    }

    /// Subscribe to cluster lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.events.subscribe()
    }

    /// Install spawn settings.
    ///
    /// Only the first call takes effect; later calls are no-ops that return
    /// the already-installed snapshot.
    pub fn setup(&self, settings: ClusterSettings) -> ClusterSettings {
        {
            let mut slot = self.inner.settings.lock().expect("settings lock poisoned");
            if let Some(existing) = slot.as_ref() {
                return existing.clone();
            }
            *slot = Some(settings.clone());
        }
        debug!(exec = %settings.exec.display(), "cluster settings installed");
        self.inner.events.emit(ClusterEvent::Setup);
        settings
    }

    /// The installed settings snapshot, if `setup` has run.
    pub fn settings(&self) -> Option<ClusterSettings> {
        self.inner
            .settings
            .lock()
            .expect("settings lock poisoned")
            .clone()
    }

    /// Spawn a new worker.
    pub async fn fork(&self) -> Result<Worker> {
        self.fork_with_env(Vec::<(String, String)>::new()).await
    }

    /// Spawn a new worker with extra environment variables (later keys win
    /// over the inherited environment and the cluster's own markers).
    pub async fn fork_with_env(
        &self,
        env_overrides: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Worker> {
        let settings = match self.settings() {
            Some(settings) => settings,
            // fork without setup behaves as setup with defaults
            None => self.setup(ClusterSettings::from_current_process()?),
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (channel, child_end) = Channel::socketpair()?;
        let worker = self.insert_record(id, Arc::new(channel)).await;

        let mut cmd = Command::new(&settings.exec);
        cmd.args(&settings.exec_argv)
            .args(&settings.args)
            .env(NODE_UNIQUE_ID, id.to_string())
            .env(NODE_CHANNEL_FD, CHANNEL_FD.to_string());
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if settings.silent {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let inherited = child_end.as_fd().as_raw_fd();
        // SAFETY: dup2/fcntl are async-signal-safe, and the closure touches
        // nothing else between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if inherited == CHANNEL_FD {
                    // Already at the right number; just clear close-on-exec.
                    let flags = libc::fcntl(CHANNEL_FD, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(CHANNEL_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(inherited, CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                drop(child_end);
                if let Some(pid) = child.id() {
                    worker.set_pid(pid);
                }
                info!(worker_id = id, pid = child.id(), "worker forked");
                self.spawn_reader(worker.clone());
                self.spawn_waiter(worker.clone(), child);
                Ok(worker)
            }
            Err(e) => {
                drop(child_end);
                warn!(worker_id = id, error = %e, "worker spawn failed");
                self.inner.events.emit(ClusterEvent::Error {
                    id,
                    message: e.to_string(),
                });
                // Stillborn record: no exit will ever fire for it, so the
                // map entry goes now; the returned handle stays in `None`.
                self.inner.workers.write().await.remove(&id);
                Err(HiveError::Spawn {
                    id,
                    exec: settings.exec.clone(),
                    source: e,
                })
            }
        }
    }

    /// All live worker records, in no particular order.
    pub async fn workers(&self) -> Vec<Worker> {
        self.inner.workers.read().await.values().cloned().collect()
    }

    /// Look up a live worker by id.
    pub async fn get(&self, id: WorkerId) -> Option<Worker> {
        self.inner.workers.read().await.get(&id).cloned()
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.read().await.len()
    }

    /// Number of live entries in the shared-listener registry.
    pub async fn listener_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Gracefully disconnect every worker, then close the shared listeners.
    ///
    /// Completes once every worker that was alive at the call has reported
    /// its disconnect and the registry has been drained. With no workers it
    /// completes immediately.
    pub async fn disconnect(&self) {
        let workers = self.workers().await;
        info!(workers = workers.len(), "cluster disconnect");

        let mut waits = Vec::with_capacity(workers.len());
        for worker in &workers {
            waits.push(worker.watch_state());
            // A send failure means the channel is already down, which is
            // exactly the condition the wait below observes.
            let _ = worker.disconnect().await;
        }
        for mut rx in waits {
            let _ = rx.wait_for(|state| !state.is_connected()).await;
        }

        self.inner.registry.close_all().await;
    }

    // =========================================================================
    // Record plumbing and dispatch
    // =========================================================================

    async fn insert_record(&self, id: WorkerId, channel: Arc<Channel>) -> Worker {
        let worker = Worker::new(id, channel, self.inner.events.clone());
        self.inner
            .workers
            .write()
            .await
            .insert(id, worker.clone());
        worker
    }

    /// Wire a worker record to an already-connected channel without
    /// spawning a process. This is the seam `fork` uses after the spawn,
    /// and it lets an in-process peer stand in for a child under test.
    #[cfg(test)]
    async fn adopt(&self, channel: Channel) -> Worker {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let worker = self.insert_record(id, Arc::new(channel)).await;
        self.spawn_reader(worker.clone());
        worker
    }

    /// One task per worker: announce the fork, then pull frames off the
    /// channel and dispatch them until the channel dies, then run the
    /// disconnect transition.
    fn spawn_reader(&self, worker: Worker) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            // Emitted here rather than inside `fork` so it lands on a later
            // scheduling turn, and still ahead of anything this worker says.
            worker.emit(ClusterEvent::Fork { id: worker.id() });
            loop {
                match worker.channel().recv().await {
                    Ok(Some(frame)) => {
                        let Some(inner) = inner.upgrade() else { break };
                        if let Err(e) = dispatch(&inner, &worker, frame).await {
                            warn!(worker_id = worker.id(), error = %e, "dropping bad message");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if !e.is_channel_error() {
                            warn!(worker_id = worker.id(), error = %e, "channel read failed");
                        }
                        break;
                    }
                }
            }
            if let Some(inner) = inner.upgrade() {
                finish_disconnect(&inner, &worker).await;
            } else {
                worker.prepare_exit(WorkerState::Disconnected);
            }
        });
    }

    /// One task per child: reap it and report the exit.
    fn spawn_waiter(&self, worker: Worker, mut child: Child) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;
            let (code, signal) = match &status {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    (status.code(), status.signal())
                }
                Err(_) => (None, None),
            };
            worker.prepare_exit(WorkerState::Dead);
            let suicide = worker.suicide().unwrap_or(false);
            debug!(worker_id = worker.id(), ?code, ?signal, suicide, "worker exited");
            if let Some(inner) = inner.upgrade() {
                inner.workers.write().await.remove(&worker.id());
            }
            worker.emit(ClusterEvent::Exit {
                id: worker.id(),
                code,
                signal,
                suicide,
            });
        });
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Channel teardown: transition to `Disconnected`, drop the record from the
/// map, and announce it. The state check makes a double arrival a no-op.
async fn finish_disconnect(inner: &Arc<SupervisorInner>, worker: &Worker) {
    if worker.prepare_exit(WorkerState::Disconnected) {
        inner.workers.write().await.remove(&worker.id());
        worker.emit(ClusterEvent::Disconnect { id: worker.id() });
    }
}

/// Master-side handling of one inbound frame.
async fn dispatch(inner: &Arc<SupervisorInner>, worker: &Worker, frame: Frame) -> Result<()> {
    let Frame { payload, mut handle } = frame;
    let envelope = match decode(&payload)? {
        Inbound::User(value) => {
            worker.emit(ClusterEvent::Message {
                id: worker.id(),
                payload: value,
            });
            return Ok(());
        }
        Inbound::Internal(envelope) => envelope,
    };

    // A reply resumes its pending continuation before anything else.
    if let Some(token) = envelope.query_echo.as_deref() {
        inner.queries.resolve(
            token,
            QueryReply {
                content: envelope.content.clone(),
                error: envelope.error.clone(),
                handle: handle.take(),
            },
        );
    }

    match envelope.internal_cmd() {
        Some(InternalCmd::Online) => {
            worker.set_state(WorkerState::Online);
            worker.emit(ClusterEvent::Online { id: worker.id() });
            acknowledge(worker, &envelope).await
        }
        Some(InternalCmd::QueryServer) => {
            handle_query_server(inner, worker, envelope);
            Ok(())
        }
        Some(InternalCmd::Listening) => {
            worker.set_state(WorkerState::Listening);
            if let Some(address) = envelope.address.clone() {
                worker.emit(ClusterEvent::Listening {
                    id: worker.id(),
                    address,
                });
            }
            acknowledge(worker, &envelope).await
        }
        Some(InternalCmd::Suicide) => {
            worker.set_suicide(true);
            acknowledge(worker, &envelope).await
        }
        // `disconnect` is worker-side only; unknown commands fall through to
        // the empty echo so a requester never hangs on us.
        Some(InternalCmd::Disconnect) | None => acknowledge(worker, &envelope).await,
    }
}

/// Send the empty echo iff the inbound message asked for one.
async fn acknowledge(worker: &Worker, inbound: &Envelope) -> Result<()> {
    if let Some(token) = inbound.request_echo.clone() {
        worker.send_internal(&inbound.reply(token), None).await?;
    }
    Ok(())
}

/// Resolve a `queryServer` on its own task so an in-flight bind never
/// stalls the worker's channel FIFO.
fn handle_query_server(inner: &Arc<SupervisorInner>, worker: &Worker, envelope: Envelope) {
    let inner = inner.clone();
    let worker = worker.clone();
    tokio::spawn(async move {
        let Some(token) = envelope.request_echo.clone() else {
            warn!(worker_id = worker.id(), "queryServer without a request token");
            return;
        };
        let reply = envelope.reply(token);
        let result = match envelope.args.as_ref() {
            Some(spec) => inner.registry.query(spec).await,
            None => Err(HiveError::frame("queryServer without listen args")),
        };
        let sent = match result {
            Ok(listener) => {
                worker
                    .send_internal(&reply, Some(listener.as_fd()))
                    .await
            }
            Err(e) => worker.send_internal(&reply.with_error(e.to_string()), None).await,
        };
        if let Err(e) = sent {
            debug!(worker_id = worker.id(), error = %e, "queryServer reply not delivered");
        }
    });
}
