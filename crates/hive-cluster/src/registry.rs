//! The master-side shared-listener registry.
//!
//! One entry per listen fingerprint. The first `queryServer` for a key
//! performs the bind; every later request for the same key receives a
//! duplicate of the same listening socket, so the kernel distributes
//! accepted connections across all holders. Requests that arrive while the
//! bind is still in flight queue behind it and are flushed when it
//! completes, so the bind happens exactly once per key no matter how the
//! requests race.

use std::collections::HashMap;
use std::net::{TcpListener, ToSocketAddrs};

use socket2::{Domain, Socket, Type};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use hive_core::{HiveError, Result};
use hive_ipc::ListenSpec;

/// Listen backlog used when the worker did not ask for one.
const DEFAULT_BACKLOG: u32 = 128;

enum Entry {
    /// Bind in flight; same-key requests park here until it resolves
    Binding(Vec<oneshot::Sender<std::result::Result<TcpListener, String>>>),
    /// Live listener owned by the master
    Bound(TcpListener),
}

/// Fingerprint → shared listener map.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `spec` to a listening socket, binding it on first request.
    ///
    /// The returned listener is a duplicate; the registry keeps its own
    /// copy alive until [`close_all`](Self::close_all). On bind failure the
    /// key is removed again, so a later identical request may retry.
    pub async fn query(&self, spec: &ListenSpec) -> Result<TcpListener> {
        let key = spec.fingerprint();

        let waiter = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&key) {
                Some(Entry::Bound(listener)) => {
                    debug!(%key, "shared listener cache hit");
                    return dup(&key, listener);
                }
                Some(Entry::Binding(waiters)) => {
                    debug!(%key, "waiting for in-flight bind");
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    entries.insert(key.clone(), Entry::Binding(Vec::new()));
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(listener)) => Ok(listener),
                Ok(Err(message)) => Err(HiveError::bind(key, message)),
                Err(_) => Err(HiveError::internal("listener registry dropped mid-bind")),
            };
        }

        // This request owns the bind.
        let outcome = bind_listener(spec);
        let mut entries = self.entries.lock().await;
        let waiters = match entries.remove(&key) {
            Some(Entry::Binding(waiters)) => waiters,
            _ => Vec::new(),
        };
        match outcome {
            Ok(listener) => {
                debug!(%key, addr = ?listener.local_addr().ok(), waiters = waiters.len(), "shared listener bound");
                for tx in waiters {
                    let _ = tx.send(dup(&key, &listener).map_err(|e| e.to_string()));
                }
                let result = dup(&key, &listener);
                entries.insert(key, Entry::Bound(listener));
                result
            }
            Err(e) => {
                warn!(%key, error = %e, "shared listener bind failed");
                let message = e.to_string();
                for tx in waiters {
                    let _ = tx.send(Err(message.clone()));
                }
                Err(HiveError::bind(key, message))
            }
        }
    }

    /// Close and drop every shared listener. Invoked by the supervisor's
    /// own disconnect, after all workers have reported theirs.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        if count > 0 {
            debug!(count, "closed shared listeners");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }
}

fn dup(key: &str, listener: &TcpListener) -> Result<TcpListener> {
    listener
        .try_clone()
        .map_err(|e| HiveError::bind(key, format!("failed to duplicate listener: {e}")))
}

/// Bind a fresh listening socket for `spec`. Runs once per fingerprint.
fn bind_listener(spec: &ListenSpec) -> std::io::Result<TcpListener> {
    let addr = (spec.host.as_str(), spec.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no address for {spec}"),
            )
        })?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(spec.backlog.unwrap_or(DEFAULT_BACKLOG) as i32)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_bind_once_per_key() {
        let registry = ListenerRegistry::new();
        let spec = ListenSpec::new("127.0.0.1", 0);

        let first = registry.query(&spec).await.unwrap();
        let second = registry.query(&spec).await.unwrap();

        // Same kernel socket behind both duplicates.
        assert_eq!(
            first.local_addr().unwrap(),
            second.local_addr().unwrap()
        );
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_bind_separately() {
        let registry = ListenerRegistry::new();
        let a = registry
            .query(&ListenSpec::new("127.0.0.1", 0))
            .await
            .unwrap();
        let b = registry
            .query(&ListenSpec::new("127.0.0.1", 0).with_backlog(64))
            .await
            .unwrap();
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_same_key_queries() {
        let registry = Arc::new(ListenerRegistry::new());
        let spec = ListenSpec::new("127.0.0.1", 0);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let spec = spec.clone();
            tasks.push(tokio::spawn(async move { registry.query(&spec).await }));
        }

        let mut addrs = Vec::new();
        for task in tasks {
            addrs.push(task.await.unwrap().unwrap().local_addr().unwrap());
        }
        addrs.dedup();
        assert_eq!(addrs.len(), 1, "every requester must see one socket");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_bind_failure_reported_and_retryable() {
        // Occupy a port with a plain listener; the registry's bind on the
        // same port must fail with EADDRINUSE.
        let occupant = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();

        let registry = ListenerRegistry::new();
        let spec = ListenSpec::new("127.0.0.1", port);
        let err = registry.query(&spec).await.unwrap_err();
        assert!(err.is_listener_error());

        // Failed keys do not linger.
        assert!(!registry.contains(&spec.fingerprint()).await);
        assert_eq!(registry.len().await, 0);

        // Once the occupant is gone the same key binds cleanly.
        drop(occupant);
        let listener = registry.query(&spec).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = ListenerRegistry::new();
        registry
            .query(&ListenSpec::new("127.0.0.1", 0))
            .await
            .unwrap();
        assert_eq!(registry.len().await, 1);
        registry.close_all().await;
        assert!(registry.is_empty().await);
    }
}
