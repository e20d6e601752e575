//! Request/echo correlation.
//!
//! Each internal request that wants a reply allocates a token of the form
//! `"<ownerId>:<seq>"` and parks a one-shot continuation under it. The peer
//! echoes the token in `_queryEcho`; receipt resolves and removes the
//! continuation. A token resolves at most once; echoes for unknown tokens
//! are dropped.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use hive_core::WorkerId;

/// What a resolved query hands back to its continuation.
#[derive(Debug, Default)]
pub struct QueryReply {
    pub content: Value,
    pub error: Option<String>,
    pub handle: Option<OwnedFd>,
}

/// The per-process table of in-flight requests.
///
/// There is no timeout: a continuation whose echo never arrives is
/// abandoned when the channel dies ([`PendingQueries::abandon_all`]), which
/// makes the receiver side observe `RecvError` rather than hanging forever.
#[derive(Debug)]
pub struct PendingQueries {
    owner: WorkerId,
    seq: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<QueryReply>>>,
}

impl PendingQueries {
    /// `owner` prefixes every token; workers use their own id, the master
    /// uses 0.
    pub fn new(owner: WorkerId) -> Self {
        Self {
            owner,
            seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a token and park a continuation under it.
    pub fn register(&self) -> (String, oneshot::Receiver<QueryReply>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let token = format!("{}:{}", self.owner, seq);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending-query lock poisoned")
            .insert(token.clone(), tx);
        (token, rx)
    }

    /// Resolve the continuation parked under `token`, if any.
    ///
    /// Returns false for unsolicited echoes, which are dropped.
    pub fn resolve(&self, token: &str, reply: QueryReply) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending-query lock poisoned")
            .remove(token);
        match sender {
            Some(tx) => {
                // A dropped receiver means the requester gave up; still counts
                // as resolved so the token cannot be replayed.
                let _ = tx.send(reply);
                true
            }
            None => {
                debug!(token, "dropping unsolicited echo");
                false
            }
        }
    }

    /// Drop every parked continuation. Receivers observe closure.
    pub fn abandon_all(&self) {
        self.pending
            .lock()
            .expect("pending-query lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .expect("pending-query lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_format_and_sequence() {
        let queries = PendingQueries::new(3);
        let (first, _rx1) = queries.register();
        let (second, _rx2) = queries.register();
        assert_eq!(first, "3:1");
        assert_eq!(second, "3:2");
        assert_eq!(queries.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let queries = PendingQueries::new(1);
        let (token, rx) = queries.register();

        assert!(queries.resolve(&token, QueryReply::default()));
        assert!(rx.await.is_ok());

        // The token is gone; a replayed echo is dropped.
        assert!(!queries.resolve(&token, QueryReply::default()));
        assert!(queries.is_empty());
    }

    #[tokio::test]
    async fn test_unsolicited_echo_dropped() {
        let queries = PendingQueries::new(1);
        assert!(!queries.resolve("9:9", QueryReply::default()));
    }

    #[tokio::test]
    async fn test_abandon_all_closes_receivers() {
        let queries = PendingQueries::new(1);
        let (_token, rx) = queries.register();
        queries.abandon_all();
        assert!(rx.await.is_err());
        assert!(queries.is_empty());
    }
}
