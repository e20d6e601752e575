//! # hive-ipc
//!
//! The IPC layer between the hive supervisor and its workers: a framed
//! unix-socket message channel that can pass one OS handle per message,
//! the cluster-internal wire protocol on top of it, and the request/echo
//! correlation table.
//!
//! - [`Channel`] - duplex message+handle transport over a socketpair
//! - [`protocol`] - the `NODE_CLUSTER_`-prefixed envelope and listen shapes
//! - [`PendingQueries`] - one-shot continuations keyed by echo token

pub mod channel;
pub mod protocol;
pub mod query;

// Re-export main types for convenience
pub use channel::{Channel, Frame, MAX_FRAME_SIZE};
pub use protocol::{
    decode, encode, encode_user, Envelope, Inbound, InternalCmd, ListenAddress, ListenSpec,
    INTERNAL_PREFIX,
};
pub use query::{PendingQueries, QueryReply};
