//! # hive-cluster
//!
//! A multi-process worker-cluster supervisor: a master process forks child
//! workers, and workers transparently share server listening sockets with
//! the master so the kernel distributes incoming connections across them
//! without each worker binding its own socket.
//!
//! Two roles share this implementation, selected at process start by the
//! `NODE_UNIQUE_ID` environment marker:
//!
//! - [`Supervisor`] (master): owns the worker records, the shared-listener
//!   registry, and the spawn settings; emits [`ClusterEvent`]s.
//! - [`Agent`] (worker): reports in over the inherited channel, obtains
//!   shared listeners via [`Agent::listen`], and runs the graceful
//!   disconnect procedure.
//!
//! ## Example
//!
//! ```no_run
//! use hive_cluster::{Cluster, ClusterSettings};
//! use hive_ipc::ListenSpec;
//!
//! #[tokio::main]
//! async fn main() -> hive_core::Result<()> {
//!     match Cluster::from_env()? {
//!         Cluster::Master(supervisor) => {
//!             supervisor.setup(ClusterSettings::from_current_process()?);
//!             for _ in 0..2 {
//!                 supervisor.fork().await?;
//!             }
//!             // ... wait for work, then:
//!             supervisor.disconnect().await;
//!         }
//!         Cluster::Worker(agent) => {
//!             let server = agent.listen(ListenSpec::new("127.0.0.1", 8080)).await?;
//!             while let Some(conn) = server.accept().await {
//!                 let (_stream, peer) = conn?;
//!                 tracing::info!(%peer, "connection");
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::os::fd::RawFd;

use hive_core::{HiveError, Result, Role};

pub mod agent;
pub mod events;
pub mod registry;
pub mod settings;
pub mod supervisor;
pub mod worker;

// Re-export main types for convenience
pub use agent::{Agent, SharedServer};
pub use events::{ClusterEvent, EventHub};
pub use settings::ClusterSettings;
pub use supervisor::Supervisor;
pub use worker::Worker;
pub use hive_ipc::{ListenAddress, ListenSpec};

/// Environment marker selecting the role: absent means master, present
/// means worker with the value as the worker id.
pub const NODE_UNIQUE_ID: &str = "NODE_UNIQUE_ID";

/// Environment variable telling a worker which descriptor its channel
/// was inherited on.
pub const NODE_CHANNEL_FD: &str = "NODE_CHANNEL_FD";

/// The descriptor number the channel is dup'ed onto in the child.
pub(crate) const CHANNEL_FD: RawFd = 3;

/// The role-dispatched entry point.
pub enum Cluster {
    Master(Supervisor),
    Worker(Agent),
}

impl Cluster {
    /// Detect the role from the environment and construct it.
    ///
    /// Must be called from within a tokio runtime: the worker role spawns
    /// its channel reader immediately.
    pub fn from_env() -> Result<Cluster> {
        match std::env::var(NODE_UNIQUE_ID) {
            Err(_) => Ok(Cluster::Master(Supervisor::new())),
            Ok(_) => Ok(Cluster::Worker(Agent::from_env()?)),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Cluster::Master(_) => Role::Master,
            Cluster::Worker(_) => Role::Worker,
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Cluster::Master(_))
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Cluster::Worker(_))
    }

    /// The supervisor, or a role-mismatch error in a worker.
    pub fn into_supervisor(self) -> Result<Supervisor> {
        match self {
            Cluster::Master(supervisor) => Ok(supervisor),
            Cluster::Worker(_) => Err(HiveError::RoleMismatch {
                operation: "into_supervisor",
                role: Role::Worker,
            }),
        }
    }

    /// The worker agent, or a role-mismatch error in the master.
    pub fn into_agent(self) -> Result<Agent> {
        match self {
            Cluster::Worker(agent) => Ok(agent),
            Cluster::Master(_) => Err(HiveError::RoleMismatch {
                operation: "into_agent",
                role: Role::Master,
            }),
        }
    }
}
