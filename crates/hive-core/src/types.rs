//! Shared type definitions used across hive crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a worker, assigned by the supervisor starting at 1.
pub type WorkerId = u32;

/// Which role this process plays in the cluster.
///
/// The role is decided once at process start from the environment and never
/// changes for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The supervisor: owns worker records and the shared-listener registry
    Master,
    /// A forked child identified by an integer id from the environment
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Lifecycle state of a worker.
///
/// States advance monotonically, except that any state may fall to
/// `Disconnected` or `Dead`. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned but not yet heard from
    #[default]
    None,
    /// The worker reported in over its channel
    Online,
    /// At least one shared listener is accepting in the worker
    Listening,
    /// The IPC channel is gone; the process may still be exiting
    Disconnected,
    /// The process has exited
    Dead,
}

impl WorkerState {
    /// Returns true if `next` is a legal transition from this state.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        if self == next {
            return false;
        }
        match next {
            // Any live state may lose its channel or its process.
            WorkerState::Disconnected => self != WorkerState::Dead,
            WorkerState::Dead => true,
            // Forward-only otherwise.
            _ => (next as u8) > (self as u8) && !self.is_terminal(),
        }
    }

    /// Returns true once no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == WorkerState::Dead
    }

    /// Returns true while the worker's channel is usable.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            WorkerState::None | WorkerState::Online | WorkerState::Listening
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Online => write!(f, "online"),
            Self::Listening => write!(f, "listening"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Timestamp type used throughout hive.
pub type Timestamp = DateTime<Utc>;

/// Get the current UTC timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}
