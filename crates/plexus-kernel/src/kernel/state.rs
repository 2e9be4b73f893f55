use std::fmt;

use serde::{Deserialize, Serialize};

/// Global kernel state.
///
/// Moves forward only: `Idle -> Initializing -> Running -> Stopping ->
/// Stopped`, except that a failed bootstrap jumps from `Initializing`
/// straight to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    #[default]
    Idle,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl KernelState {
    /// Stopping or stopped; no further lifecycle work is accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, KernelState::Stopping | KernelState::Stopped)
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelState::Idle => write!(f, "idle"),
            KernelState::Initializing => write!(f, "initializing"),
            KernelState::Running => write!(f, "running"),
            KernelState::Stopping => write!(f, "stopping"),
            KernelState::Stopped => write!(f, "stopped"),
        }
    }
}
