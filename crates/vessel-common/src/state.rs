//! Container lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Configured but never started.
    New,
    /// Bring-up sequence in progress.
    Starting,
    /// Init process is alive inside the namespace set.
    Running,
    /// Stop was requested; waiting for init to exit.
    Stopping,
    /// Init has exited; the guard has been reaped.
    Stopped,
    /// An attach helper is being set up; returns to Running.
    Attaching,
}

impl ContainerState {
    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Attaching` is a transient sub-state reachable only from
    /// `Running`, returning to `Running` on completion or failure.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Starting)
                | (Self::Starting, Self::Running | Self::Stopped)
                | (Self::Running, Self::Stopping | Self::Stopped | Self::Attaching)
                | (Self::Stopping, Self::Stopped)
                | (Self::Attaching, Self::Running)
        )
    }

    /// Whether the container holds live OS resources in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Stopping | Self::Attaching
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Attaching => write!(f, "attaching"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_only_from_running() {
        assert!(ContainerState::Running.can_transition_to(ContainerState::Attaching));
        assert!(!ContainerState::New.can_transition_to(ContainerState::Attaching));
        assert!(!ContainerState::Stopped.can_transition_to(ContainerState::Attaching));
    }

    #[test]
    fn attach_returns_to_running() {
        assert!(ContainerState::Attaching.can_transition_to(ContainerState::Running));
        assert!(!ContainerState::Attaching.can_transition_to(ContainerState::Stopped));
    }

    #[test]
    fn failed_start_lands_in_stopped() {
        assert!(ContainerState::Starting.can_transition_to(ContainerState::Stopped));
    }

    #[test]
    fn stopped_is_terminal_until_destroy() {
        for next in [
            ContainerState::Starting,
            ContainerState::Running,
            ContainerState::Stopping,
        ] {
            assert!(!ContainerState::Stopped.can_transition_to(next));
        }
    }
}
