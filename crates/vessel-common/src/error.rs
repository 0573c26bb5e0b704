//! Unified error type for the vessel workspace.
//!
//! One variant per bring-up/attach stage. Callers match on the variant
//! where the original failure stage matters; `errno()` exposes the raw
//! OS error code when one was captured.

use thiserror::Error;

use crate::stage::Stage;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Spawning, cloning, or exec-ing a process failed.
    #[error("process setup failed: {message}")]
    ProcessSetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// A mount, bind, pivot, or unmount operation failed.
    #[error("filesystem setup failed: {message}")]
    FilesystemSetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// Hostname, environment, rlimit, or sysctl configuration failed.
    #[error("environment setup failed: {message}")]
    EnvironmentSetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// Dropping group or user identity failed.
    #[error("credential setup failed: {message}")]
    CredentialSetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// Computing or applying capability sets failed.
    #[error("capability setup failed: {message}")]
    CapabilitySetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// A netlink request was rejected or the transport failed.
    #[error("network operation failed: {message} (errno {errno})")]
    Network {
        /// Description of the failed request.
        message: String,
        /// Netlink-reported error code (positive errno value).
        errno: i32,
    },

    /// Allocating or wiring a pseudo-terminal failed.
    #[error("terminal setup failed: {message}")]
    TerminalSetup {
        /// Description of the failed operation.
        message: String,
        /// Raw OS error code, if the failure came from a syscall.
        errno: Option<i32>,
    },

    /// A configuration value is structurally invalid or unsupported.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },
}

impl EngineError {
    /// Builds the error kind corresponding to a bring-up stage.
    ///
    /// The barrier protocol reports failures as `(stage, errno)` pairs;
    /// this restores the typed error on the host side.
    #[must_use]
    pub fn from_stage(stage: Stage, errno: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        let errno = (errno != 0).then_some(errno);
        match stage {
            Stage::NamespacesEntered | Stage::Exec => Self::ProcessSetup { message, errno },
            Stage::HostnameSet => Self::EnvironmentSetup { message, errno },
            Stage::MountsConfigured => Self::FilesystemSetup { message, errno },
            Stage::NetworkPlaced => Self::Network {
                message,
                errno: errno.unwrap_or(0),
            },
            Stage::CapabilitiesTrimmed => Self::CapabilitySetup { message, errno },
            Stage::CredentialsDropped => Self::CredentialSetup { message, errno },
        }
    }

    /// Returns the raw OS error code carried by this error, if any.
    #[must_use]
    pub const fn errno(&self) -> Option<i32> {
        match self {
            Self::ProcessSetup { errno, .. }
            | Self::FilesystemSetup { errno, .. }
            | Self::EnvironmentSetup { errno, .. }
            | Self::CredentialSetup { errno, .. }
            | Self::CapabilitySetup { errno, .. }
            | Self::TerminalSetup { errno, .. } => *errno,
            Self::Network { errno, .. } => Some(*errno),
            Self::Config { .. } => None,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_always_carries_errno() {
        let err = EngineError::Network {
            message: "RTM_NEWLINK rejected".into(),
            errno: 17,
        };
        assert_eq!(err.errno(), Some(17));
    }

    #[test]
    fn config_error_has_no_errno() {
        let err = EngineError::Config {
            message: "duplicate interface name".into(),
        };
        assert_eq!(err.errno(), None);
    }

    #[test]
    fn from_stage_maps_mounts_to_filesystem() {
        let err = EngineError::from_stage(Stage::MountsConfigured, 2, "mount /proc");
        assert!(matches!(
            err,
            EngineError::FilesystemSetup {
                errno: Some(2),
                ..
            }
        ));
    }

    #[test]
    fn from_stage_zero_errno_is_none() {
        let err = EngineError::from_stage(Stage::HostnameSet, 0, "sethostname");
        assert_eq!(err.errno(), None);
    }

    #[test]
    fn display_includes_stage_wording() {
        let err = EngineError::CredentialSetup {
            message: "setresuid(1000)".into(),
            errno: Some(1),
        };
        assert!(err.to_string().contains("credential setup failed"));
    }
}
