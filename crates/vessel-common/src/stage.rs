//! Ordered bring-up stages.
//!
//! The stages are strictly ordered; each one is gated by a one-shot
//! barrier between the host side and the namespaced child. The order is
//! load-bearing: mounts and network placement need full privilege and
//! happen before anything is shed, capability trimming needs
//! `CAP_SETPCAP` which is forfeited by the credential drop, and exec is
//! irreversible.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stage of the container bring-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stage {
    /// The child runs inside the requested namespace set.
    NamespacesEntered = 0,
    /// The container hostname is applied.
    HostnameSet = 1,
    /// The mount list is applied and the root is switched.
    MountsConfigured = 2,
    /// Network interfaces exist inside the container namespace.
    NetworkPlaced = 3,
    /// The capability sets are reduced to the keep set.
    CapabilitiesTrimmed = 4,
    /// Group and user identity are dropped.
    CredentialsDropped = 5,
    /// The init binary replaces the child process.
    Exec = 6,
}

impl Stage {
    /// All stages in bring-up order.
    pub const ALL: [Self; 7] = [
        Self::NamespacesEntered,
        Self::HostnameSet,
        Self::MountsConfigured,
        Self::NetworkPlaced,
        Self::CapabilitiesTrimmed,
        Self::CredentialsDropped,
        Self::Exec,
    ];

    /// Wire encoding used by the barrier protocol.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a stage from its wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NamespacesEntered),
            1 => Some(Self::HostnameSet),
            2 => Some(Self::MountsConfigured),
            3 => Some(Self::NetworkPlaced),
            4 => Some(Self::CapabilitiesTrimmed),
            5 => Some(Self::CredentialsDropped),
            6 => Some(Self::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NamespacesEntered => "namespaces-entered",
            Self::HostnameSet => "hostname-set",
            Self::MountsConfigured => "mounts-configured",
            Self::NetworkPlaced => "network-placed",
            Self::CapabilitiesTrimmed => "capabilities-trimmed",
            Self::CredentialsDropped => "credentials-dropped",
            Self::Exec => "exec",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_strictly_ordered() {
        for pair in Stage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn credentials_drop_after_capability_trim() {
        assert!(Stage::CapabilitiesTrimmed < Stage::CredentialsDropped);
        assert!(Stage::CredentialsDropped < Stage::Exec);
    }

    #[test]
    fn wire_encoding_round_trips() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_u8(stage.as_u8()), Some(stage));
        }
        assert_eq!(Stage::from_u8(7), None);
    }
}
