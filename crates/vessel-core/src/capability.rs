//! Linux capability management for least-privilege containers.
//!
//! The engine computes the bounding, permitted, effective, and
//! inheritable sets as functions of a single keep set and applies them
//! while the process still holds `CAP_SETPCAP`. Everything outside the
//! keep set is dropped from the bounding set so it cannot be regained
//! across exec.

use std::fmt;

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};

/// Linux capability identifiers, by kernel bit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Change file ownership.
    Chown,
    /// Bypass file permission checks.
    DacOverride,
    /// Bypass file ownership checks for operations requiring it.
    Fowner,
    /// Keep set-user-ID bits on file modification.
    Fsetid,
    /// Send signals to arbitrary processes.
    Kill,
    /// Set group identity.
    Setgid,
    /// Set user identity.
    Setuid,
    /// Modify capability sets of other processes and drop bounding caps.
    Setpcap,
    /// Bind to privileged ports (< 1024).
    NetBindService,
    /// Broadcast and listen to multicast.
    NetBroadcast,
    /// Configure interfaces, addresses, routing tables, and firewalls.
    NetAdmin,
    /// Use raw and packet sockets.
    NetRaw,
    /// Lock memory.
    IpcLock,
    /// Use `chroot(2)`.
    SysChroot,
    /// Trace arbitrary processes.
    SysPtrace,
    /// Perform privileged system administration (mount among others).
    SysAdmin,
    /// Raise process priority.
    SysNice,
    /// Override resource limits.
    SysResource,
    /// Create device nodes.
    Mknod,
    /// Write records to the kernel audit log.
    AuditWrite,
    /// Set file capabilities.
    Setfcap,
}

impl Capability {
    /// Kernel bit number (from `linux/capability.h`).
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Chown => 0,
            Self::DacOverride => 1,
            Self::Fowner => 3,
            Self::Fsetid => 4,
            Self::Kill => 5,
            Self::Setgid => 6,
            Self::Setuid => 7,
            Self::Setpcap => 8,
            Self::NetBindService => 10,
            Self::NetBroadcast => 11,
            Self::NetAdmin => 12,
            Self::NetRaw => 13,
            Self::IpcLock => 14,
            Self::SysChroot => 18,
            Self::SysPtrace => 19,
            Self::SysAdmin => 21,
            Self::SysNice => 23,
            Self::SysResource => 24,
            Self::Mknod => 27,
            Self::AuditWrite => 29,
            Self::Setfcap => 31,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A set of capabilities as a kernel bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    /// The empty set: every capability is dropped.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The full mask: nothing is dropped.
    #[must_use]
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// Builds a set from named capabilities.
    #[must_use]
    pub fn from_caps(caps: &[Capability]) -> Self {
        caps.iter()
            .fold(Self::empty(), |set, cap| set.with(*cap))
    }

    /// Returns the set with `cap` added.
    #[must_use]
    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | (1u64 << cap.bit()))
    }

    /// Whether the named capability is kept.
    #[must_use]
    pub const fn contains(self, cap: Capability) -> bool {
        self.contains_bit(cap.bit())
    }

    /// Whether the capability with the given kernel bit is kept.
    #[must_use]
    pub const fn contains_bit(self, bit: u8) -> bool {
        self.0 & (1u64 << bit) != 0
    }

    /// Raw bitmask value.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }
}

/// Highest capability bit supported by the running kernel.
#[cfg(target_os = "linux")]
fn last_cap() -> Result<u8> {
    let text = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap").map_err(|e| {
        EngineError::CapabilitySetup {
            message: format!("read /proc/sys/kernel/cap_last_cap failed: {e}"),
            errno: e.raw_os_error(),
        }
    })?;
    text.trim()
        .parse::<u8>()
        .map_err(|e| EngineError::CapabilitySetup {
            message: format!("parse cap_last_cap {:?} failed: {e}", text.trim()),
            errno: None,
        })
}

/// Version and layout constants for `capset(2)`.
#[cfg(target_os = "linux")]
const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[cfg(target_os = "linux")]
#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[cfg(target_os = "linux")]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Reduces the process's capability sets to `keep`.
///
/// Drops every capability outside `keep` from the bounding set via
/// `prctl(PR_CAPBSET_DROP)`, then applies the remaining sets with
/// `capset(2)`: inheritable = `keep`; permitted and effective =
/// `keep` plus `CAP_SETUID`/`CAP_SETGID`, which the credential drop
/// still needs — the kernel clears them (with the rest of the
/// permitted set) on the uid transition, and across exec the bounding
/// set governs what can be regained, so nothing outside `keep`
/// survives into init. Must run while the process still holds
/// `CAP_SETPCAP`.
///
/// # Errors
///
/// Returns a capability-setup error on the first failing syscall; no
/// retry, no partial rollback (the caller abandons the process).
#[cfg(target_os = "linux")]
pub fn apply_capabilities(keep: CapabilitySet) -> Result<()> {
    let last = last_cap()?;
    // capset(2) rejects bits above the kernel's highest capability.
    let supported = if last >= 63 {
        u64::MAX
    } else {
        (1u64 << (last + 1)) - 1
    };

    for cap in 0..=last {
        if keep.contains_bit(cap) {
            continue;
        }
        // SAFETY: plain prctl invocation; arguments are integers.
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, libc::c_ulong::from(cap), 0, 0, 0) };
        if rc != 0 {
            let e = nix::errno::Errno::last();
            return Err(EngineError::CapabilitySetup {
                message: format!("prctl(PR_CAPBSET_DROP, {cap}) failed: {e}"),
                errno: Some(e as i32),
            });
        }
    }

    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let inheritable = keep.bits() & supported;
    let held = keep
        .with(Capability::Setuid)
        .with(Capability::Setgid)
        .bits()
        & supported;
    let data = [
        CapUserData {
            effective: (held & 0xffff_ffff) as u32,
            permitted: (held & 0xffff_ffff) as u32,
            inheritable: (inheritable & 0xffff_ffff) as u32,
        },
        CapUserData {
            effective: (held >> 32) as u32,
            permitted: (held >> 32) as u32,
            inheritable: (inheritable >> 32) as u32,
        },
    ];

    // SAFETY: header and data are valid for the duration of the call and
    // laid out per the capset(2) ABI (v3 uses two data elements).
    let rc = unsafe { libc::syscall(libc::SYS_capset, &raw mut header, data.as_ptr()) };
    if rc != 0 {
        let e = nix::errno::Errno::last();
        return Err(EngineError::CapabilitySetup {
            message: format!("capset() failed: {e}"),
            errno: Some(e as i32),
        });
    }

    tracing::debug!(keep = format!("{:#x}", keep.bits()), "capability sets applied");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — capabilities require Linux.
#[cfg(not(target_os = "linux"))]
pub fn apply_capabilities(_keep: CapabilitySet) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for capability operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_admin_has_kernel_bit_twelve() {
        assert_eq!(Capability::NetAdmin.bit(), 12);
        assert!(CapabilitySet::from_caps(&[Capability::NetAdmin]).contains_bit(12));
    }

    #[test]
    fn empty_set_keeps_nothing() {
        let set = CapabilitySet::empty();
        for bit in 0..64 {
            assert!(!set.contains_bit(bit));
        }
    }

    #[test]
    fn with_is_additive() {
        let set = CapabilitySet::empty()
            .with(Capability::NetAdmin)
            .with(Capability::SysAdmin);
        assert!(set.contains(Capability::NetAdmin));
        assert!(set.contains(Capability::SysAdmin));
        assert!(!set.contains(Capability::Setuid));
    }

    #[test]
    fn full_mask_keeps_everything() {
        assert!(CapabilitySet::all().contains(Capability::Mknod));
        assert_eq!(CapabilitySet::all().bits(), u64::MAX);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kernel_reports_a_sane_last_cap() {
        let last = last_cap().unwrap();
        // CAP_SETFCAP (31) exists on every kernel this engine targets.
        assert!(last >= 31);
        assert!(last < 64);
    }
}
