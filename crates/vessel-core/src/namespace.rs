//! Linux namespace management for container isolation.
//!
//! Provides safe wrappers around `unshare(2)` and `setns(2)` for the six
//! namespace kinds the engine isolates, plus the `/proc/<pid>/ns/*` path
//! resolution used to join a running container.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};

/// A Linux namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// User and group ID mappings.
    User,
    /// Mount table.
    Mount,
    /// Process ID space.
    Pid,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Network devices, addresses, and routes.
    Net,
}

impl Namespace {
    /// All namespace kinds the engine can isolate.
    pub const ALL: [Self; 6] = [
        Self::User,
        Self::Mount,
        Self::Pid,
        Self::Uts,
        Self::Ipc,
        Self::Net,
    ];

    /// The `CLONE_NEW*` flag for this kind.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;
        match self {
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Net => CloneFlags::CLONE_NEWNET,
        }
    }

    /// The kind's entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Mount => "mnt",
            Self::Pid => "pid",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
        }
    }

    /// Path of the namespace reference held open by process `pid`.
    #[must_use]
    pub fn path(self, pid: i32) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proc_name())
    }
}

/// Combines namespace kinds into a single `clone(2)` flag set.
#[cfg(target_os = "linux")]
#[must_use]
pub fn clone_flags(kinds: &[Namespace]) -> nix::sched::CloneFlags {
    kinds
        .iter()
        .fold(nix::sched::CloneFlags::empty(), |acc, ns| {
            acc | ns.clone_flag()
        })
}

/// Reorders namespace kinds so they can be entered without losing the
/// privilege required by later entries.
///
/// Entering a USER namespace can drop the privilege needed to enter the
/// remaining kinds, so USER must come first when present. The relative
/// order of the other kinds is preserved.
#[must_use]
pub fn privilege_order(kinds: &[Namespace]) -> Vec<Namespace> {
    let mut ordered: Vec<Namespace> = Vec::with_capacity(kinds.len());
    ordered.extend(kinds.iter().copied().filter(|ns| *ns == Namespace::User));
    ordered.extend(kinds.iter().copied().filter(|ns| *ns != Namespace::User));
    ordered
}

/// Resolves the `/proc/<pid>/ns/<kind>` join path for each requested kind.
#[must_use]
pub fn join_paths(pid: i32, kinds: &[Namespace]) -> Vec<(Namespace, PathBuf)> {
    kinds.iter().map(|ns| (*ns, ns.path(pid))).collect()
}

/// Detaches the calling process from the listed namespaces in one call.
///
/// # Errors
///
/// Returns a process-setup error if the `unshare(2)` syscall fails.
#[cfg(target_os = "linux")]
pub fn unshare_namespaces(kinds: &[Namespace]) -> Result<()> {
    let flags = clone_flags(kinds);
    nix::sched::unshare(flags).map_err(|e| EngineError::ProcessSetup {
        message: format!("unshare({flags:?}) failed: {e}"),
        errno: Some(e as i32),
    })?;
    tracing::debug!(?kinds, "namespaces unshared");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespaces require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unshare_namespaces(_kinds: &[Namespace]) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for namespace operations".into(),
    })
}

/// Moves the calling thread into the namespace behind an open descriptor.
///
/// # Errors
///
/// Returns a process-setup error naming the kind if `setns(2)` fails.
#[cfg(target_os = "linux")]
pub fn join_namespace<Fd: std::os::fd::AsFd>(fd: Fd, kind: Namespace) -> Result<()> {
    nix::sched::setns(fd, kind.clone_flag()).map_err(|e| EngineError::ProcessSetup {
        message: format!("setns({kind}) failed: {e}"),
        errno: Some(e as i32),
    })?;
    tracing::debug!(%kind, "namespace joined");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespace joining requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn join_namespace<Fd>(_fd: Fd, _kind: Namespace) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for namespace operations".into(),
    })
}

/// Joins the namespace set of process `pid` in privilege-safe order.
///
/// Opens each `/proc/<pid>/ns/<kind>` reference and enters it with
/// `setns(2)`, USER first when requested. Failure partway is reported
/// with the kind that failed; namespaces already entered are not undone
/// (the caller is a short-lived helper process that exits on error).
///
/// # Errors
///
/// Returns a process-setup error naming the failing kind on the first
/// open or `setns(2)` failure.
#[cfg(target_os = "linux")]
pub fn join_process_namespaces(pid: i32, kinds: &[Namespace]) -> Result<()> {
    for (kind, path) in join_paths(pid, &privilege_order(kinds)) {
        let file = std::fs::File::open(&path).map_err(|e| EngineError::ProcessSetup {
            message: format!("open {} failed: {e}", path.display()),
            errno: e.raw_os_error(),
        })?;
        join_namespace(&file, kind)?;
    }
    tracing::debug!(pid, ?kinds, "joined namespace set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespace joining requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn join_process_namespaces(_pid: i32, _kinds: &[Namespace]) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for namespace operations".into(),
    })
}

/// Reads the namespace identifier (the `ns:[inode]` link target) for a
/// process, usable to compare namespace membership between processes.
///
/// # Errors
///
/// Returns a process-setup error if the link cannot be read.
pub fn namespace_id(pid: i32, kind: Namespace) -> Result<String> {
    let path = kind.path(pid);
    let target = std::fs::read_link(&path).map_err(|e| EngineError::ProcessSetup {
        message: format!("readlink {} failed: {e}", path.display()),
        errno: e.raw_os_error(),
    })?;
    Ok(target.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_namespace_ordered_first() {
        let ordered = privilege_order(&[Namespace::Net, Namespace::Pid, Namespace::User]);
        assert_eq!(
            ordered,
            vec![Namespace::User, Namespace::Net, Namespace::Pid]
        );
    }

    #[test]
    fn order_preserved_without_user() {
        let kinds = [Namespace::Mount, Namespace::Uts, Namespace::Ipc];
        assert_eq!(privilege_order(&kinds), kinds.to_vec());
    }

    #[test]
    fn join_paths_point_into_proc() {
        let paths = join_paths(1234, &[Namespace::Pid, Namespace::Net]);
        assert_eq!(paths[0].1, PathBuf::from("/proc/1234/ns/pid"));
        assert_eq!(paths[1].1, PathBuf::from("/proc/1234/ns/net"));
    }

    #[test]
    fn mount_namespace_uses_mnt_proc_name() {
        assert_eq!(Namespace::Mount.proc_name(), "mnt");
        assert_eq!(
            Namespace::Mount.path(1),
            PathBuf::from("/proc/1/ns/mnt")
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn clone_flags_accumulate() {
        use nix::sched::CloneFlags;
        let flags = clone_flags(&[Namespace::Pid, Namespace::Net]);
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_namespace_ids_are_readable() {
        let pid = std::process::id() as i32;
        let id = namespace_id(pid, Namespace::Net).unwrap();
        assert!(id.starts_with("net:["));
    }
}
