//! Mount operations for container filesystem setup.
//!
//! Applies the configured mount list inside the container's mount
//! namespace and tears it down in reverse order on rollback.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};

/// Mount flags the configuration surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountFlag {
    /// Bind an existing tree instead of mounting a filesystem.
    Bind,
    /// Apply the operation recursively.
    Recursive,
    /// Mount read-only.
    ReadOnly,
    /// Disallow set-user-ID execution.
    NoSuid,
    /// Disallow device nodes.
    NoDev,
    /// Disallow program execution.
    NoExec,
    /// Make the mount point private to this namespace.
    Private,
    /// Make the mount point a slave of its host counterpart.
    Slave,
}

#[cfg(target_os = "linux")]
fn to_ms_flags(flags: &[MountFlag]) -> nix::mount::MsFlags {
    use nix::mount::MsFlags;
    flags.iter().fold(MsFlags::empty(), |acc, flag| {
        acc | match flag {
            MountFlag::Bind => MsFlags::MS_BIND,
            MountFlag::Recursive => MsFlags::MS_REC,
            MountFlag::ReadOnly => MsFlags::MS_RDONLY,
            MountFlag::NoSuid => MsFlags::MS_NOSUID,
            MountFlag::NoDev => MsFlags::MS_NODEV,
            MountFlag::NoExec => MsFlags::MS_NOEXEC,
            MountFlag::Private => MsFlags::MS_PRIVATE,
            MountFlag::Slave => MsFlags::MS_SLAVE,
        }
    })
}

/// One entry of a container's mount list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount source: a device, filesystem keyword, or bind source path.
    pub source: PathBuf,
    /// Target path, relative to the container root.
    pub target: PathBuf,
    /// Filesystem type ("proc", "sysfs", "tmpfs", ... or empty for binds).
    pub fstype: String,
    /// Mount flags.
    pub flags: Vec<MountFlag>,
    /// Filesystem-specific data string.
    pub data: String,
}

/// Performs one `mount(2)` call.
///
/// # Errors
///
/// Returns a filesystem-setup error if the syscall fails.
#[cfg(target_os = "linux")]
pub fn mount_filesystem(
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: &[MountFlag],
    data: &str,
) -> Result<()> {
    let fstype_opt = (!fstype.is_empty()).then_some(fstype);
    let data_opt = (!data.is_empty()).then_some(data);
    nix::mount::mount(Some(source), target, fstype_opt, to_ms_flags(flags), data_opt).map_err(
        |e| EngineError::FilesystemSetup {
            message: format!(
                "mount {} on {} ({fstype}) failed: {e}",
                source.display(),
                target.display()
            ),
            errno: Some(e as i32),
        },
    )?;
    tracing::debug!(source = %source.display(), target = %target.display(), fstype, "mounted");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn mount_filesystem(
    _source: &Path,
    _target: &Path,
    _fstype: &str,
    _flags: &[MountFlag],
    _data: &str,
) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for mount operations".into(),
    })
}

/// Unmounts a target, optionally with lazy detach.
///
/// # Errors
///
/// Returns a filesystem-setup error if `umount2(2)` fails.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path, detach: bool) -> Result<()> {
    use nix::mount::MntFlags;
    let flags = if detach {
        MntFlags::MNT_DETACH
    } else {
        MntFlags::empty()
    };
    nix::mount::umount2(target, flags).map_err(|e| EngineError::FilesystemSetup {
        message: format!("umount {} failed: {e}", target.display()),
        errno: Some(e as i32),
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path, _detach: bool) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for mount operations".into(),
    })
}

/// Applies a container's mount list under `root`, in order.
///
/// Returns the absolute target paths of every mount that succeeded so
/// the caller can roll them back in reverse order. Sources of bind
/// mounts are checked for existence up front so a bad configuration
/// fails before touching the mount table.
///
/// # Errors
///
/// Returns a filesystem-setup error for a missing bind source, an
/// uncreatable target directory, or a failing `mount(2)`; mounts
/// applied before the failure are reported back through `rollback`.
pub fn apply_mounts(root: &Path, mounts: &[MountConfig]) -> Result<Vec<PathBuf>> {
    let mut applied: Vec<PathBuf> = Vec::with_capacity(mounts.len());

    for entry in mounts {
        let is_bind = entry.flags.contains(&MountFlag::Bind);
        if is_bind && !entry.source.exists() {
            rollback_mounts(&applied);
            return Err(EngineError::FilesystemSetup {
                message: format!("bind source {} does not exist", entry.source.display()),
                errno: Some(libc::ENOENT),
            });
        }

        let target = root.join(entry.target.strip_prefix("/").unwrap_or(&entry.target));
        if let Err(e) = std::fs::create_dir_all(&target) {
            rollback_mounts(&applied);
            return Err(EngineError::FilesystemSetup {
                message: format!("create mount target {} failed: {e}", target.display()),
                errno: e.raw_os_error(),
            });
        }

        if let Err(e) = mount_filesystem(
            &entry.source,
            &target,
            &entry.fstype,
            &entry.flags,
            &entry.data,
        ) {
            rollback_mounts(&applied);
            return Err(e);
        }
        applied.push(target);
    }

    Ok(applied)
}

/// Unmounts previously applied targets in reverse order, best-effort.
///
/// Rollback failures are logged and never replace the original error
/// the caller is already propagating.
pub fn rollback_mounts(applied: &[PathBuf]) {
    for target in applied.iter().rev() {
        if let Err(e) = unmount(target, true) {
            tracing::warn!(target = %target.display(), error = %e, "rollback unmount failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_bind_source_is_a_filesystem_error() {
        let root = tempfile::tempdir().unwrap();
        let mounts = [MountConfig {
            source: PathBuf::from("/nonexistent/vessel-src"),
            target: PathBuf::from("/data"),
            fstype: String::new(),
            flags: vec![MountFlag::Bind],
            data: String::new(),
        }];
        let err = apply_mounts(root.path(), &mounts).unwrap_err();
        assert!(matches!(err, EngineError::FilesystemSetup { .. }));
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn targets_resolve_under_the_root() {
        let root = tempfile::tempdir().unwrap();
        // An empty mount list applies cleanly and reports nothing to
        // roll back.
        assert!(apply_mounts(root.path(), &[]).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn flags_translate_to_ms_flags() {
        use nix::mount::MsFlags;
        let flags = to_ms_flags(&[MountFlag::Bind, MountFlag::ReadOnly, MountFlag::Recursive]);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_REC));
    }

    #[test]
    fn rollback_of_nothing_is_quiet() {
        rollback_mounts(&[]);
    }
}
