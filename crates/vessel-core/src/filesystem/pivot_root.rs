//! Root switch into the container filesystem.
//!
//! `pivot_root(2)` with the old root detached afterwards, so no
//! reference to the host filesystem survives inside the container.

use std::path::Path;

use vessel_common::error::{EngineError, Result};

/// Mount point for the previous root inside the new one, removed after
/// the switch.
pub const OLD_ROOT: &str = ".oldroot";

/// Switches the mount namespace's root to `new_root`.
///
/// The new root is bind-mounted onto itself first (`pivot_root(2)`
/// requires the new root to be a mount point), the old root lands on
/// `<new_root>/.oldroot` and is lazily detached, and the working
/// directory ends at the new `/`.
///
/// # Errors
///
/// Returns a filesystem-setup error if any step fails. Steps already
/// performed are not undone; the caller abandons the mount namespace on
/// error.
#[cfg(target_os = "linux")]
pub fn pivot_into_root(new_root: &Path) -> Result<()> {
    use crate::filesystem::mount::{MountFlag, mount_filesystem, unmount};

    mount_filesystem(new_root, new_root, "", &[MountFlag::Bind, MountFlag::Recursive], "")?;

    let old_root = new_root.join(OLD_ROOT);
    std::fs::create_dir_all(&old_root).map_err(|e| EngineError::FilesystemSetup {
        message: format!("create {} failed: {e}", old_root.display()),
        errno: e.raw_os_error(),
    })?;

    nix::unistd::pivot_root(new_root, &old_root).map_err(|e| EngineError::FilesystemSetup {
        message: format!("pivot_root({}) failed: {e}", new_root.display()),
        errno: Some(e as i32),
    })?;

    nix::unistd::chdir("/").map_err(|e| EngineError::FilesystemSetup {
        message: format!("chdir(/) failed: {e}"),
        errno: Some(e as i32),
    })?;

    let old_inside = Path::new("/").join(OLD_ROOT);
    unmount(&old_inside, true)?;
    if let Err(e) = std::fs::remove_dir(&old_inside) {
        tracing::warn!(path = %old_inside.display(), error = %e, "old root directory left behind");
    }

    tracing::debug!(root = %new_root.display(), "pivoted into container root");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — `pivot_root(2)` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_into_root(_new_root: &Path) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for root switching".into(),
    })
}

#[cfg(test)]
mod tests {
    #[cfg(target_os = "linux")]
    #[test]
    fn pivot_from_unprivileged_process_fails_cleanly() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let err = super::pivot_into_root(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            vessel_common::error::EngineError::FilesystemSetup { .. }
        ));
    }
}
