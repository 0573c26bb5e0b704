//! Credential dropping for containers and attach helpers.
//!
//! Group identity is set before user identity: once the uid is dropped
//! the process can no longer change its gid.

use nix::unistd::{Gid, Uid};
use vessel_common::error::{EngineError, Result};

/// Sets the supplementary group list.
///
/// # Errors
///
/// Returns a credential-setup error if `setgroups(2)` fails.
pub fn set_supplementary_groups(gids: &[u32]) -> Result<()> {
    let groups: Vec<Gid> = gids.iter().map(|gid| Gid::from_raw(*gid)).collect();
    nix::unistd::setgroups(&groups).map_err(|e| EngineError::CredentialSetup {
        message: format!("setgroups({gids:?}) failed: {e}"),
        errno: Some(e as i32),
    })
}

/// Sets the real, effective, and saved group IDs.
///
/// # Errors
///
/// Returns a credential-setup error if `setresgid(2)` fails.
pub fn set_gid(gid: u32) -> Result<()> {
    let gid = Gid::from_raw(gid);
    nix::unistd::setresgid(gid, gid, gid).map_err(|e| EngineError::CredentialSetup {
        message: format!("setresgid({gid}) failed: {e}"),
        errno: Some(e as i32),
    })
}

/// Sets the real, effective, and saved user IDs. Irreversible.
///
/// # Errors
///
/// Returns a credential-setup error if `setresuid(2)` fails.
pub fn set_uid(uid: u32) -> Result<()> {
    let uid = Uid::from_raw(uid);
    nix::unistd::setresuid(uid, uid, uid).map_err(|e| EngineError::CredentialSetup {
        message: format!("setresuid({uid}) failed: {e}"),
        errno: Some(e as i32),
    })
}

/// Drops to the target identity: supplementary groups, then gid, then
/// uid, in that order. Fails fast on the first error; no retry.
///
/// # Errors
///
/// Returns a credential-setup error from the first failing syscall.
pub fn drop_credentials(gid: u32, uid: u32, supplementary: &[u32]) -> Result<()> {
    set_supplementary_groups(supplementary)?;
    set_gid(gid)?;
    set_uid(uid)?;
    tracing::debug!(uid, gid, "credentials dropped");
    Ok(())
}

/// Starts a new session with the calling process as leader.
///
/// # Errors
///
/// Returns a credential-setup error if `setsid(2)` fails (the caller is
/// already a process group leader).
pub fn new_session() -> Result<nix::unistd::Pid> {
    nix::unistd::setsid().map_err(|e| EngineError::CredentialSetup {
        message: format!("setsid() failed: {e}"),
        errno: Some(e as i32),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_setgroups_is_rejected() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let err = set_supplementary_groups(&[0]).unwrap_err();
        assert!(matches!(err, EngineError::CredentialSetup { .. }));
        assert_eq!(err.errno(), Some(libc::EPERM));
    }

    #[test]
    fn setting_current_ids_is_a_no_op() {
        // Setting the identity we already have succeeds for any user.
        set_gid(nix::unistd::getgid().as_raw()).unwrap();
        set_uid(nix::unistd::getuid().as_raw()).unwrap();
    }
}
