//! Process spawning and supervision primitives.
//!
//! The engine runs its guard, init, and attach helpers as real OS
//! processes. This module wraps `clone(2)` (for namespace-carrying
//! spawns), `fork(2)`, `execv(2)`, and `waitpid(2)` with the workspace
//! error taxonomy.

use std::ffi::CString;

use vessel_common::error::{EngineError, Result};

use crate::namespace::Namespace;

/// Stack size handed to `clone(2)` children.
#[cfg(target_os = "linux")]
const CHILD_STACK_SIZE: usize = 1024 * 1024;

#[cfg(target_os = "linux")]
extern "C" fn clone_trampoline(arg: *mut libc::c_void) -> libc::c_int {
    // SAFETY: arg is the leaked Box created by clone_with_namespaces;
    // the child owns its copy of it exclusively.
    let mut entry = unsafe { Box::from_raw(arg.cast::<Box<dyn FnMut() -> isize>>()) };
    entry() as libc::c_int
}

/// Spawns a child process carrying new namespaces of the given kinds.
///
/// The child starts in `entry` on its own stack; its return value
/// becomes the child's exit status. `SIGCHLD` is requested so the
/// child can be reaped with `waitpid(2)`. The parent's copy of `entry`
/// (and every descriptor it captured) is released before returning, so
/// pipe ends moved into the closure behave as if handed to the child.
///
/// # Errors
///
/// Returns a process-setup error if `clone(2)` fails.
#[cfg(target_os = "linux")]
pub fn clone_with_namespaces(
    kinds: &[Namespace],
    entry: Box<dyn FnMut() -> isize>,
) -> Result<nix::unistd::Pid> {
    let flags = crate::namespace::clone_flags(kinds);
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // The stack grows down; hand clone the 16-byte-aligned top.
    let stack_top =
        // SAFETY: offset stays within the allocation.
        ((unsafe { stack.as_mut_ptr().add(stack.len()) } as usize) & !0xf) as *mut libc::c_void;

    let arg = Box::into_raw(Box::new(entry));
    // SAFETY: the trampoline and argument stay valid for the child's
    // lifetime (the child gets its own copy of the address space; no
    // CLONE_VM is requested).
    let rc = unsafe {
        libc::clone(
            clone_trampoline,
            stack_top,
            flags.bits() | libc::SIGCHLD,
            arg.cast::<libc::c_void>(),
        )
    };
    // Reclaim the parent's copy either way: on success the child works
    // on its own duplicate, and dropping ours closes the child-side
    // pipe ends in the parent's descriptor table.
    // SAFETY: arg came from Box::into_raw above and is not used again.
    drop(unsafe { Box::from_raw(arg) });

    if rc < 0 {
        let e = nix::errno::Errno::last();
        return Err(EngineError::ProcessSetup {
            message: format!("clone({flags:?}) failed: {e}"),
            errno: Some(e as i32),
        });
    }

    tracing::debug!(pid = rc, ?kinds, "namespaced child spawned");
    Ok(nix::unistd::Pid::from_raw(rc))
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — namespaced spawn requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn clone_with_namespaces(
    _kinds: &[Namespace],
    _entry: Box<dyn FnMut() -> isize>,
) -> Result<nix::unistd::Pid> {
    Err(EngineError::Config {
        message: "Linux required for namespaced process spawn".into(),
    })
}

/// Forks the calling process.
///
/// # Errors
///
/// Returns a process-setup error if `fork(2)` fails.
///
/// # Safety
///
/// The caller must uphold the usual post-fork constraints: the child may
/// only call async-signal-safe functions until it execs or exits.
pub unsafe fn fork_process() -> Result<nix::unistd::ForkResult> {
    // SAFETY: forwarded to the caller per the function contract.
    unsafe { nix::unistd::fork() }.map_err(|e| EngineError::ProcessSetup {
        message: format!("fork() failed: {e}"),
        errno: Some(e as i32),
    })
}

/// Replaces the current process image with `argv[0]`.
///
/// # Errors
///
/// Returns a process-setup error if the argv is empty, contains interior
/// NUL bytes, or `execv(2)` fails. On success this function does not
/// return.
pub fn exec_program(argv: &[String]) -> Result<std::convert::Infallible> {
    let [program, ..] = argv else {
        return Err(EngineError::Config {
            message: "exec requires a non-empty argv".into(),
        });
    };

    let c_argv: Vec<CString> = argv
        .iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|_| EngineError::Config {
                message: format!("argument contains NUL byte: {arg:?}"),
            })
        })
        .collect::<Result<_>>()?;

    let err = match nix::unistd::execv(&c_argv[0], &c_argv) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    Err(EngineError::ProcessSetup {
        message: format!("execv({program}) failed: {err}"),
        errno: Some(err as i32),
    })
}

/// Waits for a child to terminate, retrying on `EINTR`.
///
/// Returns the child's exit status, or `128 + signal` if it was killed
/// by a signal, mirroring shell conventions.
///
/// # Errors
///
/// Returns a process-setup error if `waitpid(2)` fails.
pub fn wait_for_exit(pid: nix::unistd::Pid) -> Result<i32> {
    use nix::sys::wait::WaitStatus;

    loop {
        match nix::sys::wait::waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, status)) => return Ok(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                return Err(EngineError::ProcessSetup {
                    message: format!("waitpid({pid}) failed: {e}"),
                    errno: Some(e as i32),
                });
            }
        }
    }
}

/// Non-blocking check whether a child has exited.
///
/// Returns `Some(status)` once the child is reaped, `None` while it is
/// still running.
///
/// # Errors
///
/// Returns a process-setup error if `waitpid(2)` fails.
pub fn try_wait_exit(pid: nix::unistd::Pid) -> Result<Option<i32>> {
    use nix::sys::wait::{WaitPidFlag, WaitStatus};

    match nix::sys::wait::waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Ok(None),
        Ok(WaitStatus::Exited(_, status)) => Ok(Some(status)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(128 + signal as i32)),
        Ok(_) => Ok(None),
        Err(nix::errno::Errno::EINTR) => Ok(None),
        Err(e) => Err(EngineError::ProcessSetup {
            message: format!("waitpid({pid}, WNOHANG) failed: {e}"),
            errno: Some(e as i32),
        }),
    }
}

/// Sends a signal to a process.
///
/// # Errors
///
/// Returns a process-setup error if `kill(2)` fails.
pub fn send_signal(pid: nix::unistd::Pid, signal: nix::sys::signal::Signal) -> Result<()> {
    nix::sys::signal::kill(pid, signal).map_err(|e| EngineError::ProcessSetup {
        message: format!("kill({pid}, {signal}) failed: {e}"),
        errno: Some(e as i32),
    })
}

/// Whether a process is still alive (signal 0 probe).
#[must_use]
pub fn is_alive(pid: nix::unistd::Pid) -> bool {
    nix::sys::signal::kill(pid, None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_rejects_empty_argv() {
        let err = exec_program(&[]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn exec_rejects_interior_nul() {
        let err = exec_program(&["/bin/e\0cho".into()]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn exec_missing_binary_reports_errno() {
        let err = exec_program(&["/nonexistent/vessel-test-binary".into()]).unwrap_err();
        match err {
            EngineError::ProcessSetup { errno, .. } => {
                assert_eq!(errno, Some(libc::ENOENT));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wait_reaps_forked_child() {
        // SAFETY: the child only calls _exit.
        match unsafe { fork_process() }.unwrap() {
            nix::unistd::ForkResult::Child => unsafe { libc::_exit(7) },
            nix::unistd::ForkResult::Parent { child } => {
                assert_eq!(wait_for_exit(child).unwrap(), 7);
            }
        }
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(nix::unistd::getpid()));
    }
}
