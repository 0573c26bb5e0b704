//! Pseudo-terminal allocation and wiring.
//!
//! The host side keeps the master descriptors and relays bytes; the
//! guest side promotes one pty to the controlling terminal of init and
//! redirects the standard streams onto it.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use vessel_common::error::{EngineError, Result};

/// One allocated pty pair.
#[derive(Debug)]
pub struct Terminal {
    /// Host-side master descriptor.
    pub master: OwnedFd,
    /// Guest-side slave descriptor, inherited across the fork.
    pub slave: OwnedFd,
    /// Path of the slave device (`/dev/pts/N`).
    pub pts_path: PathBuf,
}

/// Opens `count` pty pairs.
///
/// No partial allocation survives failure: descriptors already opened
/// are closed when the partially filled vector is dropped.
///
/// # Errors
///
/// Returns a terminal-setup error if `openpty(3)` or slave-path
/// resolution fails.
#[cfg(target_os = "linux")]
pub fn allocate(count: usize) -> Result<Vec<Terminal>> {
    let mut terminals = Vec::with_capacity(count);
    for index in 0..count {
        let pty = nix::pty::openpty(None, None).map_err(|e| EngineError::TerminalSetup {
            message: format!("openpty() for terminal {index} failed: {e}"),
            errno: Some(e as i32),
        })?;
        let pts_path = nix::unistd::ttyname(pty.slave.as_fd()).map_err(|e| {
            EngineError::TerminalSetup {
                message: format!("ttyname() for terminal {index} failed: {e}"),
                errno: Some(e as i32),
            }
        })?;
        // The master must not leak into the exec'd init process.
        nix::fcntl::fcntl(
            pty.master.as_fd(),
            nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
        )
        .map_err(|e| EngineError::TerminalSetup {
            message: format!("fcntl(FD_CLOEXEC) for terminal {index} failed: {e}"),
            errno: Some(e as i32),
        })?;
        terminals.push(Terminal {
            master: pty.master,
            slave: pty.slave,
            pts_path,
        });
    }
    tracing::debug!(count, "terminals allocated");
    Ok(terminals)
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — pty allocation requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn allocate(_count: usize) -> Result<Vec<Terminal>> {
    Err(EngineError::Config {
        message: "Linux required for terminal allocation".into(),
    })
}

/// Promotes the pty behind `slave` to the controlling terminal of the
/// calling process and redirects stdin/stdout/stderr onto it.
///
/// Runs inside the new namespaces, before exec, on a descriptor
/// inherited across the fork. The process becomes a session leader
/// first; `TIOCSCTTY` then binds the pty to the session.
///
/// # Errors
///
/// Returns a terminal-setup error if the descriptor is not a terminal
/// or any of setsid/ioctl/dup2 fail.
#[cfg(target_os = "linux")]
pub fn setup_guest_terminal(slave: BorrowedFd<'_>) -> Result<()> {
    let fd = slave.as_raw_fd();

    if !nix::unistd::isatty(slave).unwrap_or(false) {
        return Err(EngineError::TerminalSetup {
            message: format!("descriptor {fd} is not a terminal"),
            errno: None,
        });
    }

    let _session = crate::credentials::new_session().map_err(|e| EngineError::TerminalSetup {
        message: format!("session leader promotion failed: {e}"),
        errno: e.errno(),
    })?;

    // SAFETY: fd is a valid open slave pty descriptor for the duration
    // of the borrow.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSCTTY, 0) };
    if rc < 0 {
        let e = nix::errno::Errno::last();
        return Err(EngineError::TerminalSetup {
            message: format!("ioctl(TIOCSCTTY) failed: {e}"),
            errno: Some(e as i32),
        });
    }

    for stdio in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are valid; dup2 onto the standard
        // streams is the intended redirection.
        let rc = unsafe { libc::dup2(fd, stdio) };
        if rc < 0 {
            let e = nix::errno::Errno::last();
            return Err(EngineError::TerminalSetup {
                message: format!("dup2({fd}, {stdio}) failed: {e}"),
                errno: Some(e as i32),
            });
        }
    }

    tracing::debug!(fd, "controlling terminal attached");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — terminal wiring requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn setup_guest_terminal(_slave: BorrowedFd<'_>) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for terminal wiring".into(),
    })
}

/// Relays bytes bidirectionally between a pty master and a pair of host
/// descriptors until either side hangs up.
///
/// Blocking poll loop; the caller dedicates a thread to it for as long
/// as the console is attached.
///
/// # Errors
///
/// Returns a terminal-setup error if poll or a read/write fails for a
/// reason other than hangup.
#[cfg(target_os = "linux")]
pub fn relay(master: BorrowedFd<'_>, input: BorrowedFd<'_>, output: BorrowedFd<'_>) -> Result<()> {
    use nix::poll::{PollFd, PollFlags, PollTimeout};

    let mut buf = [0u8; 4096];
    loop {
        let mut fds = [
            PollFd::new(master, PollFlags::POLLIN),
            PollFd::new(input, PollFlags::POLLIN),
        ];
        match nix::poll::poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                return Err(EngineError::TerminalSetup {
                    message: format!("console poll failed: {e}"),
                    errno: Some(e as i32),
                });
            }
        }

        let master_events = fds[0].revents().unwrap_or(PollFlags::empty());
        let input_events = fds[1].revents().unwrap_or(PollFlags::empty());

        if master_events.contains(PollFlags::POLLIN)
            && !pump(master, output, &mut buf)?
        {
            return Ok(());
        }
        if input_events.contains(PollFlags::POLLIN) && !pump(input, master, &mut buf)? {
            return Ok(());
        }
        if master_events.contains(PollFlags::POLLHUP) || input_events.contains(PollFlags::POLLHUP)
        {
            return Ok(());
        }
    }
}

/// Copies one chunk from `from` to `to`; `Ok(false)` signals EOF.
#[cfg(target_os = "linux")]
fn pump(from: BorrowedFd<'_>, to: BorrowedFd<'_>, buf: &mut [u8]) -> Result<bool> {
    let read = match nix::unistd::read(from, buf) {
        Ok(0) => return Ok(false),
        Ok(n) => n,
        Err(nix::errno::Errno::EINTR) => return Ok(true),
        // The peer side of a pty going away surfaces as EIO.
        Err(nix::errno::Errno::EIO) => return Ok(false),
        Err(e) => {
            return Err(EngineError::TerminalSetup {
                message: format!("console read failed: {e}"),
                errno: Some(e as i32),
            });
        }
    };

    let mut written = 0;
    while written < read {
        match nix::unistd::write(to, &buf[written..read]) {
            Ok(n) => written += n,
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                return Err(EngineError::TerminalSetup {
                    message: format!("console write failed: {e}"),
                    errno: Some(e as i32),
                });
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn allocation_yields_distinct_pts_paths() {
        let terminals = allocate(2).unwrap();
        assert_eq!(terminals.len(), 2);
        assert_ne!(terminals[0].pts_path, terminals[1].pts_path);
        for terminal in &terminals {
            assert!(terminal.pts_path.starts_with("/dev/pts"));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zero_terminals_is_valid() {
        assert!(allocate(0).unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn master_and_slave_are_connected() {
        let terminals = allocate(1).unwrap();
        let terminal = &terminals[0];
        nix::unistd::write(terminal.master.as_fd(), b"ping\n").unwrap();
        let mut buf = [0u8; 16];
        let n = nix::unistd::read(terminal.slave.as_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping\n");
    }
}
