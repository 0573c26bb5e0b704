//! One-shot synchronization barriers across fork boundaries.
//!
//! The host side and the namespaced child never share memory; each
//! bring-up gate is a blocking pipe carrying one tagged outcome,
//! `Ready(payload)` or `Failed(stage, errno)`. The reader cannot proceed
//! past a gate before the writer has either completed the stage or
//! reported its failure.

use std::os::fd::{AsFd, OwnedFd};
use std::time::Duration;

use vessel_common::error::{EngineError, Result};
use vessel_common::stage::Stage;

/// Wire size of one barrier message: tag, stage, i32 value.
const MESSAGE_LEN: usize = 6;

const TAG_READY: u8 = 1;
const TAG_FAILED: u8 = 2;

/// Outcome reported through a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The stage completed; `payload` carries a small integer such as a
    /// pid, or zero when nothing needs to be conveyed.
    Ready {
        /// Integer payload (pid or zero).
        payload: i32,
    },
    /// The stage failed with the given OS error code.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Raw OS error code captured at the failure site.
        errno: i32,
    },
}

impl Outcome {
    fn encode(self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        match self {
            Self::Ready { payload } => {
                buf[0] = TAG_READY;
                buf[2..6].copy_from_slice(&payload.to_le_bytes());
            }
            Self::Failed { stage, errno } => {
                buf[0] = TAG_FAILED;
                buf[1] = stage.as_u8();
                buf[2..6].copy_from_slice(&errno.to_le_bytes());
            }
        }
        buf
    }

    fn decode(buf: &[u8; MESSAGE_LEN]) -> Result<Self> {
        let value = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        match buf[0] {
            TAG_READY => Ok(Self::Ready { payload: value }),
            TAG_FAILED => {
                let stage = Stage::from_u8(buf[1]).ok_or_else(|| EngineError::Config {
                    message: format!("unknown barrier stage byte {}", buf[1]),
                })?;
                Ok(Self::Failed {
                    stage,
                    errno: value,
                })
            }
            tag => Err(EngineError::Config {
                message: format!("unknown barrier tag byte {tag}"),
            }),
        }
    }
}

/// A pipe pair created before fork; each side keeps one end.
pub struct Barrier {
    read: OwnedFd,
    write: OwnedFd,
}

impl Barrier {
    /// Opens the underlying pipe with close-on-exec set on both ends.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if `pipe2(2)` fails.
    pub fn new() -> Result<Self> {
        let (read, write) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| {
                EngineError::ProcessSetup {
                    message: format!("pipe2() failed: {e}"),
                    errno: Some(e as i32),
                }
            })?;
        Ok(Self { read, write })
    }

    /// Keeps the read end; the write end is closed. Call in the process
    /// that waits on the gate.
    #[must_use]
    pub fn into_reader(self) -> BarrierReader {
        BarrierReader { fd: self.read }
    }

    /// Keeps the write end; the read end is closed. Call in the process
    /// that reports the gate outcome.
    #[must_use]
    pub fn into_writer(self) -> BarrierWriter {
        BarrierWriter { fd: self.write }
    }

    /// Splits into both halves inside one process.
    ///
    /// Used before a fork so each side can keep its half and drop the
    /// other, and by tests standing in for the forked peer.
    #[must_use]
    pub fn split(self) -> (BarrierReader, BarrierWriter) {
        (
            BarrierReader { fd: self.read },
            BarrierWriter { fd: self.write },
        )
    }
}

/// Waiting side of a barrier.
pub struct BarrierReader {
    fd: OwnedFd,
}

impl BarrierReader {
    /// Blocks until the peer reports an outcome.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if the peer closed its end without
    /// reporting (it died before reaching the gate) or the read fails.
    pub fn wait(&self) -> Result<Outcome> {
        self.wait_or_closed()?.ok_or_else(|| EngineError::ProcessSetup {
            message: "barrier peer exited before signalling".into(),
            errno: None,
        })
    }

    /// Like [`Self::wait`], but a cleanly closed peer yields `Ok(None)`
    /// instead of an error. The final bring-up gate uses this: the
    /// status pipe is close-on-exec, so end-of-file is the exec-success
    /// signal.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if the read itself fails.
    pub fn wait_or_closed(&self) -> Result<Option<Outcome>> {
        let mut buf = [0u8; MESSAGE_LEN];
        let mut filled = 0;
        while filled < MESSAGE_LEN {
            match nix::unistd::read(self.fd.as_fd(), &mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(EngineError::ProcessSetup {
                        message: "barrier peer exited mid-message".into(),
                        errno: None,
                    });
                }
                Ok(n) => filled += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    return Err(EngineError::ProcessSetup {
                        message: format!("barrier read failed: {e}"),
                        errno: Some(e as i32),
                    });
                }
            }
        }
        Outcome::decode(&buf).map(Some)
    }

    /// Blocks until the peer reports an outcome or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error on timeout, peer death, or a failed
    /// poll/read.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Outcome> {
        use nix::poll::{PollFd, PollFlags, PollTimeout};

        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];

        loop {
            match nix::poll::poll(&mut fds, poll_timeout) {
                Ok(0) => {
                    return Err(EngineError::ProcessSetup {
                        message: format!(
                            "barrier wait timed out after {}ms",
                            timeout.as_millis()
                        ),
                        errno: None,
                    });
                }
                Ok(_) => return self.wait(),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    return Err(EngineError::ProcessSetup {
                        message: format!("barrier poll failed: {e}"),
                        errno: Some(e as i32),
                    });
                }
            }
        }
    }
}

/// Reporting side of a barrier.
pub struct BarrierWriter {
    fd: OwnedFd,
}

impl BarrierWriter {
    /// Reports a completed stage with an integer payload.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if the write fails.
    pub fn signal_ready(&self, payload: i32) -> Result<()> {
        self.send(Outcome::Ready { payload })
    }

    /// Reports a failed stage with the OS error code captured there.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if the write fails.
    pub fn signal_failure(&self, stage: Stage, errno: i32) -> Result<()> {
        self.send(Outcome::Failed { stage, errno })
    }

    fn send(&self, outcome: Outcome) -> Result<()> {
        let buf = outcome.encode();
        let mut written = 0;
        while written < MESSAGE_LEN {
            match nix::unistd::write(self.fd.as_fd(), &buf[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    return Err(EngineError::ProcessSetup {
                        message: format!("barrier write failed: {e}"),
                        errno: Some(e as i32),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_outcome_crosses_the_pipe() {
        let barrier = Barrier::new().unwrap();
        let (reader, writer) = split(barrier);
        writer.signal_ready(4242).unwrap();
        assert_eq!(reader.wait().unwrap(), Outcome::Ready { payload: 4242 });
    }

    #[test]
    fn failure_carries_stage_and_errno() {
        let barrier = Barrier::new().unwrap();
        let (reader, writer) = split(barrier);
        writer
            .signal_failure(Stage::MountsConfigured, libc::ENOENT)
            .unwrap();
        assert_eq!(
            reader.wait().unwrap(),
            Outcome::Failed {
                stage: Stage::MountsConfigured,
                errno: libc::ENOENT,
            }
        );
    }

    #[test]
    fn peer_death_is_an_error_not_a_hang() {
        let barrier = Barrier::new().unwrap();
        let (reader, writer) = split(barrier);
        drop(writer);
        let err = reader.wait().unwrap_err();
        assert!(matches!(err, EngineError::ProcessSetup { .. }));
    }

    #[test]
    fn timeout_expires_on_silent_peer() {
        let barrier = Barrier::new().unwrap();
        let (reader, _writer) = split(barrier);
        let err = reader.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn garbage_tag_is_rejected() {
        let err = Outcome::decode(&[9, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    fn split(barrier: Barrier) -> (BarrierReader, BarrierWriter) {
        barrier.split()
    }
}
