//! The guard process.
//!
//! Every container is supervised by a dedicated guard: a fork of the
//! engine process that clones init with the namespace create-flags,
//! drives the host side of the bring-up sequence, reports the outcome
//! to the engine over a one-shot barrier, and then blocks on init's
//! lifecycle. When init exits the guard writes the exit status to its
//! status pipe and terminates; the namespaces die with init.

use std::os::fd::AsRawFd;

use vessel_common::error::{EngineError, Result};
use vessel_common::stage::Stage;
use vessel_core::barrier::{Barrier, BarrierReader, BarrierWriter};
use vessel_core::process;
use vessel_core::terminal::Terminal;

use crate::config::ContainerConfig;
use crate::sequencer::{ChildPlan, HostSequencer};

/// Engine-side handles onto a spawned guard.
pub(crate) struct GuardHandles {
    /// Guard process id.
    pub pid: nix::unistd::Pid,
    /// Bring-up outcome: `Ready(init_pid)` or `Failed(stage, errno)`.
    pub result: BarrierReader,
    /// Init exit report: `Ready(exit_status)` once init dies.
    pub exit: BarrierReader,
}

/// Forks the guard for one container.
///
/// The caller keeps the read ends; the guard process never returns into
/// the caller's frames.
///
/// # Errors
///
/// Returns a process-setup error if the pipes or the fork fail.
pub(crate) fn spawn_guard(
    config: &ContainerConfig,
    terminals: &[Terminal],
) -> Result<GuardHandles> {
    let (result_reader, result_writer) = Barrier::new()?.split();
    let (exit_reader, exit_writer) = Barrier::new()?.split();

    // SAFETY: the guard child only uses its own copies of the handles
    // and exits via process::exit; it never unwinds into caller frames.
    match unsafe { process::fork_process() }? {
        nix::unistd::ForkResult::Parent { child } => {
            drop(result_writer);
            drop(exit_writer);
            Ok(GuardHandles {
                pid: child,
                result: result_reader,
                exit: exit_reader,
            })
        }
        nix::unistd::ForkResult::Child => {
            drop(result_reader);
            drop(exit_reader);
            let code = guard_main(config, terminals, &result_writer, &exit_writer);
            std::process::exit(code);
        }
    }
}

/// Body of the guard process. Returns its exit code.
fn guard_main(
    config: &ContainerConfig,
    terminals: &[Terminal],
    result: &BarrierWriter,
    exit: &BarrierWriter,
) -> i32 {
    tracing::debug!(container = %config.name, "guard started");

    let barriers = match (Barrier::new(), Barrier::new(), Barrier::new()) {
        (Ok(status), Ok(maps), Ok(network)) => (status, maps, network),
        _ => {
            let _ = result.signal_failure(Stage::NamespacesEntered, libc::EMFILE);
            return 1;
        }
    };
    let (status_reader, status_writer) = barriers.0.split();
    let (maps_reader, maps_writer) = barriers.1.split();
    let (network_reader, network_writer) = barriers.2.split();

    let mut plan = Some(ChildPlan {
        config: config.clone(),
        terminal_slave: terminals.first().map(|t| t.slave.as_raw_fd()),
        status: status_writer,
        maps_gate: maps_reader,
        network_gate: network_reader,
    });

    let init_pid = match process::clone_with_namespaces(
        &config.namespaces.create_kinds(),
        Box::new(move || plan.take().map_or(1, crate::sequencer::run_child)),
    ) {
        Ok(pid) => pid,
        Err(e) => {
            tracing::error!(error = %e, "init clone failed");
            let _ = result.signal_failure(Stage::NamespacesEntered, e.errno().unwrap_or(0));
            return 1;
        }
    };

    let mut sequencer = HostSequencer::new(
        config,
        init_pid.as_raw(),
        status_reader,
        maps_writer,
        network_writer,
    );

    if let Err(e) = sequencer.drive() {
        tracing::error!(error = %e, "bring-up failed, collecting init");
        let _ = process::send_signal(init_pid, nix::sys::signal::Signal::SIGKILL);
        let _ = process::wait_for_exit(init_pid);
        let _ = result.signal_failure(wire_stage(&e), e.errno().unwrap_or(0));
        return 1;
    }

    // Bring-up complete; hand the init pid back and supervise.
    if result.signal_ready(init_pid.as_raw()).is_err() {
        // The engine is gone; nothing left to supervise for.
        let _ = process::send_signal(init_pid, nix::sys::signal::Signal::SIGKILL);
        let _ = process::wait_for_exit(init_pid);
        return 1;
    }

    let exit_status = process::wait_for_exit(init_pid).unwrap_or(-1);
    tracing::debug!(container = %config.name, exit_status, "init exited");
    let _ = exit.signal_ready(exit_status);
    0
}

/// Maps an error back to the stage byte carried on the result barrier.
///
/// The round trip through [`EngineError::from_stage`] on the engine
/// side restores the same error kind.
fn wire_stage(err: &EngineError) -> Stage {
    match err {
        EngineError::EnvironmentSetup { .. } => Stage::HostnameSet,
        EngineError::FilesystemSetup { .. } => Stage::MountsConfigured,
        EngineError::Network { .. } => Stage::NetworkPlaced,
        EngineError::CapabilitySetup { .. } => Stage::CapabilitiesTrimmed,
        EngineError::CredentialSetup { .. } => Stage::CredentialsDropped,
        EngineError::TerminalSetup { .. } => Stage::Exec,
        EngineError::ProcessSetup { .. } | EngineError::Config { .. } => {
            Stage::NamespacesEntered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_stage_round_trips_error_kinds() {
        let err = EngineError::FilesystemSetup {
            message: "mount failed".into(),
            errno: Some(libc::ENOENT),
        };
        let restored = EngineError::from_stage(wire_stage(&err), libc::ENOENT, "restored");
        assert!(matches!(restored, EngineError::FilesystemSetup { .. }));

        let err = EngineError::Network {
            message: "veth rejected".into(),
            errno: libc::EEXIST,
        };
        let restored = EngineError::from_stage(wire_stage(&err), libc::EEXIST, "restored");
        assert!(matches!(restored, EngineError::Network { .. }));
    }
}
