//! The ordered bring-up sequence.
//!
//! The child side walks the stage list inside the new namespaces and
//! reports each gate over the status pipe; the host side (the guard)
//! drives the two interventions that must happen from outside — ID
//! mapping and network placement — and translates a failed gate back
//! into the typed error of the stage that caused it.
//!
//! Stage order is load-bearing and must not be reordered: mounts and
//! network placement need full privilege, the capability trim needs
//! `CAP_SETPCAP` which the credential drop forfeits, the gid must drop
//! before the uid, and exec is irreversible.

use std::os::fd::RawFd;
use std::path::Path;

use vessel_common::error::{EngineError, Result};
use vessel_common::stage::Stage;
use vessel_core::barrier::{BarrierReader, BarrierWriter, Outcome};
use vessel_net::{InterfaceConfig, NetworkManager};

use crate::config::ContainerConfig;

/// Everything the namespaced child needs, moved into the clone closure.
pub(crate) struct ChildPlan {
    /// Full container configuration.
    pub config: ContainerConfig,
    /// Slave descriptor of the controlling terminal, if any.
    pub terminal_slave: Option<RawFd>,
    /// Child-to-host stage reports.
    pub status: BarrierWriter,
    /// Host-to-child gate: ID maps written.
    pub maps_gate: BarrierReader,
    /// Host-to-child gate: network interfaces placed.
    pub network_gate: BarrierReader,
}

fn errno_of(err: &EngineError) -> i32 {
    err.errno().unwrap_or(0)
}

/// Reports a failed stage and converts to the child's exit status.
fn fail(status: &BarrierWriter, stage: Stage, err: &EngineError) -> isize {
    tracing::error!(%stage, error = %err, "bring-up stage failed");
    let _ = status.signal_failure(stage, errno_of(err));
    1
}

/// Runs the bring-up sequence inside the namespaced child.
///
/// Does not return on success: the init binary replaces the process.
/// The returned value is the child's exit status on failure.
pub(crate) fn run_child(plan: ChildPlan) -> isize {
    let ChildPlan {
        config,
        terminal_slave,
        status,
        maps_gate,
        network_gate,
    } = plan;

    // Stage: namespaces entered. Create-mode kinds were carried by the
    // clone flags; join-mode kinds are entered here, USER first.
    for (kind, path) in config.namespaces.join_entries() {
        let joined = std::fs::File::open(&path)
            .map_err(|e| EngineError::ProcessSetup {
                message: format!("open {} failed: {e}", path.display()),
                errno: e.raw_os_error(),
            })
            .and_then(|file| vessel_core::namespace::join_namespace(&file, kind));
        if let Err(e) = joined {
            return fail(&status, Stage::NamespacesEntered, &e);
        }
    }
    if status.signal_ready(0).is_err() {
        return 1;
    }

    // Gate: the host writes our ID maps before we touch anything that
    // depends on the mapped identity.
    if !matches!(maps_gate.wait(), Ok(Outcome::Ready { .. })) {
        return 1;
    }

    // Stage: hostname and environment (variables, limits, sysctls).
    if !config.hostname.is_empty() {
        if let Err(e) = vessel_core::environment::set_hostname(&config.hostname) {
            return fail(&status, Stage::HostnameSet, &e);
        }
    }
    vessel_core::environment::reset_environment(&config.env_keep, &config.env_set);
    for limit in &config.rlimits {
        if let Err(e) = vessel_core::environment::set_rlimit(*limit) {
            return fail(&status, Stage::HostnameSet, &e);
        }
    }
    for (key, value) in &config.kernel_parameters {
        if let Err(e) = vessel_core::environment::write_kernel_parameter(key, value) {
            return fail(&status, Stage::HostnameSet, &e);
        }
    }
    if status.signal_ready(0).is_err() {
        return 1;
    }

    // Stage: mounts, then the root switch.
    if let Err(e) = vessel_core::filesystem::apply_mounts(&config.root_path, &config.mounts) {
        return fail(&status, Stage::MountsConfigured, &e);
    }
    if config.root_path != Path::new("/") && !config.root_path.as_os_str().is_empty() {
        if let Err(e) = vessel_core::filesystem::pivot_into_root(&config.root_path) {
            return fail(&status, Stage::MountsConfigured, &e);
        }
    }
    if status.signal_ready(0).is_err() {
        return 1;
    }

    // Gate: the host creates and places our interfaces.
    if !matches!(network_gate.wait(), Ok(Outcome::Ready { .. })) {
        return 1;
    }

    // Stage: capability trim, while CAP_SETPCAP is still held.
    if let Err(e) = vessel_core::capability::apply_capabilities(config.caps_to_keep) {
        return fail(&status, Stage::CapabilitiesTrimmed, &e);
    }
    if status.signal_ready(0).is_err() {
        return 1;
    }

    // Stage: credential drop, gid before uid.
    if let Err(e) = vessel_core::credentials::drop_credentials(
        config.gid,
        config.uid,
        &config.supplementary_gids,
    ) {
        return fail(&status, Stage::CredentialsDropped, &e);
    }
    if status.signal_ready(0).is_err() {
        return 1;
    }

    // Controlling terminal, then exec. The status pipe is close-on-exec,
    // so a successful exec is observed host-side as end-of-file.
    if let Some(fd) = terminal_slave {
        // SAFETY: the slave descriptor was inherited across the fork
        // and stays open until exec.
        let slave = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        if let Err(e) = vessel_core::terminal::setup_guest_terminal(slave) {
            return fail(&status, Stage::Exec, &e);
        }
    }
    let err = match vessel_core::process::exec_program(&config.init) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    fail(&status, Stage::Exec, &err)
}

/// Host-side driver of the bring-up gates, run inside the guard.
pub(crate) struct HostSequencer<'a> {
    config: &'a ContainerConfig,
    init_pid: i32,
    status: BarrierReader,
    maps_gate: BarrierWriter,
    network_gate: BarrierWriter,
    placed: Vec<InterfaceConfig>,
}

impl<'a> HostSequencer<'a> {
    pub(crate) fn new(
        config: &'a ContainerConfig,
        init_pid: i32,
        status: BarrierReader,
        maps_gate: BarrierWriter,
        network_gate: BarrierWriter,
    ) -> Self {
        Self {
            config,
            init_pid,
            status,
            maps_gate,
            network_gate,
            placed: Vec::new(),
        }
    }

    /// Walks the gates until the child has exec'd or a stage failed.
    ///
    /// On failure every interface placed so far is torn down before the
    /// originating stage error is returned; teardown problems are
    /// logged and never replace it.
    pub(crate) fn drive(&mut self) -> Result<()> {
        if let Err(e) = self.drive_inner() {
            self.rollback();
            return Err(e);
        }
        Ok(())
    }

    fn drive_inner(&mut self) -> Result<()> {
        self.expect(Stage::NamespacesEntered)?;

        // Host intervention: ID maps for a fresh USER namespace.
        if let Err(e) = vessel_core::environment::write_id_maps(
            self.init_pid,
            &self.config.uid_maps,
            &self.config.gid_maps,
        ) {
            let _ = self
                .maps_gate
                .signal_failure(Stage::NamespacesEntered, errno_of(&e));
            return Err(e);
        }
        self.maps_gate.signal_ready(0)?;

        self.expect(Stage::HostnameSet)?;
        self.expect(Stage::MountsConfigured)?;

        // Host intervention: create interfaces and place their guest
        // ends into the child's network namespace.
        if let Err(e) = self.place_network() {
            let _ = self
                .network_gate
                .signal_failure(Stage::NetworkPlaced, errno_of(&e));
            return Err(e);
        }
        self.network_gate.signal_ready(0)?;

        self.expect(Stage::CapabilitiesTrimmed)?;
        self.expect(Stage::CredentialsDropped)?;

        // End-of-file on the status pipe is the exec-success signal.
        match self.status.wait_or_closed()? {
            None => Ok(()),
            Some(Outcome::Failed { stage, errno }) => Err(EngineError::from_stage(
                stage,
                errno,
                format!("bring-up failed at stage {stage}"),
            )),
            Some(Outcome::Ready { .. }) => Err(EngineError::ProcessSetup {
                message: "unexpected extra ready report before exec".into(),
                errno: None,
            }),
        }
    }

    fn expect(&mut self, expected: Stage) -> Result<()> {
        match self.status.wait() {
            Ok(Outcome::Ready { .. }) => {
                tracing::debug!(stage = %expected, "stage complete");
                Ok(())
            }
            Ok(Outcome::Failed { stage, errno }) => Err(EngineError::from_stage(
                stage,
                errno,
                format!("bring-up failed at stage {stage}"),
            )),
            Err(e) => Err(e),
        }
    }

    fn place_network(&mut self) -> Result<()> {
        if self.config.interfaces.is_empty() {
            return Ok(());
        }
        let manager = NetworkManager::for_namespace(self.init_pid);

        // A fresh NET namespace starts with loopback down.
        if let Err(e) = manager.set_link_state("lo", vessel_net::LinkState::Up) {
            tracing::warn!(error = %e, "loopback bring-up failed");
        }

        for interface in &self.config.interfaces {
            manager.create_interface(interface)?;
            self.placed.push(interface.clone());
        }
        Ok(())
    }

    /// Best-effort reverse teardown of everything placed so far.
    pub(crate) fn rollback(&mut self) {
        let manager = NetworkManager::for_namespace(self.init_pid);
        for interface in self.placed.drain(..).rev() {
            if let Err(e) = manager.teardown_interface(&interface) {
                tracing::warn!(
                    interface = %interface.guest_name,
                    error = %e,
                    "interface teardown failed during rollback"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_core::barrier::Barrier;

    /// Builds a host sequencer plus the child-side pipe halves a forked
    /// child would hold.
    fn harness(
        config: &ContainerConfig,
    ) -> (
        HostSequencer<'_>,
        BarrierWriter,
        BarrierReader,
        BarrierReader,
    ) {
        let (status_reader, status_writer) = Barrier::new().unwrap().split();
        let (maps_reader, maps_writer) = Barrier::new().unwrap().split();
        let (network_reader, network_writer) = Barrier::new().unwrap().split();
        let sequencer = HostSequencer::new(
            config,
            std::process::id() as i32,
            status_reader,
            maps_writer,
            network_writer,
        );
        (sequencer, status_writer, maps_reader, network_reader)
    }

    #[test]
    fn full_stage_walk_ends_in_success_on_eof() {
        let config = ContainerConfig::new("seq", "/", vec!["/sbin/init".into()]);
        let (mut sequencer, status, maps_gate, network_gate) = harness(&config);

        let child = std::thread::spawn(move || {
            status.signal_ready(0).unwrap(); // namespaces entered
            assert!(matches!(maps_gate.wait(), Ok(Outcome::Ready { .. })));
            status.signal_ready(0).unwrap(); // hostname
            status.signal_ready(0).unwrap(); // mounts
            assert!(matches!(network_gate.wait(), Ok(Outcome::Ready { .. })));
            status.signal_ready(0).unwrap(); // capabilities
            status.signal_ready(0).unwrap(); // credentials
            // Dropping the writer stands in for the close-on-exec of a
            // successful exec.
        });

        sequencer.drive().unwrap();
        child.join().unwrap();
    }

    #[test]
    fn mount_failure_surfaces_as_filesystem_error() {
        let config = ContainerConfig::new("seq", "/", vec!["/sbin/init".into()]);
        let (mut sequencer, status, maps_gate, _network_gate) = harness(&config);

        let child = std::thread::spawn(move || {
            status.signal_ready(0).unwrap();
            assert!(matches!(maps_gate.wait(), Ok(Outcome::Ready { .. })));
            status.signal_ready(0).unwrap(); // hostname
            status
                .signal_failure(Stage::MountsConfigured, libc::ENOENT)
                .unwrap();
        });

        let err = sequencer.drive().unwrap_err();
        child.join().unwrap();
        assert!(matches!(err, EngineError::FilesystemSetup { .. }));
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn exec_failure_surfaces_as_process_error() {
        let config = ContainerConfig::new("seq", "/", vec!["/sbin/init".into()]);
        let (mut sequencer, status, maps_gate, network_gate) = harness(&config);

        let child = std::thread::spawn(move || {
            status.signal_ready(0).unwrap();
            assert!(matches!(maps_gate.wait(), Ok(Outcome::Ready { .. })));
            for _ in 0..2 {
                status.signal_ready(0).unwrap();
            }
            assert!(matches!(network_gate.wait(), Ok(Outcome::Ready { .. })));
            for _ in 0..2 {
                status.signal_ready(0).unwrap();
            }
            status
                .signal_failure(Stage::Exec, libc::ENOENT)
                .unwrap();
        });

        let err = sequencer.drive().unwrap_err();
        child.join().unwrap();
        assert!(matches!(err, EngineError::ProcessSetup { .. }));
    }

    #[test]
    fn child_death_before_a_gate_is_a_process_error() {
        let config = ContainerConfig::new("seq", "/", vec!["/sbin/init".into()]);
        let (mut sequencer, status, _maps_gate, _network_gate) = harness(&config);
        drop(status);
        let err = sequencer.drive().unwrap_err();
        assert!(matches!(err, EngineError::ProcessSetup { .. }));
    }
}
