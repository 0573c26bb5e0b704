//! The public container handle.
//!
//! One `Container` owns one guard/init pair and the interface and
//! terminal inventory that goes with it. All methods are synchronous
//! and blocking; concurrent calls against the same instance must be
//! serialized by the caller.

use std::path::Path;

use ipnetwork::IpNetwork;
use vessel_common::error::{EngineError, Result};
use vessel_common::state::ContainerState;
use vessel_core::barrier::Outcome;
use vessel_core::process;
use vessel_core::terminal::Terminal;
use vessel_net::{InterfaceConfig, LinkAttr, LinkState, NetworkManager};

use crate::attach::{self, AttachConfig};
use crate::config::ContainerConfig;
use crate::guard::{self, GuardHandles};

/// A container instance.
///
/// The kernel namespace objects are owned by the OS and referenced only
/// through the guard's init process; no on-disk state exists. Dropping
/// a running `Container` leaks nothing kernel-side beyond what the
/// still-running guard/init pair holds — call [`Container::stop`] and
/// [`Container::destroy`] for an orderly teardown.
pub struct Container {
    config: ContainerConfig,
    state: ContainerState,
    guard: Option<GuardHandles>,
    init_pid: Option<i32>,
    terminals: Vec<Terminal>,
    exit_status: Option<i32>,
}

impl Container {
    /// Creates a container from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if structural validation fails.
    pub fn create(config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(name = %config.name, "container created");
        Ok(Self {
            config,
            state: ContainerState::New,
            guard: None,
            init_pid: None,
            terminals: Vec::new(),
            exit_status: None,
        })
    }

    /// Runs the full bring-up sequence and blocks until init has
    /// exec'd.
    ///
    /// On success the container is RUNNING. On failure nothing of the
    /// attempt remains: interfaces are torn down, the init process is
    /// collected, and the container lands in STOPPED.
    ///
    /// # Errors
    ///
    /// Returns the typed error of the bring-up stage that failed.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ContainerState::New {
            return Err(EngineError::Config {
                message: format!("cannot start a container in state {}", self.state),
            });
        }
        self.state = ContainerState::Starting;

        let started = self.start_inner();
        if let Err(ref e) = started {
            tracing::warn!(name = %self.config.name, error = %e, "start failed");
            self.state = ContainerState::Stopped;
            self.terminals.clear();
        }
        started
    }

    fn start_inner(&mut self) -> Result<()> {
        self.terminals = vessel_core::terminal::allocate(self.config.terminals)?;

        let handles = guard::spawn_guard(&self.config, &self.terminals)?;
        match handles.result.wait() {
            Ok(Outcome::Ready { payload: init_pid }) => {
                tracing::info!(name = %self.config.name, init_pid, "container running");
                self.init_pid = Some(init_pid);
                self.guard = Some(handles);
                self.state = ContainerState::Running;
                Ok(())
            }
            Ok(Outcome::Failed { stage, errno }) => {
                let _ = process::wait_for_exit(handles.pid);
                Err(EngineError::from_stage(
                    stage,
                    errno,
                    format!("bring-up failed at stage {stage}"),
                ))
            }
            Err(e) => {
                let _ = process::wait_for_exit(handles.pid);
                Err(e)
            }
        }
    }

    /// Stops the container. A no-op success when it is already stopped.
    ///
    /// Sends SIGTERM to init (`SIGKILL` with `force`), then blocks until
    /// the guard reports the exit status and is reaped.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if signalling fails for a reason
    /// other than init already being gone.
    pub fn stop(&mut self, force: bool) -> Result<()> {
        self.refresh();
        if matches!(self.state, ContainerState::New | ContainerState::Stopped) {
            return Ok(());
        }

        self.state = ContainerState::Stopping;
        let signal = if force {
            nix::sys::signal::Signal::SIGKILL
        } else {
            nix::sys::signal::Signal::SIGTERM
        };

        if let Some(init_pid) = self.init_pid {
            let pid = nix::unistd::Pid::from_raw(init_pid);
            match process::send_signal(pid, signal) {
                Ok(()) => {}
                // Init may have exited between the refresh and the kill.
                Err(ref e) if e.errno() == Some(libc::ESRCH) => {}
                Err(e) => {
                    self.state = ContainerState::Running;
                    return Err(e);
                }
            }
        }

        self.collect_guard();
        tracing::info!(name = %self.config.name, exit_status = ?self.exit_status, "container stopped");
        Ok(())
    }

    /// Releases the remaining handles of a stopped container.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless the container is NEW or
    /// STOPPED.
    pub fn destroy(&mut self) -> Result<()> {
        self.refresh();
        if !matches!(self.state, ContainerState::New | ContainerState::Stopped) {
            return Err(EngineError::Config {
                message: format!("cannot destroy a container in state {}", self.state),
            });
        }
        self.terminals.clear();
        self.guard = None;
        self.init_pid = None;
        tracing::info!(name = %self.config.name, "container destroyed");
        Ok(())
    }

    /// Runs an additional command inside the running container.
    ///
    /// Returns the attached process's pid in the host's view.
    ///
    /// # Errors
    ///
    /// Returns a process-setup error if the container is not RUNNING or
    /// the helper times out, or the typed error of the attach step that
    /// failed.
    pub fn attach(&mut self, config: &AttachConfig) -> Result<i32> {
        self.refresh();
        let init_pid = self.running_init_pid("attach")?;

        self.state = ContainerState::Attaching;
        let result = attach::attach_to(init_pid, config);
        self.state = ContainerState::Running;
        result
    }

    /// Creates an interface inside the running container per `config`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the kernel rejects a request, or a
    /// process-setup error if the container is not RUNNING.
    pub fn create_interface(&mut self, config: &InterfaceConfig) -> Result<()> {
        let manager = self.network_manager("create_interface")?;
        manager.create_interface(config)
    }

    /// Adds an address to a named interface inside the container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn add_address(&mut self, interface: &str, addr: IpNetwork) -> Result<()> {
        self.network_manager("add_address")?.add_address(interface, addr)
    }

    /// Removes an address from a named interface inside the container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn del_address(&mut self, interface: &str, addr: IpNetwork) -> Result<()> {
        self.network_manager("del_address")?.del_address(interface, addr)
    }

    /// Changes the administrative state of an interface inside the
    /// container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn set_link_state(&mut self, interface: &str, state: LinkState) -> Result<()> {
        self.network_manager("set_link_state")?.set_link_state(interface, state)
    }

    /// Reads the attributes of an interface inside the container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn get_attrs(&mut self, interface: &str) -> Result<Vec<LinkAttr>> {
        self.network_manager("get_attrs")?.get_attrs(interface)
    }

    /// Applies attributes to an interface inside the container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn set_attrs(&mut self, interface: &str, attrs: &[LinkAttr]) -> Result<()> {
        self.network_manager("set_attrs")?.set_attrs(interface, attrs)
    }

    /// Lists interface names visible inside the container.
    ///
    /// # Errors
    ///
    /// See [`Container::create_interface`].
    pub fn get_interfaces(&mut self) -> Result<Vec<String>> {
        self.network_manager("get_interfaces")?.list_interfaces()
    }

    /// Current lifecycle state, refreshed against the guard.
    pub fn state(&mut self) -> ContainerState {
        self.refresh();
        self.state
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Root filesystem path.
    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    /// Pid of the container's init process, while one exists.
    #[must_use]
    pub const fn init_pid(&self) -> Option<i32> {
        self.init_pid
    }

    /// Pid of the supervising guard process, while one exists.
    #[must_use]
    pub fn guard_pid(&self) -> Option<i32> {
        self.guard.as_ref().map(|handles| handles.pid.as_raw())
    }

    /// Exit status of init after the container stopped.
    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// The allocated terminals; masters are held here for relaying.
    #[must_use]
    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }

    /// Detects an init that exited on its own: once the guard has
    /// terminated, the container is STOPPED and further attach fails.
    fn refresh(&mut self) {
        if self.state != ContainerState::Running {
            return;
        }
        let guard_exited = self
            .guard
            .as_ref()
            .is_some_and(|handles| matches!(process::try_wait_exit(handles.pid), Ok(Some(_))));
        if !guard_exited {
            return;
        }

        if let Some(handles) = self.guard.take() {
            self.exit_status = match handles.exit.wait_or_closed() {
                Ok(Some(Outcome::Ready { payload })) => Some(payload),
                _ => None,
            };
        }
        self.init_pid = None;
        self.state = ContainerState::Stopped;
        tracing::info!(
            name = %self.config.name,
            exit_status = ?self.exit_status,
            "init exited on its own"
        );
    }

    /// Blocks until the guard reports init's exit and reaps it.
    fn collect_guard(&mut self) {
        if let Some(handles) = self.guard.take() {
            match handles.exit.wait_or_closed() {
                Ok(Some(Outcome::Ready { payload })) => self.exit_status = Some(payload),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "guard exit report lost");
                }
            }
            let _ = process::wait_for_exit(handles.pid);
        }
        self.init_pid = None;
        self.state = ContainerState::Stopped;
    }

    fn running_init_pid(&self, operation: &str) -> Result<i32> {
        if self.state != ContainerState::Running {
            return Err(EngineError::ProcessSetup {
                message: format!(
                    "{operation} requires a running container (state: {})",
                    self.state
                ),
                errno: None,
            });
        }
        self.init_pid.ok_or_else(|| EngineError::ProcessSetup {
            message: format!("{operation}: no init process recorded"),
            errno: None,
        })
    }

    fn network_manager(&mut self, operation: &str) -> Result<NetworkManager> {
        self.refresh();
        let init_pid = self.running_init_pid(operation)?;
        Ok(NetworkManager::for_namespace(init_pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ContainerConfig {
        ContainerConfig::new("box", "/", vec!["/bin/true".into()])
    }

    #[test]
    fn fresh_container_is_new() {
        let mut container = Container::create(config()).unwrap();
        assert_eq!(container.state(), ContainerState::New);
        assert_eq!(container.init_pid(), None);
        assert_eq!(container.guard_pid(), None);
    }

    #[test]
    fn invalid_config_is_rejected_at_create() {
        let mut bad = config();
        bad.init.clear();
        assert!(Container::create(bad).is_err());
    }

    #[test]
    fn stop_on_a_new_container_is_a_no_op_success() {
        let mut container = Container::create(config()).unwrap();
        container.stop(false).unwrap();
        container.stop(true).unwrap();
        assert_eq!(container.state(), ContainerState::New);
    }

    #[test]
    fn destroy_from_new_succeeds() {
        let mut container = Container::create(config()).unwrap();
        container.destroy().unwrap();
    }

    #[test]
    fn attach_requires_running_state() {
        let mut container = Container::create(config()).unwrap();
        let err = container
            .attach(&AttachConfig::new(vec!["/bin/sh".into()]))
            .unwrap_err();
        assert!(matches!(err, EngineError::ProcessSetup { .. }));
    }

    #[test]
    fn interface_ops_require_running_state() {
        let mut container = Container::create(config()).unwrap();
        assert!(container.get_interfaces().is_err());
        assert!(container
            .set_link_state("eth0", LinkState::Up)
            .is_err());
    }

    #[test]
    fn name_and_root_are_exposed() {
        let container = Container::create(config()).unwrap();
        assert_eq!(container.name(), "box");
        assert_eq!(container.root_path(), Path::new("/"));
    }
}
