//! Attach: running an additional command inside a live container.
//!
//! A helper process joins the container's namespace set in
//! privilege-safe order and forks the actual command process, which
//! lands inside the container's PID namespace, reduces its privileges,
//! and execs. The helper reports the spawned pid over a one-shot
//! barrier; the caller applies a bounded wait.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};
use vessel_common::stage::Stage;
use vessel_core::barrier::{Barrier, BarrierWriter, Outcome};
use vessel_core::capability::CapabilitySet;
use vessel_core::namespace::Namespace;
use vessel_core::process;

/// Bound on how long the caller waits for the helper's readiness
/// signal before declaring the attach dead.
const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of one attach invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachConfig {
    /// Command argv; `argv[0]` is the binary path inside the container.
    pub argv: Vec<String>,
    /// Target user id.
    pub uid: u32,
    /// Target group id.
    pub gid: u32,
    /// Supplementary groups.
    pub supplementary_gids: Vec<u32>,
    /// Capabilities the attached process keeps.
    pub caps_to_keep: CapabilitySet,
    /// Working directory, as seen inside the container.
    pub work_dir: PathBuf,
    /// Environment variables preserved from the helper's environment.
    pub env_keep: Vec<String>,
    /// Environment variables set for the attached process.
    pub env_set: Vec<(String, String)>,
    /// Namespace kinds to join; entry order is normalized to put USER
    /// first at join time.
    pub namespaces: Vec<Namespace>,
}

impl AttachConfig {
    /// An attach running `argv` as root with no capabilities kept,
    /// joining every namespace kind.
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            uid: 0,
            gid: 0,
            supplementary_gids: Vec::new(),
            caps_to_keep: CapabilitySet::empty(),
            work_dir: PathBuf::from("/"),
            env_keep: Vec::new(),
            env_set: Vec::new(),
            namespaces: Namespace::ALL.to_vec(),
        }
    }

    /// Structural validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty argv or an empty
    /// namespace list.
    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() {
            return Err(EngineError::Config {
                message: "attach argv must not be empty".into(),
            });
        }
        if self.namespaces.is_empty() {
            return Err(EngineError::Config {
                message: "attach requires at least one namespace kind".into(),
            });
        }
        Ok(())
    }
}

/// Attaches to the namespace set anchored by `init_pid`.
///
/// Returns the pid of the attached process as seen from the host. The
/// attached process is reparented to the container's init once the
/// helper exits; its lifecycle is observed through the container.
///
/// # Errors
///
/// Returns a process-setup error if the helper cannot be spawned or
/// does not signal readiness within the bounded wait, or the typed
/// error of the setup step that failed inside the helper.
pub(crate) fn attach_to(init_pid: i32, config: &AttachConfig) -> Result<i32> {
    config.validate()?;

    let (result_reader, result_writer) = Barrier::new()?.split();

    // SAFETY: the helper child only touches its own handle copies and
    // exits via process::exit.
    match unsafe { process::fork_process() }? {
        nix::unistd::ForkResult::Parent { child: helper } => {
            drop(result_writer);
            let outcome = result_reader.wait_timeout(READINESS_TIMEOUT);
            if outcome.is_err() {
                // A hung helper (stuck in setns) must not outlive the
                // aborted attach.
                let _ = process::send_signal(helper, nix::sys::signal::Signal::SIGKILL);
            }
            let _ = process::wait_for_exit(helper);
            match outcome? {
                Outcome::Ready { payload } => {
                    tracing::debug!(pid = payload, "attach process spawned");
                    Ok(payload)
                }
                Outcome::Failed { stage, errno } => Err(EngineError::from_stage(
                    stage,
                    errno,
                    format!("attach failed at stage {stage}"),
                )),
            }
        }
        nix::unistd::ForkResult::Child => {
            let code = helper_main(init_pid, config, &result_writer);
            std::process::exit(code);
        }
    }
}

/// Body of the attach helper process.
fn helper_main(init_pid: i32, config: &AttachConfig, result: &BarrierWriter) -> i32 {
    // Join the container's namespaces, USER first. Entering the PID
    // namespace takes effect for our children, which is why the actual
    // command needs one more fork below.
    if let Err(e) =
        vessel_core::namespace::join_process_namespaces(init_pid, &config.namespaces)
    {
        tracing::error!(error = %e, "attach namespace join failed");
        let _ = result.signal_failure(Stage::NamespacesEntered, e.errno().unwrap_or(0));
        return 1;
    }

    // SAFETY: the command child runs run_attached and execs or exits.
    match unsafe { process::fork_process() } {
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            // The pid is reported in the host's view; inside the
            // container's PID namespace the process has its own id.
            let _ = result.signal_ready(child.as_raw());
            0
        }
        Ok(nix::unistd::ForkResult::Child) => run_attached(config),
        Err(e) => {
            let _ = result.signal_failure(Stage::NamespacesEntered, e.errno().unwrap_or(0));
            1
        }
    }
}

/// Setup and exec of the attached command, inside all namespaces.
fn run_attached(config: &AttachConfig) -> i32 {
    if let Err(e) = nix::unistd::chdir(&config.work_dir) {
        tracing::error!(
            work_dir = %config.work_dir.display(),
            error = %e,
            "attach chdir failed"
        );
        return 126;
    }

    vessel_core::environment::reset_environment(&config.env_keep, &config.env_set);

    if let Err(e) = vessel_core::capability::apply_capabilities(config.caps_to_keep) {
        tracing::error!(error = %e, "attach capability trim failed");
        return 126;
    }
    if let Err(e) = vessel_core::credentials::drop_credentials(
        config.gid,
        config.uid,
        &config.supplementary_gids,
    ) {
        tracing::error!(error = %e, "attach credential drop failed");
        return 126;
    }

    match vessel_core::process::exec_program(&config.argv) {
        Ok(never) => match never {},
        Err(e) => {
            tracing::error!(error = %e, "attach exec failed");
            127
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_attach_joins_every_namespace() {
        let config = AttachConfig::new(vec!["/bin/sh".into()]);
        assert_eq!(config.namespaces.len(), Namespace::ALL.len());
        config.validate().unwrap();
    }

    #[test]
    fn empty_argv_is_rejected() {
        let config = AttachConfig::new(vec![]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_namespace_list_is_rejected() {
        let mut config = AttachConfig::new(vec!["/bin/sh".into()]);
        config.namespaces.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn attach_config_round_trips_through_serde() {
        let config = AttachConfig::new(vec!["/bin/true".into()]);
        let json = serde_json::to_string(&config).unwrap();
        let back: AttachConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.argv, config.argv);
        assert_eq!(back.namespaces, config.namespaces);
    }
}
