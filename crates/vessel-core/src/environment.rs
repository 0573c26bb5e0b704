//! Process environment configuration for the bring-up sequence.
//!
//! Hostname, environment variables, resource limits, kernel parameters,
//! and user-namespace ID mappings. All of these run while the child is
//! still fully privileged, before the capability trim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};

/// Sets the hostname inside the child's UTS namespace.
///
/// # Errors
///
/// Returns an environment-setup error if `sethostname(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).map_err(|e| EngineError::EnvironmentSetup {
        message: format!("sethostname({name:?}) failed: {e}"),
        errno: Some(e as i32),
    })?;
    tracing::debug!(hostname = name, "hostname set");
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — UTS configuration requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_hostname(_name: &str) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for hostname configuration".into(),
    })
}

/// Clears the process environment except for the named variables, then
/// applies the set-list.
///
/// Runs in the single-threaded helper process between fork and exec;
/// the set-list wins over an inherited value with the same name.
pub fn reset_environment(keep: &[String], set: &[(String, String)]) {
    let current: Vec<String> = std::env::vars().map(|(name, _)| name).collect();
    for name in current {
        if keep.contains(&name) {
            continue;
        }
        // SAFETY: the helper process is single-threaded at this point.
        unsafe { std::env::remove_var(&name) };
    }
    for (name, value) in set {
        // SAFETY: as above.
        unsafe { std::env::set_var(name, value) };
    }
    tracing::debug!(kept = keep.len(), set = set.len(), "environment reset");
}

/// A resource limit to apply to the init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitConfig {
    /// Which resource the limit applies to.
    pub resource: RlimitResource,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit.
    pub hard: u64,
}

/// Resources the engine can limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RlimitResource {
    /// Maximum address space size.
    AddressSpace,
    /// Maximum core file size.
    Core,
    /// CPU time in seconds.
    Cpu,
    /// Maximum data segment size.
    Data,
    /// Maximum created file size.
    FileSize,
    /// Maximum locked memory.
    MemLock,
    /// Maximum open file descriptors.
    OpenFiles,
    /// Maximum number of processes.
    Processes,
    /// Maximum stack size.
    Stack,
}

#[cfg(target_os = "linux")]
impl RlimitResource {
    const fn to_nix(self) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;
        match self {
            Self::AddressSpace => Resource::RLIMIT_AS,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::Data => Resource::RLIMIT_DATA,
            Self::FileSize => Resource::RLIMIT_FSIZE,
            Self::MemLock => Resource::RLIMIT_MEMLOCK,
            Self::OpenFiles => Resource::RLIMIT_NOFILE,
            Self::Processes => Resource::RLIMIT_NPROC,
            Self::Stack => Resource::RLIMIT_STACK,
        }
    }
}

/// Applies one resource limit.
///
/// # Errors
///
/// Returns an environment-setup error if `setrlimit(2)` fails.
#[cfg(target_os = "linux")]
pub fn set_rlimit(limit: RlimitConfig) -> Result<()> {
    nix::sys::resource::setrlimit(limit.resource.to_nix(), limit.soft, limit.hard).map_err(
        |e| EngineError::EnvironmentSetup {
            message: format!(
                "setrlimit({:?}, {}/{}) failed: {e}",
                limit.resource, limit.soft, limit.hard
            ),
            errno: Some(e as i32),
        },
    )
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error — resource limits require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_rlimit(_limit: RlimitConfig) -> Result<()> {
    Err(EngineError::Config {
        message: "Linux required for resource limits".into(),
    })
}

/// Resolves a dotted sysctl key to its `/proc/sys` path.
fn sysctl_path(key: &str) -> PathBuf {
    PathBuf::from("/proc/sys").join(key.replace('.', "/"))
}

/// Writes one kernel parameter under `/proc/sys`.
///
/// # Errors
///
/// Returns an environment-setup error if the write fails.
pub fn write_kernel_parameter(key: &str, value: &str) -> Result<()> {
    let path = sysctl_path(key);
    std::fs::write(&path, value).map_err(|e| EngineError::EnvironmentSetup {
        message: format!("write {} = {value:?} failed: {e}", path.display()),
        errno: e.raw_os_error(),
    })?;
    tracing::debug!(key, value, "kernel parameter written");
    Ok(())
}

/// One entry of a uid or gid mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    /// First ID inside the namespace.
    pub inside: u32,
    /// First ID outside the namespace.
    pub outside: u32,
    /// Length of the mapped range.
    pub count: u32,
}

impl IdMap {
    fn render(maps: &[Self]) -> String {
        maps.iter()
            .map(|m| format!("{} {} {}\n", m.inside, m.outside, m.count))
            .collect()
    }
}

/// Writes uid/gid mappings for the user namespace of process `pid`.
///
/// `setgroups` is denied first, as required before writing `gid_map`
/// from outside an unprivileged user namespace.
///
/// # Errors
///
/// Returns a credential-setup error if any of the `/proc/<pid>/*` writes
/// fail.
pub fn write_id_maps(pid: i32, uid_maps: &[IdMap], gid_maps: &[IdMap]) -> Result<()> {
    if uid_maps.is_empty() && gid_maps.is_empty() {
        return Ok(());
    }

    let write = |file: &str, content: String| -> Result<()> {
        let path = PathBuf::from(format!("/proc/{pid}/{file}"));
        std::fs::write(&path, content).map_err(|e| EngineError::CredentialSetup {
            message: format!("write {} failed: {e}", path.display()),
            errno: e.raw_os_error(),
        })
    };

    write("setgroups", "deny".into())?;
    if !uid_maps.is_empty() {
        write("uid_map", IdMap::render(uid_maps))?;
    }
    if !gid_maps.is_empty() {
        write("gid_map", IdMap::render(gid_maps))?;
    }

    tracing::debug!(pid, uids = uid_maps.len(), gids = gid_maps.len(), "ID maps written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysctl_keys_map_to_proc_paths() {
        assert_eq!(
            sysctl_path("net.ipv4.ip_forward"),
            PathBuf::from("/proc/sys/net/ipv4/ip_forward")
        );
    }

    #[test]
    fn id_maps_render_one_line_per_range() {
        let rendered = IdMap::render(&[
            IdMap {
                inside: 0,
                outside: 100_000,
                count: 65536,
            },
            IdMap {
                inside: 65536,
                outside: 200_000,
                count: 1,
            },
        ]);
        assert_eq!(rendered, "0 100000 65536\n65536 200000 1\n");
    }

    #[test]
    fn empty_id_maps_touch_nothing() {
        // pid -1 would fail on any write; empty maps must short-circuit.
        write_id_maps(-1, &[], &[]).unwrap();
    }

    #[test]
    fn reset_environment_applies_set_list() {
        // Keep the whole inherited environment so the test harness (and
        // its other threads) are unaffected; only the set-list matters.
        let keep: Vec<String> = std::env::vars().map(|(name, _)| name).collect();
        reset_environment(&keep, &[("VESSEL_TEST_MARKER".into(), "on".into())]);
        assert_eq!(std::env::var("VESSEL_TEST_MARKER").as_deref(), Ok("on"));
        // SAFETY: test-local cleanup.
        unsafe { std::env::remove_var("VESSEL_TEST_MARKER") };
    }
}
