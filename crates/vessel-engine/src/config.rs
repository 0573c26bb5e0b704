//! Container configuration surface.
//!
//! Values arrive validated from the orchestration layer; only
//! structural checks happen here (duplicate names, empty argv, and
//! similar shape errors).

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vessel_common::error::{EngineError, Result};
use vessel_core::capability::CapabilitySet;
use vessel_core::environment::{IdMap, RlimitConfig};
use vessel_core::filesystem::MountConfig;
use vessel_core::namespace::Namespace;
use vessel_net::InterfaceConfig;

/// How one namespace kind is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceMode {
    /// Create a fresh namespace at clone time.
    CreateNew,
    /// Join the namespace behind an existing `/proc/<pid>/ns/*` path.
    JoinPath(PathBuf),
}

/// The namespace request set of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    entries: Vec<(Namespace, NamespaceMode)>,
}

impl NamespaceConfig {
    /// A config creating fresh namespaces of every given kind.
    #[must_use]
    pub fn create_all(kinds: &[Namespace]) -> Self {
        Self {
            entries: kinds
                .iter()
                .map(|kind| (*kind, NamespaceMode::CreateNew))
                .collect(),
        }
    }

    /// Adds one namespace request. The last entry for a kind wins.
    pub fn set(&mut self, kind: Namespace, mode: NamespaceMode) {
        self.entries.retain(|(existing, _)| *existing != kind);
        self.entries.push((kind, mode));
    }

    /// Kinds to create fresh at clone time.
    #[must_use]
    pub fn create_kinds(&self) -> Vec<Namespace> {
        self.entries
            .iter()
            .filter(|(_, mode)| *mode == NamespaceMode::CreateNew)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// `(kind, path)` pairs to join, in privilege-safe order (USER
    /// first when present).
    #[must_use]
    pub fn join_entries(&self) -> Vec<(Namespace, PathBuf)> {
        let mut joins: Vec<(Namespace, PathBuf)> = self
            .entries
            .iter()
            .filter_map(|(kind, mode)| match mode {
                NamespaceMode::JoinPath(path) => Some((*kind, path.clone())),
                NamespaceMode::CreateNew => None,
            })
            .collect();
        joins.sort_by_key(|(kind, _)| *kind != Namespace::User);
        joins
    }

    /// All requested kinds, regardless of mode.
    #[must_use]
    pub fn kinds(&self) -> Vec<Namespace> {
        self.entries.iter().map(|(kind, _)| *kind).collect()
    }

    /// Whether the given kind is requested.
    #[must_use]
    pub fn contains(&self, kind: Namespace) -> bool {
        self.entries.iter().any(|(existing, _)| *existing == kind)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (kind, _) in &self.entries {
            if !seen.insert(*kind) {
                return Err(EngineError::Config {
                    message: format!("namespace kind requested twice: {kind}"),
                });
            }
        }
        Ok(())
    }
}

/// Full configuration of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container name.
    pub name: String,
    /// Root filesystem path; "/" means no root switch.
    pub root_path: PathBuf,
    /// Hostname inside the UTS namespace; empty means leave unchanged.
    pub hostname: String,
    /// Init argv; `argv[0]` is the binary path as seen inside the
    /// container's root.
    pub init: Vec<String>,
    /// Environment variables preserved from the engine's environment.
    pub env_keep: Vec<String>,
    /// Environment variables set for init.
    pub env_set: Vec<(String, String)>,
    /// Namespace request set.
    pub namespaces: NamespaceConfig,
    /// Mount list applied inside the mount namespace, in order.
    pub mounts: Vec<MountConfig>,
    /// Network interfaces to provide.
    pub interfaces: Vec<InterfaceConfig>,
    /// Number of ptys to allocate; the first becomes init's controlling
    /// terminal.
    pub terminals: usize,
    /// Capabilities init keeps; everything else is dropped.
    pub caps_to_keep: CapabilitySet,
    /// Target user id of init.
    pub uid: u32,
    /// Target group id of init.
    pub gid: u32,
    /// Supplementary groups of init.
    pub supplementary_gids: Vec<u32>,
    /// UID mappings written when a USER namespace is created.
    pub uid_maps: Vec<IdMap>,
    /// GID mappings written when a USER namespace is created.
    pub gid_maps: Vec<IdMap>,
    /// Resource limits applied to init.
    pub rlimits: Vec<RlimitConfig>,
    /// Kernel parameters written under `/proc/sys` inside the container.
    pub kernel_parameters: Vec<(String, String)>,
}

impl ContainerConfig {
    /// A minimal configuration: full namespace isolation, no mounts, no
    /// interfaces, one terminal, root identity, all capabilities kept.
    #[must_use]
    pub fn new(name: impl Into<String>, root_path: impl Into<PathBuf>, init: Vec<String>) -> Self {
        Self {
            name: name.into(),
            root_path: root_path.into(),
            hostname: String::new(),
            init,
            env_keep: Vec::new(),
            env_set: Vec::new(),
            namespaces: NamespaceConfig::create_all(&Namespace::ALL),
            mounts: Vec::new(),
            interfaces: Vec::new(),
            terminals: 1,
            caps_to_keep: CapabilitySet::all(),
            uid: 0,
            gid: 0,
            supplementary_gids: Vec::new(),
            uid_maps: Vec::new(),
            gid_maps: Vec::new(),
            rlimits: Vec::new(),
            kernel_parameters: Vec::new(),
        }
    }

    /// Structural validation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty name, an empty init
    /// argv, duplicate namespace kinds, duplicate guest interface
    /// names, ID mappings without a USER namespace, or interfaces
    /// without a NET namespace.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Config {
                message: "container name must not be empty".into(),
            });
        }
        if self.init.is_empty() {
            return Err(EngineError::Config {
                message: "init argv must not be empty".into(),
            });
        }
        self.namespaces.validate()?;

        let mut guest_names = HashSet::new();
        for interface in &self.interfaces {
            let name = match interface.kind {
                vessel_net::InterfaceKind::Bridge => &interface.host_name,
                _ => &interface.guest_name,
            };
            if name.is_empty() {
                return Err(EngineError::Config {
                    message: "interface name must not be empty".into(),
                });
            }
            if !guest_names.insert(name.clone()) {
                return Err(EngineError::Config {
                    message: format!("duplicate interface name: {name}"),
                });
            }
        }
        if !self.interfaces.is_empty() && !self.namespaces.contains(Namespace::Net) {
            return Err(EngineError::Config {
                message: "interfaces configured without a NET namespace".into(),
            });
        }
        if (!self.uid_maps.is_empty() || !self.gid_maps.is_empty())
            && !self.namespaces.contains(Namespace::User)
        {
            return Err(EngineError::Config {
                message: "ID mappings configured without a USER namespace".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ContainerConfig {
        ContainerConfig::new("box", "/", vec!["/sbin/init".into()])
    }

    #[test]
    fn default_shape_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn empty_init_is_rejected() {
        let mut config = valid();
        config.init.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_namespace_kind_is_rejected() {
        let mut config = valid();
        config.namespaces = NamespaceConfig {
            entries: vec![
                (Namespace::Pid, NamespaceMode::CreateNew),
                (Namespace::Pid, NamespaceMode::CreateNew),
            ],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn set_replaces_previous_mode() {
        let mut namespaces = NamespaceConfig::create_all(&[Namespace::Pid, Namespace::Net]);
        namespaces.set(
            Namespace::Net,
            NamespaceMode::JoinPath(PathBuf::from("/proc/42/ns/net")),
        );
        assert_eq!(namespaces.create_kinds(), vec![Namespace::Pid]);
        assert_eq!(
            namespaces.join_entries(),
            vec![(Namespace::Net, PathBuf::from("/proc/42/ns/net"))]
        );
        namespaces.validate().unwrap();
    }

    #[test]
    fn join_entries_put_user_first() {
        let mut namespaces = NamespaceConfig::default();
        namespaces.set(
            Namespace::Net,
            NamespaceMode::JoinPath(PathBuf::from("/proc/9/ns/net")),
        );
        namespaces.set(
            Namespace::User,
            NamespaceMode::JoinPath(PathBuf::from("/proc/9/ns/user")),
        );
        let joins = namespaces.join_entries();
        assert_eq!(joins[0].0, Namespace::User);
    }

    #[test]
    fn duplicate_guest_interface_names_are_rejected() {
        use vessel_net::{InterfaceKind, LinkState, MacvlanMode};
        let mut config = valid();
        let veth = InterfaceConfig {
            kind: InterfaceKind::Veth,
            host_name: "veth0-host".into(),
            guest_name: "eth0".into(),
            macvlan_mode: MacvlanMode::Private,
            addresses: vec![],
            state: LinkState::Up,
            mtu: None,
            mac: None,
            txqueue_len: None,
        };
        let mut second = veth.clone();
        second.host_name = "veth1-host".into();
        config.interfaces = vec![veth, second];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate interface name"));
    }

    #[test]
    fn id_maps_require_user_namespace() {
        let mut config = valid();
        config.namespaces = NamespaceConfig::create_all(&[Namespace::Pid]);
        config.uid_maps.push(vessel_core::environment::IdMap {
            inside: 0,
            outside: 100_000,
            count: 65536,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = valid();
        let json = serde_json::to_string(&config).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, config.name);
        assert_eq!(back.namespaces, config.namespaces);
    }
}
