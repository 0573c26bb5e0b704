//! Network interface configuration surface.
//!
//! Typed interface kinds, link attributes, and the [`NetworkManager`]
//! that executes them in the right network namespace.

use std::fmt;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use vessel_common::error::Result;

#[cfg(target_os = "linux")]
use vessel_common::error::EngineError;

/// Kind of virtual device to provide to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    /// A veth pair; the guest end lands inside the container.
    Veth,
    /// A bridge master device on the host side.
    Bridge,
    /// A macvlan shim bound to an existing host device.
    Macvlan,
    /// An existing host interface relocated into the container.
    Move,
}

/// Packet forwarding mode of a macvlan device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacvlanMode {
    /// No cross-talk between shims on the same lower device.
    Private,
    /// Traffic hairpins through the adjacent switch.
    Vepa,
    /// Shims on the same lower device talk directly.
    Bridge,
    /// The shim takes over the lower device.
    Passthru,
}

impl MacvlanMode {
    /// `MACVLAN_MODE_*` bit for the kernel.
    #[must_use]
    pub const fn mode_bits(self) -> u32 {
        match self {
            Self::Private => 1,
            Self::Vepa => 2,
            Self::Bridge => 4,
            Self::Passthru => 8,
        }
    }
}

/// Administrative link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Interface is up.
    Up,
    /// Interface is down.
    Down,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// One virtual interface requested for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Device kind.
    pub kind: InterfaceKind,
    /// Host-side name: the host end of a veth pair, the bridge name,
    /// the macvlan lower device, or the interface to move.
    pub host_name: String,
    /// Guest-side name the container sees.
    pub guest_name: String,
    /// Macvlan forwarding mode; ignored for other kinds.
    pub macvlan_mode: MacvlanMode,
    /// Addresses to assign, in order.
    pub addresses: Vec<IpNetwork>,
    /// Administrative state after configuration.
    pub state: LinkState,
    /// Maximum transmission unit, when overridden.
    pub mtu: Option<u32>,
    /// Hardware address, when overridden.
    pub mac: Option<[u8; 6]>,
    /// Transmit queue length, when overridden.
    pub txqueue_len: Option<u32>,
}

/// A link attribute with a typed value.
///
/// The named variants cover the attributes with a stable layout; any
/// other attribute travels through [`LinkAttr::Raw`] as untyped bytes
/// with its `IFLA_*` kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkAttr {
    /// Hardware (MAC) address.
    Mac([u8; 6]),
    /// Active `IFF_*` flag word.
    Flags(u32),
    /// Flag mask applied together with `Flags` on writes.
    Change(u32),
    /// ARP hardware type; read-only.
    Type(u16),
    /// Maximum transmission unit.
    Mtu(u32),
    /// Index of the underlying lower device.
    Link(u32),
    /// Transmit queue length.
    TxQueueLen(u32),
    /// Fallback for attributes without a typed accessor.
    Raw {
        /// `IFLA_*` attribute kind.
        kind: u16,
        /// Raw payload bytes.
        bytes: Vec<u8>,
    },
}

/// Executes interface operations against one network namespace.
///
/// Holds no socket: each operation opens its transport on the thread
/// that has the right namespace membership for it.
#[derive(Debug, Clone, Copy)]
pub struct NetworkManager {
    netns_pid: Option<i32>,
}

impl NetworkManager {
    /// Manager for the caller's own (host) namespace.
    #[must_use]
    pub const fn host() -> Self {
        Self { netns_pid: None }
    }

    /// Manager for the network namespace of process `pid`.
    #[must_use]
    pub const fn for_namespace(pid: i32) -> Self {
        Self {
            netns_pid: Some(pid),
        }
    }

    /// The namespace where the configured end of `config` lives: the
    /// host for bridges, the container for everything else.
    const fn placement_pid(self, config: &InterfaceConfig) -> Option<i32> {
        match config.kind {
            InterfaceKind::Bridge => None,
            _ => self.netns_pid,
        }
    }
}

#[cfg(target_os = "linux")]
impl NetworkManager {
    /// Creates a configured interface: the device itself, its
    /// addresses, attribute overrides, and administrative state.
    ///
    /// Veth guest ends are created directly inside the target namespace;
    /// macvlan shims and moved interfaces are relocated right after
    /// creation. Address and state changes run namespace-attached.
    ///
    /// # Errors
    ///
    /// Returns a network error on the first rejected request. A device
    /// created before a later step failed is deleted again before the
    /// error is returned.
    pub fn create_interface(&self, config: &InterfaceConfig) -> Result<()> {
        use crate::netlink::NetlinkSocket;

        let mut host_socket = NetlinkSocket::open()?;
        match config.kind {
            InterfaceKind::Veth => {
                host_socket.create_veth(&config.host_name, &config.guest_name, self.netns_pid)?;
            }
            InterfaceKind::Bridge => {
                host_socket.create_bridge(&config.host_name)?;
            }
            InterfaceKind::Macvlan => {
                host_socket.create_macvlan(
                    &config.guest_name,
                    &config.host_name,
                    config.macvlan_mode.mode_bits(),
                )?;
                if let Some(pid) = self.netns_pid {
                    if let Err(e) = host_socket.move_link(&config.guest_name, pid) {
                        let _ = host_socket.delete_link(&config.guest_name);
                        return Err(e);
                    }
                }
            }
            InterfaceKind::Move => {
                if let Some(pid) = self.netns_pid {
                    host_socket.move_link(&config.host_name, pid)?;
                }
            }
        }
        drop(host_socket);

        if let Err(e) = self.configure_placed(config) {
            self.undo_create(config);
            return Err(e);
        }
        Ok(())
    }

    /// Applies addresses, attribute overrides, and state to an
    /// interface that already sits in its final namespace.
    fn configure_placed(&self, config: &InterfaceConfig) -> Result<()> {
        use crate::netlink::{NetlinkSocket, RawAttr};
        use crate::netns::with_net_namespace;

        let name = self.placed_name(config);
        let addresses = config.addresses.clone();
        let mut attrs: Vec<RawAttr> = Vec::new();
        if let Some(mtu) = config.mtu {
            attrs.push(RawAttr {
                kind: crate::netlink::IFLA_MTU,
                data: mtu.to_ne_bytes().to_vec(),
            });
        }
        if let Some(mac) = config.mac {
            attrs.push(RawAttr {
                kind: crate::netlink::IFLA_ADDRESS,
                data: mac.to_vec(),
            });
        }
        if let Some(txqlen) = config.txqueue_len {
            attrs.push(RawAttr {
                kind: crate::netlink::IFLA_TXQLEN,
                data: txqlen.to_ne_bytes().to_vec(),
            });
        }
        let up = config.state == LinkState::Up;

        with_net_namespace(self.placement_pid(config), move || {
            let mut socket = NetlinkSocket::open()?;
            if !attrs.is_empty() {
                socket.modify_link(&name, 0, 0, &attrs)?;
            }
            for addr in addresses {
                socket.add_address(&name, addr)?;
            }
            socket.set_link_state(&name, up)
        })
    }

    /// Name of the end of `config` that lives in its final namespace.
    fn placed_name(self, config: &InterfaceConfig) -> String {
        match config.kind {
            InterfaceKind::Bridge => config.host_name.clone(),
            InterfaceKind::Veth | InterfaceKind::Macvlan => config.guest_name.clone(),
            InterfaceKind::Move => config.host_name.clone(),
        }
    }

    /// Best-effort removal of a half-configured interface.
    fn undo_create(&self, config: &InterfaceConfig) {
        if let Err(e) = self.teardown_interface(config) {
            tracing::warn!(
                interface = %config.guest_name,
                error = %e,
                "interface rollback failed"
            );
        }
    }

    /// Removes (or returns to the host) one configured interface.
    ///
    /// Engine-created devices are deleted; a moved physical interface
    /// is handed back to the init namespace instead.
    ///
    /// # Errors
    ///
    /// Returns a network error if the removal request is rejected.
    pub fn teardown_interface(&self, config: &InterfaceConfig) -> Result<()> {
        use crate::netlink::NetlinkSocket;
        use crate::netns::with_net_namespace;

        let name = self.placed_name(config);
        let kind = config.kind;
        with_net_namespace(self.placement_pid(config), move || {
            let mut socket = NetlinkSocket::open()?;
            match kind {
                InterfaceKind::Move => socket.move_link(&name, 1),
                _ => socket.delete_link(&name),
            }
        })
    }

    /// Adds an address to a named interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the request is rejected.
    pub fn add_address(&self, name: &str, addr: IpNetwork) -> Result<()> {
        let name = name.to_owned();
        crate::netns::with_net_namespace(self.netns_pid, move || {
            crate::netlink::NetlinkSocket::open()?.add_address(&name, addr)
        })
    }

    /// Removes an address from a named interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the request is rejected.
    pub fn del_address(&self, name: &str, addr: IpNetwork) -> Result<()> {
        let name = name.to_owned();
        crate::netns::with_net_namespace(self.netns_pid, move || {
            crate::netlink::NetlinkSocket::open()?.del_address(&name, addr)
        })
    }

    /// Changes the administrative state of a named interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the request is rejected.
    pub fn set_link_state(&self, name: &str, state: LinkState) -> Result<()> {
        let name = name.to_owned();
        crate::netns::with_net_namespace(self.netns_pid, move || {
            crate::netlink::NetlinkSocket::open()?.set_link_state(&name, state == LinkState::Up)
        })
    }

    /// Reads the attributes of a named interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist.
    pub fn get_attrs(&self, name: &str) -> Result<Vec<LinkAttr>> {
        let name = name.to_owned();
        let details = crate::netns::with_net_namespace(self.netns_pid, move || {
            crate::netlink::NetlinkSocket::open()?.get_link(&name)
        })?;

        let mut attrs = vec![
            LinkAttr::Flags(details.flags),
            LinkAttr::Type(details.link_type),
        ];
        for raw in details.attrs {
            attrs.push(decode_attr(raw));
        }
        Ok(attrs)
    }

    /// Applies attributes to a named interface.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for the read-only `Type`
    /// attribute, or a network error if the kernel rejects a write.
    pub fn set_attrs(&self, name: &str, attrs: &[LinkAttr]) -> Result<()> {
        use crate::netlink::RawAttr;

        let mut flags = 0u32;
        let mut change = 0u32;
        let mut raw: Vec<RawAttr> = Vec::new();
        for attr in attrs {
            match attr {
                LinkAttr::Flags(value) => flags = *value,
                LinkAttr::Change(value) => change = *value,
                LinkAttr::Type(_) => {
                    return Err(EngineError::Config {
                        message: "link type is read-only".into(),
                    });
                }
                LinkAttr::Mac(mac) => raw.push(RawAttr {
                    kind: crate::netlink::IFLA_ADDRESS,
                    data: mac.to_vec(),
                }),
                LinkAttr::Mtu(value) => raw.push(RawAttr {
                    kind: crate::netlink::IFLA_MTU,
                    data: value.to_ne_bytes().to_vec(),
                }),
                LinkAttr::Link(value) => raw.push(RawAttr {
                    kind: crate::netlink::IFLA_LINK,
                    data: value.to_ne_bytes().to_vec(),
                }),
                LinkAttr::TxQueueLen(value) => raw.push(RawAttr {
                    kind: crate::netlink::IFLA_TXQLEN,
                    data: value.to_ne_bytes().to_vec(),
                }),
                LinkAttr::Raw { kind, bytes } => raw.push(RawAttr {
                    kind: *kind,
                    data: bytes.clone(),
                }),
            }
        }

        let name = name.to_owned();
        crate::netns::with_net_namespace(self.netns_pid, move || {
            crate::netlink::NetlinkSocket::open()?.modify_link(&name, flags, change, &raw)
        })
    }

    /// Lists interface names visible in the target namespace.
    ///
    /// # Errors
    ///
    /// Returns a network error if enumeration fails.
    pub fn list_interfaces(&self) -> Result<Vec<String>> {
        crate::netns::with_net_namespace(self.netns_pid, crate::netlink::list_interface_names)
    }
}

#[cfg(not(target_os = "linux"))]
impl NetworkManager {
    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn create_interface(&self, _config: &InterfaceConfig) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn teardown_interface(&self, _config: &InterfaceConfig) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn add_address(&self, _name: &str, _addr: IpNetwork) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn del_address(&self, _name: &str, _addr: IpNetwork) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn set_link_state(&self, _name: &str, _state: LinkState) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn get_attrs(&self, _name: &str) -> Result<Vec<LinkAttr>> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn set_attrs(&self, _name: &str, _attrs: &[LinkAttr]) -> Result<()> {
        Err(non_linux())
    }

    /// Stub for non-Linux platforms; always errors.
    ///
    /// # Errors
    ///
    /// Always returns a configuration error.
    pub fn list_interfaces(&self) -> Result<Vec<String>> {
        Err(non_linux())
    }
}

#[cfg(not(target_os = "linux"))]
fn non_linux() -> vessel_common::error::EngineError {
    vessel_common::error::EngineError::Config {
        message: "Linux required for network operations".into(),
    }
}

#[cfg(target_os = "linux")]
fn decode_attr(raw: crate::netlink::RawAttr) -> LinkAttr {
    use crate::netlink::{IFLA_ADDRESS, IFLA_LINK, IFLA_MTU, IFLA_TXQLEN};

    let as_u32 = |data: &[u8]| -> Option<u32> {
        data.get(..4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    };

    match raw.kind {
        IFLA_ADDRESS if raw.data.len() == 6 => {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&raw.data);
            LinkAttr::Mac(mac)
        }
        IFLA_MTU => as_u32(&raw.data).map_or(
            LinkAttr::Raw {
                kind: raw.kind,
                bytes: raw.data.clone(),
            },
            LinkAttr::Mtu,
        ),
        IFLA_LINK => as_u32(&raw.data).map_or(
            LinkAttr::Raw {
                kind: raw.kind,
                bytes: raw.data.clone(),
            },
            LinkAttr::Link,
        ),
        IFLA_TXQLEN => as_u32(&raw.data).map_or(
            LinkAttr::Raw {
                kind: raw.kind,
                bytes: raw.data.clone(),
            },
            LinkAttr::TxQueueLen,
        ),
        kind => LinkAttr::Raw {
            kind,
            bytes: raw.data,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macvlan_modes_match_kernel_bits() {
        assert_eq!(MacvlanMode::Private.mode_bits(), 1);
        assert_eq!(MacvlanMode::Vepa.mode_bits(), 2);
        assert_eq!(MacvlanMode::Bridge.mode_bits(), 4);
        assert_eq!(MacvlanMode::Passthru.mode_bits(), 8);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn type_attribute_is_rejected_on_write() {
        let manager = NetworkManager::host();
        let err = manager.set_attrs("lo", &[LinkAttr::Type(1)]).unwrap_err();
        assert!(matches!(
            err,
            vessel_common::error::EngineError::Config { .. }
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn loopback_attrs_include_mtu_and_flags() {
        let manager = NetworkManager::host();
        let attrs = manager.get_attrs("lo").unwrap();
        assert!(attrs.iter().any(|attr| matches!(attr, LinkAttr::Mtu(_))));
        assert!(attrs.iter().any(|attr| matches!(attr, LinkAttr::Flags(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_manager_sees_loopback() {
        let names = NetworkManager::host().list_interfaces().unwrap();
        assert!(names.iter().any(|name| name == "lo"));
    }

    #[test]
    fn bridge_is_placed_on_the_host_side() {
        let manager = NetworkManager::for_namespace(4321);
        let config = InterfaceConfig {
            kind: InterfaceKind::Bridge,
            host_name: "vsbr0".into(),
            guest_name: String::new(),
            macvlan_mode: MacvlanMode::Private,
            addresses: vec![],
            state: LinkState::Up,
            mtu: None,
            mac: None,
            txqueue_len: None,
        };
        assert_eq!(manager.placement_pid(&config), None);
    }

    #[test]
    fn veth_is_placed_in_the_container() {
        let manager = NetworkManager::for_namespace(4321);
        let config = InterfaceConfig {
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
        assert_eq!(manager.placement_pid(&config), Some(4321));
    }
}
