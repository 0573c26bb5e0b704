//! Virtual network device management for the vessel container engine.
//!
//! Creates and configures veth pairs, bridges, macvlan shims, and moved
//! physical interfaces over a raw rtnetlink socket. Operations that
//! target a container's network namespace run on a dedicated,
//! namespace-entered thread (see [`netns`]).

pub mod interface;
#[cfg(target_os = "linux")]
pub mod netlink;
pub mod netns;

pub use interface::{
    InterfaceConfig, InterfaceKind, LinkAttr, LinkState, MacvlanMode, NetworkManager,
};
