//! Container lifecycle engine.
//!
//! Ties the isolation primitives together: a guard process supervises
//! each container's init, the bring-up sequencer walks the ordered
//! stage list inside the new namespaces, and attach re-enters a running
//! container's namespace set. All entry points are synchronous and
//! blocking; concurrent calls against one container must be serialized
//! by the caller.

pub mod attach;
pub mod config;
pub mod container;
pub(crate) mod guard;
pub(crate) mod sequencer;

pub use attach::AttachConfig;
pub use config::{ContainerConfig, NamespaceConfig, NamespaceMode};
pub use container::Container;
