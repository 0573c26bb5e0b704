//! Linux isolation primitives for the vessel container engine.
//!
//! Safe wrappers around the namespace, capability, credential, mount,
//! and terminal syscalls, plus the process-spawn and barrier machinery
//! the engine builds its bring-up sequence on.

pub mod barrier;
pub mod capability;
pub mod credentials;
pub mod environment;
pub mod filesystem;
pub mod namespace;
pub mod process;
pub mod terminal;
