//! Filesystem setup for container bring-up.
//!
//! Mount-list application with reverse-order rollback, and the
//! pivot-root switch into the container's root filesystem.

pub mod mount;
pub mod pivot_root;

pub use mount::{MountConfig, MountFlag, apply_mounts, mount_filesystem, rollback_mounts, unmount};
pub use pivot_root::pivot_into_root;
