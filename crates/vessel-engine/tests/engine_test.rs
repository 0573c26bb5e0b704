//! End-to-end container lifecycle tests.
//!
//! The privileged tests exercise real namespaces, veth pairs, and
//! credential drops; they skip themselves when not running as root.

#![cfg(target_os = "linux")]

use std::time::Duration;

use vessel_common::error::EngineError;
use vessel_common::state::ContainerState;
use vessel_core::capability::{Capability, CapabilitySet};
use vessel_core::filesystem::{MountConfig, MountFlag};
use vessel_core::namespace::{Namespace, namespace_id};
use vessel_engine::{AttachConfig, Container, ContainerConfig, NamespaceConfig};
use vessel_net::{InterfaceConfig, InterfaceKind, LinkAttr, LinkState, MacvlanMode, NetworkManager};

/// Namespace kinds the tests isolate. USER is left out: these tests run
/// as real root and dropping into an unmapped user namespace would make
/// the credential stages fail by design.
const TEST_KINDS: [Namespace; 5] = [
    Namespace::Mount,
    Namespace::Pid,
    Namespace::Uts,
    Namespace::Ipc,
    Namespace::Net,
];

fn privileged() -> bool {
    nix::unistd::geteuid().is_root()
}

/// `RUST_LOG=debug` makes the guard and sequencer narrate a failing run.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn base_config(name: &str) -> ContainerConfig {
    init_tracing();
    let mut config = ContainerConfig::new(name, "/", vec!["/bin/sleep".into(), "30".into()]);
    config.namespaces = NamespaceConfig::create_all(&TEST_KINDS);
    config.hostname = "vessel-test".into();
    config
}

fn veth_config(host_name: &str) -> InterfaceConfig {
    InterfaceConfig {
        kind: InterfaceKind::Veth,
        host_name: host_name.into(),
        guest_name: "eth0".into(),
        macvlan_mode: MacvlanMode::Private,
        addresses: vec!["10.0.3.2/24".parse().unwrap()],
        state: LinkState::Up,
        mtu: None,
        mac: None,
        txqueue_len: None,
    }
}

#[test]
fn unprivileged_start_fails_without_partial_state() {
    if privileged() {
        return;
    }
    let mut container = Container::create(base_config("unpriv")).unwrap();
    let err = container.start().unwrap_err();
    assert!(matches!(err, EngineError::ProcessSetup { .. }));
    assert_eq!(container.state(), ContainerState::Stopped);
    assert_eq!(container.init_pid(), None);
    assert_eq!(container.guard_pid(), None);
}

#[test]
fn namespaces_are_distinct_from_the_host() {
    if !privileged() {
        return;
    }
    let mut container = Container::create(base_config("ns-distinct")).unwrap();
    container.start().unwrap();
    assert_eq!(container.state(), ContainerState::Running);

    let init_pid = container.init_pid().unwrap();
    let own_pid = std::process::id() as i32;
    for kind in TEST_KINDS {
        let container_ns = namespace_id(init_pid, kind).unwrap();
        let host_ns = namespace_id(own_pid, kind).unwrap();
        assert_ne!(container_ns, host_ns, "kind {kind} not isolated");
    }

    container.stop(false).unwrap();
    assert_eq!(container.state(), ContainerState::Stopped);
    // Idempotence: stopping a stopped container is a success no-op.
    container.stop(false).unwrap();
    container.destroy().unwrap();
}

#[test]
fn veth_interface_comes_up_with_its_address() {
    if !privileged() {
        return;
    }
    let mut config = base_config("veth-up");
    config.interfaces = vec![veth_config("vslt0h")];
    let mut container = Container::create(config).unwrap();
    container.start().unwrap();

    let names = container.get_interfaces().unwrap();
    assert!(names.iter().any(|name| name == "eth0"));
    assert!(names.iter().any(|name| name == "lo"));

    let attrs = container.get_attrs("eth0").unwrap();
    let up = attrs
        .iter()
        .any(|attr| matches!(attr, LinkAttr::Flags(flags) if flags & 0x1 != 0));
    assert!(up, "eth0 should be administratively up");

    // The configured address is present: adding it again collides.
    let addr = "10.0.3.2/24".parse().unwrap();
    let err = container.add_address("eth0", addr).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EEXIST));

    // And it can be removed and re-added through the public surface.
    container.del_address("eth0", addr).unwrap();
    container.add_address("eth0", addr).unwrap();

    container.stop(true).unwrap();
    container.destroy().unwrap();
}

#[test]
fn capability_keep_set_bounds_the_container() {
    if !privileged() {
        return;
    }
    let mut config = base_config("caps");
    config.caps_to_keep = CapabilitySet::from_caps(&[Capability::NetAdmin]);
    let mut container = Container::create(config).unwrap();
    container.start().unwrap();

    let init_pid = container.init_pid().unwrap();
    let status = std::fs::read_to_string(format!("/proc/{init_pid}/status")).unwrap();
    let bounding = parse_cap_line(&status, "CapBnd:");
    let effective = parse_cap_line(&status, "CapEff:");

    let net_admin = 1u64 << Capability::NetAdmin.bit();
    let sys_admin = 1u64 << Capability::SysAdmin.bit();
    assert_eq!(bounding, net_admin, "bounding set should be exactly NET_ADMIN");
    assert_ne!(effective & net_admin, 0, "NET_ADMIN should be effective");
    assert_eq!(effective & sys_admin, 0, "SYS_ADMIN must be gone");

    container.stop(true).unwrap();
    container.destroy().unwrap();
}

#[test]
fn attach_drops_identity_and_shares_namespaces() {
    if !privileged() {
        return;
    }
    let mut container = Container::create(base_config("attach")).unwrap();
    container.start().unwrap();
    let init_pid = container.init_pid().unwrap();

    let mut attach = AttachConfig::new(vec!["/bin/sleep".into(), "30".into()]);
    attach.uid = 1000;
    attach.gid = 1000;
    attach.namespaces = TEST_KINDS.to_vec();
    let attached_pid = container.attach(&attach).unwrap();
    assert!(attached_pid > 0);
    assert_eq!(container.state(), ContainerState::Running);

    // Give the attach helper's child time to finish its setup.
    std::thread::sleep(Duration::from_millis(500));

    let status = std::fs::read_to_string(format!("/proc/{attached_pid}/status")).unwrap();
    assert!(status.lines().any(|line| {
        line.starts_with("Uid:") && line.split_whitespace().nth(2) == Some("1000")
    }));
    assert!(status.lines().any(|line| {
        line.starts_with("Gid:") && line.split_whitespace().nth(2) == Some("1000")
    }));

    for kind in [Namespace::Pid, Namespace::Net, Namespace::Mount] {
        assert_eq!(
            namespace_id(attached_pid, kind).unwrap(),
            namespace_id(init_pid, kind).unwrap(),
            "attached process should share the {kind} namespace"
        );
    }

    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(attached_pid),
        nix::sys::signal::Signal::SIGKILL,
    );
    container.stop(true).unwrap();
    container.destroy().unwrap();
}

#[test]
fn failed_mount_rolls_back_the_whole_attempt() {
    if !privileged() {
        return;
    }
    let mut config = base_config("rollback");
    config.interfaces = vec![veth_config("vsltrb")];
    config.mounts = vec![MountConfig {
        source: "/nonexistent/vessel-missing-source".into(),
        target: "/data".into(),
        fstype: String::new(),
        flags: vec![MountFlag::Bind],
        data: String::new(),
    }];
    let mut container = Container::create(config).unwrap();

    let err = container.start().unwrap_err();
    assert!(matches!(err, EngineError::FilesystemSetup { .. }));
    assert_eq!(err.errno(), Some(libc::ENOENT));

    // No partial container: no processes, and the veth (whose creation
    // would only have happened after the mount stage) never existed.
    assert_eq!(container.state(), ContainerState::Stopped);
    assert_eq!(container.init_pid(), None);
    assert_eq!(container.guard_pid(), None);
    let host_err = NetworkManager::host().get_attrs("vsltrb").unwrap_err();
    assert_eq!(host_err.errno(), Some(libc::ENODEV));

    container.destroy().unwrap();
}

#[test]
fn init_exit_moves_the_container_to_stopped() {
    if !privileged() {
        return;
    }
    let mut config = base_config("short-init");
    config.init = vec!["/bin/sleep".into(), "0.2".into()];
    let mut container = Container::create(config).unwrap();
    container.start().unwrap();

    // Wait for init to exit on its own and the guard to notice.
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(container.state(), ContainerState::Stopped);
    assert_eq!(container.exit_status(), Some(0));

    // Attach after init death must fail, not hang.
    let err = container
        .attach(&AttachConfig::new(vec!["/bin/true".into()]))
        .unwrap_err();
    assert!(matches!(err, EngineError::ProcessSetup { .. }));

    container.destroy().unwrap();
}

fn parse_cap_line(status: &str, prefix: &str) -> u64 {
    let line = status
        .lines()
        .find(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("missing {prefix} in /proc status"));
    let hex = line.split_whitespace().nth(1).unwrap();
    u64::from_str_radix(hex, 16).unwrap()
}
