//! Raw rtnetlink transport for link and address configuration.
//!
//! Speaks `NETLINK_ROUTE` over an `AF_NETLINK` socket: request messages
//! are assembled from `#[repr(C)]` headers and 4-byte-aligned attributes,
//! acknowledgements carry a negative errno on rejection, which is
//! surfaced as a network error with that code.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use ipnetwork::IpNetwork;
use vessel_common::error::{EngineError, Result};

const NETLINK_ROUTE: i32 = 0;

// Message types.
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const NLMSG_ERROR: u16 = 2;

// Request flags.
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

// Link attributes.
pub(crate) const IFLA_ADDRESS: u16 = 1;
pub(crate) const IFLA_IFNAME: u16 = 3;
pub(crate) const IFLA_MTU: u16 = 4;
pub(crate) const IFLA_LINK: u16 = 5;
pub(crate) const IFLA_TXQLEN: u16 = 13;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const IFLA_MACVLAN_MODE: u16 = 1;

// Address attributes.
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const NLA_F_NESTED: u16 = 1 << 15;

/// `IFF_UP` from `linux/if.h`.
pub(crate) const IFF_UP: u32 = 0x1;

const RECV_BUF_LEN: usize = 8192;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlAttr {
    nla_len: u16,
    nla_type: u16,
}

fn push_struct<T: Copy>(buf: &mut Vec<u8>, value: &T) {
    // SAFETY: T is a plain #[repr(C)] message struct; reading its bytes
    // is well-defined.
    let bytes =
        unsafe { std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), mem::size_of::<T>()) };
    buf.extend_from_slice(bytes);
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// An attribute as carried on the wire: a kind and its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttr {
    /// `IFLA_*` attribute kind.
    pub kind: u16,
    /// Attribute payload, without padding.
    pub data: Vec<u8>,
}

/// Link state as reported by a `RTM_GETLINK` query.
#[derive(Debug, Clone)]
pub struct LinkDetails {
    /// Interface index.
    pub index: u32,
    /// Active `IFF_*` flag word.
    pub flags: u32,
    /// ARP hardware type (`ARPHRD_*`).
    pub link_type: u16,
    /// All attributes the kernel attached to the reply.
    pub attrs: Vec<RawAttr>,
}

/// Request message under construction.
struct Request {
    buf: Vec<u8>,
}

impl Request {
    fn link(msg_type: u16, flags: u16, seq: u32, index: i32, ifi_flags: u32, change: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        push_struct(
            &mut buf,
            &NlMsgHdr {
                nlmsg_len: 0,
                nlmsg_type: msg_type,
                nlmsg_flags: flags,
                nlmsg_seq: seq,
                nlmsg_pid: 0,
            },
        );
        push_struct(
            &mut buf,
            &IfInfoMsg {
                ifi_family: libc::AF_UNSPEC as u8,
                _pad: 0,
                ifi_type: 0,
                ifi_index: index,
                ifi_flags,
                ifi_change: change,
            },
        );
        Self { buf }
    }

    fn addr(msg_type: u16, flags: u16, seq: u32, family: u8, prefix: u8, index: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        push_struct(
            &mut buf,
            &NlMsgHdr {
                nlmsg_len: 0,
                nlmsg_type: msg_type,
                nlmsg_flags: flags,
                nlmsg_seq: seq,
                nlmsg_pid: 0,
            },
        );
        push_struct(
            &mut buf,
            &IfAddrMsg {
                ifa_family: family,
                ifa_prefixlen: prefix,
                ifa_flags: 0,
                ifa_scope: 0,
                ifa_index: index,
            },
        );
        Self { buf }
    }

    fn attr_bytes(&mut self, kind: u16, data: &[u8]) {
        let attr_len = mem::size_of::<NlAttr>() + data.len();
        push_struct(
            &mut self.buf,
            &NlAttr {
                nla_len: attr_len as u16,
                nla_type: kind,
            },
        );
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + (align4(attr_len) - attr_len), 0);
    }

    fn attr_str(&mut self, kind: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.attr_bytes(kind, &data);
    }

    fn attr_u32(&mut self, kind: u16, value: u32) {
        self.attr_bytes(kind, &value.to_ne_bytes());
    }

    /// Opens a nested attribute; returns the token to close it with.
    fn begin_nested(&mut self, kind: u16) -> usize {
        let start = self.buf.len();
        push_struct(
            &mut self.buf,
            &NlAttr {
                nla_len: 0,
                nla_type: kind | NLA_F_NESTED,
            },
        );
        start
    }

    fn end_nested(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// A bound `NETLINK_ROUTE` socket.
///
/// Sockets belong to the network namespace of the thread that opened
/// them, so namespace-scoped callers must open the socket on an already
/// namespace-entered thread (see [`crate::netns`]).
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    /// Opens and binds the socket in the calling thread's namespace.
    ///
    /// # Errors
    ///
    /// Returns a network error if the socket cannot be created or bound.
    pub fn open() -> Result<Self> {
        // SAFETY: plain socket(2) invocation.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(last_net_error("create netlink socket"));
        }
        // SAFETY: fd was just returned by socket(2) and is owned here.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: addr is a valid sockaddr_nl for the lifetime of the call.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_net_error("bind netlink socket"));
        }

        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, msg: &[u8], context: &str) -> Result<()> {
        // SAFETY: msg is a valid buffer for the duration of the call.
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(last_net_error(context));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], context: &str) -> Result<usize> {
        loop {
            // SAFETY: buf is a valid writable buffer for the call.
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                    0,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(EngineError::Network {
                    message: format!("{context}: recv failed: {err}"),
                    errno: err.raw_os_error().unwrap_or(0),
                });
            }
        }
    }

    /// Sends a request and consumes the kernel acknowledgement.
    fn execute(&mut self, msg: Vec<u8>, context: &str) -> Result<()> {
        self.send(&msg, context)?;

        let mut buf = [0u8; RECV_BUF_LEN];
        let len = self.recv(&mut buf, context)?;
        if len < mem::size_of::<NlMsgHdr>() {
            return Err(EngineError::Network {
                message: format!("{context}: truncated netlink reply ({len} bytes)"),
                errno: 0,
            });
        }

        // SAFETY: length was checked; the buffer holds at least a header.
        let hdr = unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<NlMsgHdr>()) };
        if hdr.nlmsg_type == NLMSG_ERROR && len >= mem::size_of::<NlMsgHdr>() + 4 {
            // SAFETY: an error message carries an i32 code after the header.
            let code = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<i32>())
            };
            if code != 0 {
                let errno = -code;
                return Err(EngineError::Network {
                    message: format!(
                        "{context}: kernel rejected request: {}",
                        io::Error::from_raw_os_error(errno)
                    ),
                    errno,
                });
            }
        }
        Ok(())
    }

    /// Sends a `RTM_GETLINK` and parses the single-link reply.
    fn query_link(&mut self, msg: Vec<u8>, context: &str) -> Result<LinkDetails> {
        self.send(&msg, context)?;

        let mut buf = [0u8; RECV_BUF_LEN];
        let len = self.recv(&mut buf, context)?;
        if len < mem::size_of::<NlMsgHdr>() + mem::size_of::<IfInfoMsg>() {
            return Err(EngineError::Network {
                message: format!("{context}: truncated link reply ({len} bytes)"),
                errno: 0,
            });
        }

        // SAFETY: length checked above.
        let hdr = unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<NlMsgHdr>()) };
        if hdr.nlmsg_type == NLMSG_ERROR {
            // SAFETY: error replies carry an i32 code after the header.
            let code = unsafe {
                std::ptr::read_unaligned(buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<i32>())
            };
            let errno = -code;
            return Err(EngineError::Network {
                message: format!(
                    "{context}: kernel rejected query: {}",
                    io::Error::from_raw_os_error(errno)
                ),
                errno,
            });
        }

        // SAFETY: a non-error reply to GETLINK starts with ifinfomsg.
        let info = unsafe {
            std::ptr::read_unaligned(
                buf.as_ptr().add(mem::size_of::<NlMsgHdr>()).cast::<IfInfoMsg>(),
            )
        };

        let mut attrs = Vec::new();
        let mut offset = mem::size_of::<NlMsgHdr>() + mem::size_of::<IfInfoMsg>();
        let end = (hdr.nlmsg_len as usize).min(len);
        while offset + mem::size_of::<NlAttr>() <= end {
            // SAFETY: offset stays within the received, length-checked region.
            let attr =
                unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset).cast::<NlAttr>()) };
            let attr_len = attr.nla_len as usize;
            if attr_len < mem::size_of::<NlAttr>() || offset + attr_len > end {
                break;
            }
            let data_start = offset + mem::size_of::<NlAttr>();
            attrs.push(RawAttr {
                kind: attr.nla_type & !NLA_F_NESTED,
                data: buf[data_start..offset + attr_len].to_vec(),
            });
            offset += align4(attr_len);
        }

        Ok(LinkDetails {
            index: info.ifi_index as u32,
            flags: info.ifi_flags,
            link_type: info.ifi_type,
            attrs,
        })
    }

    /// Resolves an interface name to its index in this namespace.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist.
    pub fn if_index(&self, name: &str) -> Result<u32> {
        let c_name = CString::new(name).map_err(|_| EngineError::Network {
            message: format!("interface name contains NUL: {name:?}"),
            errno: libc::EINVAL,
        })?;
        // SAFETY: c_name is a valid NUL-terminated string.
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(EngineError::Network {
                message: format!("interface not found: {name}"),
                errno: libc::ENODEV,
            });
        }
        Ok(index)
    }

    /// Creates a veth pair: `host` stays in this namespace, `guest` is
    /// created directly inside the namespace of `guest_ns_pid` when
    /// given, so no window exists in which the guest end is visible on
    /// the host.
    ///
    /// # Errors
    ///
    /// Returns a network error if the kernel rejects the request.
    pub fn create_veth(&mut self, host: &str, guest: &str, guest_ns_pid: Option<i32>) -> Result<()> {
        let seq = self.next_seq();
        let mut req = Request::link(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
            0,
            0,
            0,
        );
        req.attr_str(IFLA_IFNAME, host);

        let linkinfo = req.begin_nested(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "veth");
        let data = req.begin_nested(IFLA_INFO_DATA);
        let peer = req.begin_nested(VETH_INFO_PEER);
        push_struct(
            &mut req.buf,
            &IfInfoMsg {
                ifi_family: libc::AF_UNSPEC as u8,
                _pad: 0,
                ifi_type: 0,
                ifi_index: 0,
                ifi_flags: 0,
                ifi_change: 0,
            },
        );
        req.attr_str(IFLA_IFNAME, guest);
        if let Some(pid) = guest_ns_pid {
            req.attr_u32(IFLA_NET_NS_PID, pid as u32);
        }
        req.end_nested(peer);
        req.end_nested(data);
        req.end_nested(linkinfo);

        self.execute(req.finish(), &format!("create veth {host}/{guest}"))?;
        tracing::debug!(host, guest, ?guest_ns_pid, "veth pair created");
        Ok(())
    }

    /// Creates a bridge master device in this namespace.
    ///
    /// # Errors
    ///
    /// Returns a network error if the kernel rejects the request.
    pub fn create_bridge(&mut self, name: &str) -> Result<()> {
        let seq = self.next_seq();
        let mut req = Request::link(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
            0,
            0,
            0,
        );
        req.attr_str(IFLA_IFNAME, name);
        let linkinfo = req.begin_nested(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "bridge");
        req.end_nested(linkinfo);

        self.execute(req.finish(), &format!("create bridge {name}"))?;
        tracing::debug!(name, "bridge created");
        Ok(())
    }

    /// Creates a macvlan shim on top of `lower` with the given
    /// `MACVLAN_MODE_*` value.
    ///
    /// # Errors
    ///
    /// Returns a network error if the lower device is missing or the
    /// kernel rejects the request.
    pub fn create_macvlan(&mut self, name: &str, lower: &str, mode: u32) -> Result<()> {
        let lower_index = self.if_index(lower)?;
        let seq = self.next_seq();
        let mut req = Request::link(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
            0,
            0,
            0,
        );
        req.attr_str(IFLA_IFNAME, name);
        req.attr_u32(IFLA_LINK, lower_index);
        let linkinfo = req.begin_nested(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "macvlan");
        let data = req.begin_nested(IFLA_INFO_DATA);
        req.attr_u32(IFLA_MACVLAN_MODE, mode);
        req.end_nested(data);
        req.end_nested(linkinfo);

        self.execute(req.finish(), &format!("create macvlan {name} on {lower}"))?;
        tracing::debug!(name, lower, mode, "macvlan created");
        Ok(())
    }

    /// Moves an interface into the network namespace of `target_pid`.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist or the
    /// kernel rejects the move.
    pub fn move_link(&mut self, name: &str, target_pid: i32) -> Result<()> {
        let index = self.if_index(name)?;
        let seq = self.next_seq();
        let mut req = Request::link(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq, index as i32, 0, 0);
        req.attr_u32(IFLA_NET_NS_PID, target_pid as u32);

        self.execute(req.finish(), &format!("move {name} to pid {target_pid}"))?;
        tracing::debug!(name, target_pid, "interface moved");
        Ok(())
    }

    /// Deletes an interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist or the
    /// kernel rejects the request.
    pub fn delete_link(&mut self, name: &str) -> Result<()> {
        let index = self.if_index(name)?;
        let seq = self.next_seq();
        let req = Request::link(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq, index as i32, 0, 0);

        self.execute(req.finish(), &format!("delete {name}"))?;
        tracing::debug!(name, "interface deleted");
        Ok(())
    }

    /// Brings an interface up or down.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist or the
    /// kernel rejects the request.
    pub fn set_link_state(&mut self, name: &str, up: bool) -> Result<()> {
        let index = self.if_index(name)?;
        let flags = if up { IFF_UP } else { 0 };
        let seq = self.next_seq();
        let req = Request::link(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            index as i32,
            flags,
            IFF_UP,
        );

        self.execute(req.finish(), &format!("set {name} {}", if up { "up" } else { "down" }))?;
        tracing::debug!(name, up, "link state changed");
        Ok(())
    }

    /// Applies raw attributes and an optional flag change to a link.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist or the
    /// kernel rejects an attribute.
    pub fn modify_link(
        &mut self,
        name: &str,
        flags: u32,
        change: u32,
        attrs: &[RawAttr],
    ) -> Result<()> {
        let index = self.if_index(name)?;
        let seq = self.next_seq();
        let mut req = Request::link(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            index as i32,
            flags,
            change,
        );
        for attr in attrs {
            req.attr_bytes(attr.kind, &attr.data);
        }

        self.execute(req.finish(), &format!("modify {name}"))?;
        Ok(())
    }

    /// Queries the kernel's view of one link.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist.
    pub fn get_link(&mut self, name: &str) -> Result<LinkDetails> {
        let seq = self.next_seq();
        let mut req = Request::link(RTM_GETLINK, NLM_F_REQUEST, seq, 0, 0, 0);
        req.attr_str(IFLA_IFNAME, name);
        self.query_link(req.finish(), &format!("query {name}"))
    }

    /// Adds an address to an interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface does not exist or the
    /// kernel rejects the address.
    pub fn add_address(&mut self, name: &str, addr: IpNetwork) -> Result<()> {
        let index = self.if_index(name)?;
        let seq = self.next_seq();
        let mut req = Request::addr(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
            address_family(addr),
            addr.prefix(),
            index,
        );
        append_address(&mut req, addr, true);

        self.execute(req.finish(), &format!("add {addr} to {name}"))?;
        tracing::debug!(name, %addr, "address added");
        Ok(())
    }

    /// Removes an address from an interface.
    ///
    /// # Errors
    ///
    /// Returns a network error if the interface or address does not
    /// exist.
    pub fn del_address(&mut self, name: &str, addr: IpNetwork) -> Result<()> {
        let index = self.if_index(name)?;
        let seq = self.next_seq();
        let mut req = Request::addr(
            RTM_DELADDR,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
            address_family(addr),
            addr.prefix(),
            index,
        );
        append_address(&mut req, addr, false);

        self.execute(req.finish(), &format!("del {addr} from {name}"))?;
        tracing::debug!(name, %addr, "address removed");
        Ok(())
    }
}

const fn address_family(addr: IpNetwork) -> u8 {
    match addr {
        IpNetwork::V4(_) => libc::AF_INET as u8,
        IpNetwork::V6(_) => libc::AF_INET6 as u8,
    }
}

fn append_address(req: &mut Request, addr: IpNetwork, with_peer: bool) {
    match addr {
        IpNetwork::V4(v4) => {
            let octets = v4.ip().octets();
            req.attr_bytes(IFA_LOCAL, &octets);
            if with_peer {
                req.attr_bytes(IFA_ADDRESS, &octets);
            }
        }
        IpNetwork::V6(v6) => {
            let octets = v6.ip().octets();
            req.attr_bytes(IFA_LOCAL, &octets);
            if with_peer {
                req.attr_bytes(IFA_ADDRESS, &octets);
            }
        }
    }
}

fn last_net_error(context: &str) -> EngineError {
    let err = io::Error::last_os_error();
    EngineError::Network {
        message: format!("{context} failed: {err}"),
        errno: err.raw_os_error().unwrap_or(0),
    }
}

/// Lists interface names visible in the calling thread's namespace.
///
/// # Errors
///
/// Returns a network error if `if_nameindex(3)` fails.
pub fn list_interface_names() -> Result<Vec<String>> {
    // SAFETY: if_nameindex returns a NULL-terminated array that must be
    // released with if_freenameindex.
    let head = unsafe { libc::if_nameindex() };
    if head.is_null() {
        return Err(last_net_error("enumerate interfaces"));
    }

    let mut names = Vec::new();
    let mut cursor = head;
    // SAFETY: the array is terminated by an entry with if_index == 0;
    // cursor never advances past it.
    unsafe {
        while (*cursor).if_index != 0 {
            let name = std::ffi::CStr::from_ptr((*cursor).if_name);
            names.push(name.to_string_lossy().into_owned());
            cursor = cursor.add(1);
        }
        libc::if_freenameindex(head);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_are_padded_to_four_bytes() {
        let mut req = Request::link(RTM_NEWLINK, NLM_F_REQUEST, 1, 0, 0, 0);
        let before = req.buf.len();
        req.attr_str(IFLA_IFNAME, "eth0");
        // header(4) + "eth0\0"(5) = 9, padded to 12.
        assert_eq!(req.buf.len() - before, 12);
    }

    #[test]
    fn finish_patches_total_length() {
        let mut req = Request::link(RTM_NEWLINK, NLM_F_REQUEST, 1, 0, 0, 0);
        req.attr_u32(IFLA_MTU, 1500);
        let msg = req.finish();
        let len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]);
        assert_eq!(len as usize, msg.len());
    }

    #[test]
    fn nested_attribute_length_covers_contents() {
        let mut req = Request::link(RTM_NEWLINK, NLM_F_REQUEST, 1, 0, 0, 0);
        let start = req.begin_nested(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "veth");
        req.end_nested(start);

        let nla_len = u16::from_ne_bytes([req.buf[start], req.buf[start + 1]]);
        let nla_type = u16::from_ne_bytes([req.buf[start + 2], req.buf[start + 3]]);
        assert_eq!(nla_len as usize, req.buf.len() - start);
        assert_eq!(nla_type, IFLA_LINKINFO | NLA_F_NESTED);
    }

    #[test]
    fn loopback_is_enumerable() {
        let names = list_interface_names().unwrap();
        assert!(names.iter().any(|name| name == "lo"));
    }

    #[test]
    fn socket_opens_without_privilege() {
        // Opening and binding NETLINK_ROUTE needs no capabilities.
        let socket = NetlinkSocket::open().unwrap();
        assert!(socket.if_index("lo").unwrap() > 0);
    }

    #[test]
    fn missing_interface_reports_enodev() {
        let socket = NetlinkSocket::open().unwrap();
        let err = socket.if_index("vessel-does-not-exist").unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENODEV));
    }

    #[test]
    fn loopback_link_is_queryable() {
        let mut socket = NetlinkSocket::open().unwrap();
        let details = socket.get_link("lo").unwrap();
        assert!(details.index > 0);
        assert!(details.attrs.iter().any(|attr| attr.kind == IFLA_MTU));
    }
}
