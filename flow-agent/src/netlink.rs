//! Minimal rtnetlink plumbing.
//!
//! Two uses only: subscribing to kernel link notifications for the interface
//! watcher, and deleting the clsact qdisc at teardown (aya creates qdiscs but
//! does not remove them). Protocol constants and kernel structs are spelled
//! out here; the wire layout is stable kernel ABI.

use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use crate::ifaces::Interface;

const NLMSG_HDRLEN: usize = mem::size_of::<libc::nlmsghdr>();

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_DELQDISC: u16 = 37;

const RTMGRP_LINK: u32 = 1;
const IFLA_IFNAME: u16 = 3;
const TCA_KIND: u16 = 1;

/// clsact qdiscs live at handle ffff:0 under the ingress/clsact parent.
const CLSACT_HANDLE: u32 = 0xFFFF_0000;
const TC_H_CLSACT: u32 = 0xFFFF_FFF1;

#[repr(C)]
#[derive(Clone, Copy)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct TcMsg {
    tcm_family: u8,
    _pad: [u8; 3],
    tcm_ifindex: i32,
    tcm_handle: u32,
    tcm_parent: u32,
    tcm_info: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    New(Interface),
    Del(Interface),
}

pub struct NetlinkSocket {
    fd: OwnedFd,
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl NetlinkSocket {
    fn open(groups: u32, nonblocking: bool) -> io::Result<NetlinkSocket> {
        let mut flags = libc::SOCK_RAW | libc::SOCK_CLOEXEC;
        if nonblocking {
            flags |= libc::SOCK_NONBLOCK;
        }
        let fd = unsafe { libc::socket(libc::AF_NETLINK, flags, libc::NETLINK_ROUTE) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(NetlinkSocket { fd })
    }

    /// Non-blocking socket joined to the link multicast group.
    pub fn link_notifications() -> io::Result<NetlinkSocket> {
        NetlinkSocket::open(RTMGRP_LINK, true)
    }

    /// Reads one datagram worth of link notifications. `WouldBlock` when the
    /// socket has nothing pending.
    pub fn recv_link_events(&self) -> io::Result<Vec<LinkEvent>> {
        let mut buf = [0u8; 8192];
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(parse_link_messages(&buf[..n as usize]))
    }

    /// Best-effort removal of the clsact qdisc on one interface. A missing
    /// qdisc is success: the kernel already dropped it with the link.
    pub fn del_clsact_qdisc(if_index: u32) -> io::Result<()> {
        let socket = NetlinkSocket::open(0, false)?;
        let request = build_del_clsact_request(if_index, 1);
        let rc = unsafe {
            libc::send(
                socket.fd.as_raw_fd(),
                request.as_ptr() as *const libc::c_void,
                request.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut buf = [0u8; 1024];
        let n = unsafe {
            libc::recv(
                socket.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        match ack_error(&buf[..n as usize]) {
            0 => Ok(()),
            libc::ENOENT => Ok(()),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Walks a buffer of netlink messages and extracts link add/delete events.
fn parse_link_messages(buf: &[u8]) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= buf.len() {
        let hdr = unsafe { buf[offset..].as_ptr().cast::<libc::nlmsghdr>().read_unaligned() };
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        match hdr.nlmsg_type {
            NLMSG_DONE | NLMSG_ERROR => break,
            RTM_NEWLINK | RTM_DELLINK => {
                let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
                if let Some(iface) = parse_ifinfo(payload) {
                    if hdr.nlmsg_type == RTM_NEWLINK {
                        events.push(LinkEvent::New(iface));
                    } else {
                        events.push(LinkEvent::Del(iface));
                    }
                }
            }
            _ => {}
        }
        offset += align4(msg_len);
    }
    events
}

fn parse_ifinfo(payload: &[u8]) -> Option<Interface> {
    let info_len = mem::size_of::<IfInfoMsg>();
    if payload.len() < info_len {
        return None;
    }
    let info = unsafe { payload.as_ptr().cast::<IfInfoMsg>().read_unaligned() };
    let name = parse_ifname_attr(&payload[info_len..])?;
    Some(Interface {
        index: info.ifi_index as u32,
        name,
    })
}

fn parse_ifname_attr(mut attrs: &[u8]) -> Option<String> {
    while attrs.len() >= 4 {
        let rta_len = u16::from_ne_bytes([attrs[0], attrs[1]]) as usize;
        let rta_type = u16::from_ne_bytes([attrs[2], attrs[3]]);
        if rta_len < 4 || rta_len > attrs.len() {
            return None;
        }
        if rta_type == IFLA_IFNAME {
            let value = &attrs[4..rta_len];
            let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
            return Some(String::from_utf8_lossy(&value[..end]).into_owned());
        }
        attrs = &attrs[align4(rta_len)..];
    }
    None
}

/// Serializes an RTM_DELQDISC request for the clsact qdisc of one interface.
fn build_del_clsact_request(if_index: u32, seq: u32) -> Vec<u8> {
    const KIND: &[u8] = b"clsact\0";
    let tcm_len = mem::size_of::<TcMsg>();
    let attr_len = 4 + KIND.len();
    let total = NLMSG_HDRLEN + tcm_len + align4(attr_len);

    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&RTM_DELQDISC.to_ne_bytes());
    msg.extend_from_slice(&((libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel fills ours in

    msg.push(libc::AF_UNSPEC as u8);
    msg.extend_from_slice(&[0u8; 3]);
    msg.extend_from_slice(&(if_index as i32).to_ne_bytes());
    msg.extend_from_slice(&CLSACT_HANDLE.to_ne_bytes());
    msg.extend_from_slice(&TC_H_CLSACT.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes()); // tcm_info

    msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    msg.extend_from_slice(&TCA_KIND.to_ne_bytes());
    msg.extend_from_slice(KIND);
    msg.resize(total, 0);
    msg
}

/// Extracts the errno from an NLMSG_ERROR ack, 0 for a plain ack.
fn ack_error(buf: &[u8]) -> i32 {
    if buf.len() < NLMSG_HDRLEN + 4 {
        return 0;
    }
    let hdr = unsafe { buf.as_ptr().cast::<libc::nlmsghdr>().read_unaligned() };
    if hdr.nlmsg_type != NLMSG_ERROR {
        return 0;
    }
    let error = i32::from_ne_bytes([
        buf[NLMSG_HDRLEN],
        buf[NLMSG_HDRLEN + 1],
        buf[NLMSG_HDRLEN + 2],
        buf[NLMSG_HDRLEN + 3],
    ]);
    -error
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_link_message(msg_type: u16, index: i32, name: &str) -> Vec<u8> {
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        let attr_len = 4 + name_bytes.len();
        let total = NLMSG_HDRLEN + mem::size_of::<IfInfoMsg>() + align4(attr_len);

        let mut msg = Vec::new();
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        // ifinfomsg
        msg.extend_from_slice(&[0u8; 4]);
        msg.extend_from_slice(&index.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        // IFLA_IFNAME attribute
        msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
        msg.extend_from_slice(&IFLA_IFNAME.to_ne_bytes());
        msg.extend_from_slice(&name_bytes);
        msg.resize(total, 0);
        msg
    }

    #[test]
    fn parses_new_and_del_link_messages() {
        let mut buf = synth_link_message(RTM_NEWLINK, 4, "eth0");
        buf.extend_from_slice(&synth_link_message(RTM_DELLINK, 9, "veth1"));

        let events = parse_link_messages(&buf);
        assert_eq!(
            events,
            vec![
                LinkEvent::New(Interface {
                    index: 4,
                    name: "eth0".to_string()
                }),
                LinkEvent::Del(Interface {
                    index: 9,
                    name: "veth1".to_string()
                }),
            ]
        );
    }

    #[test]
    fn truncated_buffers_produce_no_events() {
        let buf = synth_link_message(RTM_NEWLINK, 4, "eth0");
        assert!(parse_link_messages(&buf[..10]).is_empty());
    }

    #[test]
    fn del_clsact_request_layout() {
        let msg = build_del_clsact_request(12, 1);
        assert_eq!(msg.len() % 4, 0);

        let hdr = unsafe { msg.as_ptr().cast::<libc::nlmsghdr>().read_unaligned() };
        assert_eq!(hdr.nlmsg_len as usize, msg.len());
        assert_eq!(hdr.nlmsg_type, RTM_DELQDISC);
        assert_eq!(
            hdr.nlmsg_flags,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16
        );

        let tcm =
            unsafe { msg[NLMSG_HDRLEN..].as_ptr().cast::<TcMsg>().read_unaligned() };
        assert_eq!(tcm.tcm_ifindex, 12);
        assert_eq!(tcm.tcm_handle, CLSACT_HANDLE);
        assert_eq!(tcm.tcm_parent, TC_H_CLSACT);

        let attrs = &msg[NLMSG_HDRLEN + mem::size_of::<TcMsg>()..];
        let rta_type = u16::from_ne_bytes([attrs[2], attrs[3]]);
        assert_eq!(rta_type, TCA_KIND);
        assert_eq!(&attrs[4..11], b"clsact\0");
    }

    #[test]
    fn ack_error_extracts_errno() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((NLMSG_HDRLEN + 4) as u32).to_ne_bytes());
        buf.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        buf.extend_from_slice(&0u16.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(&(-libc::ENOENT).to_ne_bytes());
        assert_eq!(ack_error(&buf), libc::ENOENT);
    }
}
