#![no_std]

// Types shared between userspace and the TC classifier programs.
// Keep this crate `no_std` friendly so it can be used from eBPF code.
//
// Layouts are `repr(C)` with explicit padding so that both sides agree on
// the byte image without relying on compiler-inserted padding.

pub const MAC_LEN: usize = 6;
pub const IP_LEN: usize = 16;

/// Ethernet protocol numbers carried in `FlowKey::eth_protocol`.
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;

/// `FlowKey::direction` values.
pub const DIRECTION_INGRESS: u8 = 0;
pub const DIRECTION_EGRESS: u8 = 1;

/// Identifies one unidirectional flow on one interface.
///
/// IPv4 addresses are stored in the last 4 bytes of the 16-byte field, the
/// first 12 bytes zeroed.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub eth_protocol: u16,
    pub direction: u8,
    pub src_mac: [u8; MAC_LEN],
    pub dst_mac: [u8; MAC_LEN],
    pub _pad0: u8,
    pub src_ip: [u8; IP_LEN],
    pub dst_ip: [u8; IP_LEN],
    pub src_port: u16,
    pub dst_port: u16,
    pub transport_protocol: u8,
    pub _pad1: [u8; 3],
    pub if_index: u32,
}

/// Counters accumulated for one flow.
///
/// Timestamps are monotonic nanoseconds as produced by `bpf_ktime_get_ns`.
/// `errno` is the positive error of the failed map insertion that forced a
/// record onto the ring buffer, 0 otherwise.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowMetrics {
    pub bytes: u64,
    pub packets: u64,
    pub start_mono_ns: u64,
    pub end_mono_ns: u64,
    pub flags: u32,
    pub errno: u8,
    pub _pad: [u8; 3],
}

/// Complete single-flow record as emitted on the ring buffer and the perf
/// array. The explicit pad keeps `metrics` 8-byte aligned.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawRecord {
    pub key: FlowKey,
    pub _pad: u32,
    pub metrics: FlowMetrics,
}

#[cfg(feature = "user")]
mod user_impls {
    use super::{FlowKey, FlowMetrics, RawRecord};
    use aya::Pod;

    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowMetrics {}
    unsafe impl Pod for RawRecord {}
}
