use std::{
    mem,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, SystemTime},
};

use anyhow::{Result, anyhow};

pub use flow_agent_common::{
    DIRECTION_EGRESS, DIRECTION_INGRESS, ETH_P_IP, ETH_P_IPV6, FlowKey, FlowMetrics, IP_LEN,
    MAC_LEN, RawRecord,
};

/// Wall clock source, injectable for tests.
pub type Clock = fn() -> SystemTime;

/// Monotonic clock source in nanoseconds, comparable with the kernel's
/// `bpf_ktime_get_ns` timestamps. Injectable for tests.
pub type MonoClock = fn() -> u64;

pub fn wall_now() -> SystemTime {
    SystemTime::now()
}

pub fn mono_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// A decorated flow record, ready for export.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: FlowKey,
    pub metrics: FlowMetrics,
    pub start: SystemTime,
    pub end: SystemTime,
    /// Resolved by the decorator; "unknown" when the registrar has no entry.
    pub interface: String,
    pub agent_ip: IpAddr,
    pub duplicate: bool,
}

impl Record {
    /// Builds a record from kernel metrics, mapping the monotonic flow
    /// timestamps onto the wall clock: the delta between "monotonic now" and
    /// the event timestamp is subtracted from "wall now".
    pub fn new(key: FlowKey, metrics: FlowMetrics, now: SystemTime, now_mono_ns: u64) -> Record {
        let start_delta = now_mono_ns.saturating_sub(metrics.start_mono_ns);
        let end_delta = now_mono_ns.saturating_sub(metrics.end_mono_ns);
        Record {
            key,
            metrics,
            start: now - Duration::from_nanos(start_delta),
            end: now - Duration::from_nanos(end_delta),
            interface: String::new(),
            agent_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            duplicate: false,
        }
    }
}

/// Merges the per-CPU metric variants of one key into a single value:
/// counters are summed, flag bitmasks OR-ed, and the observation window is
/// the min/max of the per-CPU windows.
pub fn merge_metrics<'a, I>(variants: I) -> FlowMetrics
where
    I: IntoIterator<Item = &'a FlowMetrics>,
{
    let mut merged = FlowMetrics::default();
    for m in variants {
        merged.bytes = merged.bytes.wrapping_add(m.bytes);
        merged.packets = merged.packets.wrapping_add(m.packets);
        merged.flags |= m.flags;
        if merged.start_mono_ns == 0 || (m.start_mono_ns != 0 && m.start_mono_ns < merged.start_mono_ns)
        {
            merged.start_mono_ns = m.start_mono_ns;
        }
        if m.end_mono_ns > merged.end_mono_ns {
            merged.end_mono_ns = m.end_mono_ns;
        }
    }
    merged
}

/// Parses a serialized `RawRecord` as read from the ring buffer or the perf
/// array. Extra trailing bytes (payload snippets on the perf array) are
/// ignored.
pub fn parse_raw_record(data: &[u8]) -> Result<RawRecord> {
    let want = mem::size_of::<RawRecord>();
    if data.len() < want {
        return Err(anyhow!(
            "short flow event: {} bytes, expected at least {want}",
            data.len()
        ));
    }
    // The buffer is at least `size_of::<RawRecord>()` bytes; read_unaligned
    // copes with arbitrary buffer alignment.
    Ok(unsafe { data.as_ptr().cast::<RawRecord>().read_unaligned() })
}

/// Extracts the source IP of a key, honoring the IPv4-in-16-bytes encoding.
pub fn key_ip(raw: &[u8; IP_LEN], eth_protocol: u16) -> IpAddr {
    if eth_protocol == ETH_P_IPV6 {
        IpAddr::V6(Ipv6Addr::from(*raw))
    } else {
        IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn metrics(bytes: u64, packets: u64, flags: u32, start: u64, end: u64) -> FlowMetrics {
        FlowMetrics {
            bytes,
            packets,
            flags,
            start_mono_ns: start,
            end_mono_ns: end,
            errno: 0,
            _pad: [0; 3],
        }
    }

    #[test]
    fn merge_sums_counters_and_ors_flags() {
        let cpus = [
            metrics(100, 2, 0x02, 1_000, 5_000),
            metrics(50, 1, 0x10, 2_000, 9_000),
        ];
        let merged = merge_metrics(cpus.iter());
        assert_eq!(merged.bytes, 150);
        assert_eq!(merged.packets, 3);
        assert_eq!(merged.flags, 0x12);
        assert_eq!(merged.start_mono_ns, 1_000);
        assert_eq!(merged.end_mono_ns, 9_000);
    }

    #[test]
    fn merge_single_variant_is_identity() {
        let m = metrics(7, 1, 0x04, 10, 20);
        assert_eq!(merge_metrics([m].iter()), m);
    }

    #[test]
    fn record_wall_times_follow_monotonic_deltas() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let m = metrics(10, 1, 0, 4_000_000_000, 9_000_000_000);
        let rec = Record::new(FlowKey::default(), m, now, 10_000_000_000);
        assert_eq!(rec.start, now - Duration::from_secs(6));
        assert_eq!(rec.end, now - Duration::from_secs(1));
        assert!(rec.end >= rec.start);
    }

    #[test]
    fn parse_rejects_short_buffers() {
        assert!(parse_raw_record(&[0u8; 16]).is_err());
    }

    #[test]
    fn parse_round_trips_a_record() {
        let mut raw = RawRecord::default();
        raw.key.eth_protocol = ETH_P_IP;
        raw.key.src_port = 443;
        raw.key.if_index = 7;
        raw.metrics = metrics(1500, 3, 0x02, 1, 2);
        let bytes: [u8; mem::size_of::<RawRecord>()] = unsafe { mem::transmute(raw) };
        let parsed = parse_raw_record(&bytes).unwrap();
        assert_eq!(parsed, raw);
    }

    #[test]
    fn parse_ignores_trailing_payload() {
        let raw = RawRecord::default();
        let mut bytes = [0u8; mem::size_of::<RawRecord>()].to_vec();
        bytes.copy_from_slice(&unsafe {
            mem::transmute::<RawRecord, [u8; mem::size_of::<RawRecord>()]>(raw)
        });
        bytes.extend_from_slice(&[0xAA; 64]);
        assert!(parse_raw_record(&bytes).is_ok());
    }

    #[test]
    fn key_ip_decodes_both_families() {
        let mut v4 = [0u8; IP_LEN];
        v4[12..].copy_from_slice(&[10, 9, 8, 7]);
        assert_eq!(key_ip(&v4, ETH_P_IP), IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)));

        let v6 = Ipv6Addr::new(0x8888, 0, 0, 0, 0, 0, 0, 0x1111);
        assert_eq!(key_ip(&v6.octets(), ETH_P_IPV6), IpAddr::V6(v6));
    }
}
