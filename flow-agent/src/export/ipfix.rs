//! IPFIX (RFC 7011) export over UDP or TCP.
//!
//! Two fixed-layout templates, one per flow address family, built from IANA
//! information elements. Templates are announced when the sink opens and
//! re-announced periodically on UDP, where the initial announcement may be
//! lost.

use std::{
    net::IpAddr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use log::debug;
use tokio::net::{TcpStream, UdpSocket};
use tokio::io::AsyncWriteExt;

use crate::model::{DIRECTION_INGRESS, ETH_P_IPV6, Record};

const IPFIX_VERSION: u16 = 10;
const MESSAGE_HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 2;
const TEMPLATE_V4: u16 = 256;
const TEMPLATE_V6: u16 = 257;

const UDP_TEMPLATE_REFRESH: Duration = Duration::from_secs(600);
/// Payload budgets keeping UDP datagrams under common MTUs.
const UDP_MAX_MESSAGE: usize = 1440;
const TCP_MAX_MESSAGE: usize = 8192;

// (information element id, field length)
const IE_OCTET_DELTA_COUNT: (u16, u16) = (1, 8);
const IE_PACKET_DELTA_COUNT: (u16, u16) = (2, 8);
const IE_PROTOCOL_IDENTIFIER: (u16, u16) = (4, 1);
const IE_TCP_CONTROL_BITS: (u16, u16) = (6, 2);
const IE_SOURCE_TRANSPORT_PORT: (u16, u16) = (7, 2);
const IE_SOURCE_IPV4_ADDRESS: (u16, u16) = (8, 4);
const IE_INGRESS_INTERFACE: (u16, u16) = (10, 4);
const IE_DEST_TRANSPORT_PORT: (u16, u16) = (11, 2);
const IE_DEST_IPV4_ADDRESS: (u16, u16) = (12, 4);
const IE_SOURCE_IPV6_ADDRESS: (u16, u16) = (27, 16);
const IE_DEST_IPV6_ADDRESS: (u16, u16) = (28, 16);
const IE_SOURCE_MAC_ADDRESS: (u16, u16) = (56, 6);
const IE_FLOW_DIRECTION: (u16, u16) = (61, 1);
const IE_DEST_MAC_ADDRESS: (u16, u16) = (80, 6);
const IE_EXPORTER_IPV4_ADDRESS: (u16, u16) = (130, 4);
const IE_EXPORTER_IPV6_ADDRESS: (u16, u16) = (131, 16);
const IE_FLOW_START_MILLISECONDS: (u16, u16) = (152, 8);
const IE_FLOW_END_MILLISECONDS: (u16, u16) = (153, 8);

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

pub struct IpfixSink {
    transport: Transport,
    encoder: Encoder,
    seq: u32,
    obs_domain: u32,
    templates_sent: Option<Instant>,
}

impl IpfixSink {
    pub async fn connect_udp(target: &str, agent_ip: IpAddr) -> Result<IpfixSink> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding IPFIX UDP socket")?;
        socket
            .connect(target)
            .await
            .with_context(|| format!("connecting IPFIX UDP socket to {target}"))?;
        Ok(IpfixSink::new(Transport::Udp(socket), agent_ip))
    }

    pub async fn connect_tcp(target: &str, agent_ip: IpAddr) -> Result<IpfixSink> {
        let stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("connecting IPFIX TCP socket to {target}"))?;
        Ok(IpfixSink::new(Transport::Tcp(stream), agent_ip))
    }

    fn new(transport: Transport, agent_ip: IpAddr) -> IpfixSink {
        IpfixSink {
            transport,
            encoder: Encoder { agent_ip },
            seq: 0,
            obs_domain: std::process::id(),
            templates_sent: None,
        }
    }

    pub async fn send(&mut self, batch: &[Record]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let max_message = match self.transport {
            Transport::Udp(_) => UDP_MAX_MESSAGE,
            Transport::Tcp(_) => TCP_MAX_MESSAGE,
        };

        let mut sets = Vec::new();
        if self.templates_due() {
            sets.extend_from_slice(&self.encoder.template_sets());
            self.templates_sent = Some(Instant::now());
        }

        let per_message = self.encoder.records_per_message(max_message - sets.len());
        for chunk in batch.chunks(per_message.max(1)) {
            let mut chunk_sets = std::mem::take(&mut sets);
            chunk_sets.extend_from_slice(&self.encoder.data_sets(chunk));
            let message = build_message(export_seconds(), self.seq, self.obs_domain, &chunk_sets);
            self.write(&message).await?;
            self.seq = self.seq.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    /// Templates precede the first data set; UDP re-announces them since the
    /// collector may have started after the initial message.
    fn templates_due(&self) -> bool {
        match (&self.transport, self.templates_sent) {
            (_, None) => true,
            (Transport::Udp(_), Some(sent)) => sent.elapsed() >= UDP_TEMPLATE_REFRESH,
            (Transport::Tcp(_), Some(_)) => false,
        }
    }

    async fn write(&mut self, message: &[u8]) -> Result<()> {
        match &mut self.transport {
            Transport::Udp(socket) => {
                socket.send(message).await.context("sending IPFIX datagram")?;
            }
            Transport::Tcp(stream) => {
                stream
                    .write_all(message)
                    .await
                    .context("writing IPFIX message")?;
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Transport::Tcp(stream) = &mut self.transport {
            if let Err(err) = stream.shutdown().await {
                debug!("closing IPFIX stream: {err}");
            }
        }
    }
}

struct Encoder {
    agent_ip: IpAddr,
}

impl Encoder {
    fn shared_fields(&self) -> Vec<(u16, u16)> {
        let mut fields = vec![
            IE_OCTET_DELTA_COUNT,
            IE_PACKET_DELTA_COUNT,
            IE_FLOW_START_MILLISECONDS,
            IE_FLOW_END_MILLISECONDS,
            IE_INGRESS_INTERFACE,
            IE_FLOW_DIRECTION,
            IE_PROTOCOL_IDENTIFIER,
            IE_TCP_CONTROL_BITS,
            IE_SOURCE_TRANSPORT_PORT,
            IE_DEST_TRANSPORT_PORT,
            IE_SOURCE_MAC_ADDRESS,
            IE_DEST_MAC_ADDRESS,
        ];
        fields.push(match self.agent_ip {
            IpAddr::V4(_) => IE_EXPORTER_IPV4_ADDRESS,
            IpAddr::V6(_) => IE_EXPORTER_IPV6_ADDRESS,
        });
        fields
    }

    fn fields_for(&self, template: u16) -> Vec<(u16, u16)> {
        let mut fields = self.shared_fields();
        if template == TEMPLATE_V6 {
            fields.push(IE_SOURCE_IPV6_ADDRESS);
            fields.push(IE_DEST_IPV6_ADDRESS);
        } else {
            fields.push(IE_SOURCE_IPV4_ADDRESS);
            fields.push(IE_DEST_IPV4_ADDRESS);
        }
        fields
    }

    fn record_len(&self, template: u16) -> usize {
        self.fields_for(template)
            .iter()
            .map(|&(_, len)| len as usize)
            .sum()
    }

    fn records_per_message(&self, budget: usize) -> usize {
        // A mixed chunk produces one set per template.
        let overhead = MESSAGE_HEADER_LEN + 2 * SET_HEADER_LEN;
        budget.saturating_sub(overhead) / self.record_len(TEMPLATE_V6).max(1)
    }

    /// One template set describing both templates.
    fn template_sets(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for template in [TEMPLATE_V4, TEMPLATE_V6] {
            let fields = self.fields_for(template);
            body.extend_from_slice(&template.to_be_bytes());
            body.extend_from_slice(&(fields.len() as u16).to_be_bytes());
            for (id, len) in fields {
                body.extend_from_slice(&id.to_be_bytes());
                body.extend_from_slice(&len.to_be_bytes());
            }
        }
        let mut set = Vec::with_capacity(SET_HEADER_LEN + body.len());
        set.extend_from_slice(&TEMPLATE_SET_ID.to_be_bytes());
        set.extend_from_slice(&((SET_HEADER_LEN + body.len()) as u16).to_be_bytes());
        set.extend_from_slice(&body);
        set
    }

    /// Data sets for one chunk, at most one per template.
    fn data_sets(&self, records: &[Record]) -> Vec<u8> {
        let mut out = Vec::new();
        for (template, is_v6) in [(TEMPLATE_V4, false), (TEMPLATE_V6, true)] {
            let mut body = Vec::new();
            for record in records
                .iter()
                .filter(|r| (r.key.eth_protocol == ETH_P_IPV6) == is_v6)
            {
                body.extend_from_slice(&self.record_bytes(record, is_v6));
            }
            if body.is_empty() {
                continue;
            }
            out.extend_from_slice(&template.to_be_bytes());
            out.extend_from_slice(&((SET_HEADER_LEN + body.len()) as u16).to_be_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    fn record_bytes(&self, record: &Record, v6: bool) -> Vec<u8> {
        let key = &record.key;
        let mut out = Vec::with_capacity(self.record_len(if v6 {
            TEMPLATE_V6
        } else {
            TEMPLATE_V4
        }));
        out.extend_from_slice(&record.metrics.bytes.to_be_bytes());
        out.extend_from_slice(&record.metrics.packets.to_be_bytes());
        out.extend_from_slice(&unix_millis(record.start).to_be_bytes());
        out.extend_from_slice(&unix_millis(record.end).to_be_bytes());
        out.extend_from_slice(&key.if_index.to_be_bytes());
        out.push(if key.direction == DIRECTION_INGRESS { 0 } else { 1 });
        out.push(key.transport_protocol);
        out.extend_from_slice(&(record.metrics.flags as u16).to_be_bytes());
        out.extend_from_slice(&key.src_port.to_be_bytes());
        out.extend_from_slice(&key.dst_port.to_be_bytes());
        out.extend_from_slice(&key.src_mac);
        out.extend_from_slice(&key.dst_mac);
        match self.agent_ip {
            IpAddr::V4(addr) => out.extend_from_slice(&addr.octets()),
            IpAddr::V6(addr) => out.extend_from_slice(&addr.octets()),
        }
        if v6 {
            out.extend_from_slice(&key.src_ip);
            out.extend_from_slice(&key.dst_ip);
        } else {
            out.extend_from_slice(&key.src_ip[12..]);
            out.extend_from_slice(&key.dst_ip[12..]);
        }
        out
    }
}

fn build_message(export_time: u32, seq: u32, obs_domain: u32, sets: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(MESSAGE_HEADER_LEN + sets.len());
    message.extend_from_slice(&IPFIX_VERSION.to_be_bytes());
    message.extend_from_slice(&((MESSAGE_HEADER_LEN + sets.len()) as u16).to_be_bytes());
    message.extend_from_slice(&export_time.to_be_bytes());
    message.extend_from_slice(&seq.to_be_bytes());
    message.extend_from_slice(&obs_domain.to_be_bytes());
    message.extend_from_slice(sets);
    message
}

fn export_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ETH_P_IP, FlowKey, FlowMetrics};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn encoder() -> Encoder {
        Encoder {
            agent_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }

    fn record(eth_protocol: u16) -> Record {
        Record {
            key: FlowKey {
                eth_protocol,
                src_port: 443,
                dst_port: 9999,
                transport_protocol: 6,
                if_index: 2,
                ..FlowKey::default()
            },
            metrics: FlowMetrics {
                bytes: 100,
                packets: 2,
                flags: 0x12,
                ..FlowMetrics::default()
            },
            start: UNIX_EPOCH + Duration::from_secs(1_650_000_000),
            end: UNIX_EPOCH + Duration::from_secs(1_650_000_005),
            interface: "eth0".to_string(),
            agent_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            duplicate: false,
        }
    }

    #[test]
    fn message_header_carries_version_and_length() {
        let enc = encoder();
        let sets = enc.data_sets(&[record(ETH_P_IP)]);
        let message = build_message(1_650_000_000, 7, 42, &sets);

        assert_eq!(u16::from_be_bytes([message[0], message[1]]), IPFIX_VERSION);
        assert_eq!(
            u16::from_be_bytes([message[2], message[3]]) as usize,
            message.len()
        );
        assert_eq!(
            u32::from_be_bytes([message[8], message[9], message[10], message[11]]),
            7
        );
    }

    #[test]
    fn template_set_describes_both_templates() {
        let enc = encoder();
        let set = enc.template_sets();
        assert_eq!(u16::from_be_bytes([set[0], set[1]]), TEMPLATE_SET_ID);
        assert_eq!(u16::from_be_bytes([set[2], set[3]]) as usize, set.len());
        // First template record is the IPv4 one.
        assert_eq!(u16::from_be_bytes([set[4], set[5]]), TEMPLATE_V4);
        let field_count = u16::from_be_bytes([set[6], set[7]]) as usize;
        assert_eq!(field_count, enc.fields_for(TEMPLATE_V4).len());
    }

    #[test]
    fn data_record_length_matches_template() {
        let enc = encoder();
        let v4 = enc.record_bytes(&record(ETH_P_IP), false);
        assert_eq!(v4.len(), enc.record_len(TEMPLATE_V4));
        let v6 = enc.record_bytes(&record(ETH_P_IPV6), true);
        assert_eq!(v6.len(), enc.record_len(TEMPLATE_V6));
    }

    #[test]
    fn data_sets_split_by_family() {
        let enc = encoder();
        let sets = enc.data_sets(&[record(ETH_P_IP), record(ETH_P_IPV6), record(ETH_P_IP)]);

        let v4_len = SET_HEADER_LEN + 2 * enc.record_len(TEMPLATE_V4);
        assert_eq!(u16::from_be_bytes([sets[0], sets[1]]), TEMPLATE_V4);
        assert_eq!(u16::from_be_bytes([sets[2], sets[3]]) as usize, v4_len);
        assert_eq!(
            u16::from_be_bytes([sets[v4_len], sets[v4_len + 1]]),
            TEMPLATE_V6
        );
        assert_eq!(
            sets.len(),
            v4_len + SET_HEADER_LEN + enc.record_len(TEMPLATE_V6)
        );
    }

    #[test]
    fn records_per_message_fits_the_udp_budget() {
        let enc = encoder();
        let per_message = enc.records_per_message(UDP_MAX_MESSAGE);
        assert!(per_message >= 1);
        let worst = MESSAGE_HEADER_LEN
            + 2 * SET_HEADER_LEN
            + per_message * enc.record_len(TEMPLATE_V6);
        assert!(worst <= UDP_MAX_MESSAGE);
    }
}
