//! Protobuf wire form of flow records, as consumed by the collector.
//!
//! Hand-written encoder/decoder for a small, frozen schema:
//!
//! ```text
//! Records  { repeated Record entries = 1; }
//! Record   { uint32 eth_protocol = 1; uint32 direction = 2;
//!            Timestamp time_flow_start = 3; Timestamp time_flow_end = 4;
//!            DataLink data_link = 5; Network network = 6;
//!            Transport transport = 7; uint64 bytes = 8;
//!            uint64 packets = 9; uint32 flags = 10;
//!            string interface = 11; bool duplicate = 12; IP agent_ip = 13; }
//! Timestamp { uint64 seconds = 1; uint32 nanos = 2; }
//! DataLink { uint64 src_mac = 1; uint64 dst_mac = 2; }
//! Network  { IP src_addr = 1; IP dst_addr = 2; }
//! Transport { uint32 src_port = 1; uint32 dst_port = 2; uint32 protocol = 3; }
//! IP       { oneof: uint32 ipv4 = 1; bytes ipv6 = 2; }
//! ```
//!
//! IPv4 addresses travel as big-endian u32 (10.9.8.7 is 0x0A090807), IPv6 as
//! 16 raw bytes. MACs are packed into u64 with the first array byte highest
//! (11:22:33:44:55:66 is 0x112233445566).

use std::{
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Result, anyhow, bail};

use crate::model::{ETH_P_IPV6, IP_LEN, MAC_LEN, Record};

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpValue {
    V4(u32),
    V6([u8; IP_LEN]),
}

/// Decoded form of one record, used by tests and conforming collectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireRecord {
    pub eth_protocol: u32,
    pub direction: u32,
    pub start_seconds: u64,
    pub start_nanos: u32,
    pub end_seconds: u64,
    pub end_nanos: u32,
    pub src_mac: u64,
    pub dst_mac: u64,
    pub src_addr: Option<IpValue>,
    pub dst_addr: Option<IpValue>,
    pub src_port: u32,
    pub dst_port: u32,
    pub protocol: u32,
    pub bytes: u64,
    pub packets: u64,
    pub flags: u32,
    pub interface: String,
    pub duplicate: bool,
    pub agent_ip: Option<IpValue>,
}

pub fn encode_records(records: &[Record]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(records.len() * 96);
    for record in records {
        let entry = encode_record(record);
        put_tag(&mut buf, 1, WIRE_LEN);
        put_varint(&mut buf, entry.len() as u64);
        buf.extend_from_slice(&entry);
    }
    buf
}

fn encode_record(record: &Record) -> Vec<u8> {
    let key = &record.key;
    let mut buf = Vec::with_capacity(96);

    put_uint(&mut buf, 1, key.eth_protocol as u64);
    put_uint(&mut buf, 2, key.direction as u64);
    put_message(&mut buf, 3, &encode_timestamp(record.start));
    put_message(&mut buf, 4, &encode_timestamp(record.end));

    let mut data_link = Vec::with_capacity(20);
    put_uint(&mut data_link, 1, mac_to_u64(&key.src_mac));
    put_uint(&mut data_link, 2, mac_to_u64(&key.dst_mac));
    put_message(&mut buf, 5, &data_link);

    let mut network = Vec::with_capacity(44);
    put_message(&mut network, 1, &encode_ip(key_ip_value(&key.src_ip, key.eth_protocol)));
    put_message(&mut network, 2, &encode_ip(key_ip_value(&key.dst_ip, key.eth_protocol)));
    put_message(&mut buf, 6, &network);

    let mut transport = Vec::with_capacity(12);
    put_uint(&mut transport, 1, key.src_port as u64);
    put_uint(&mut transport, 2, key.dst_port as u64);
    put_uint(&mut transport, 3, key.transport_protocol as u64);
    put_message(&mut buf, 7, &transport);

    put_uint(&mut buf, 8, record.metrics.bytes);
    put_uint(&mut buf, 9, record.metrics.packets);
    put_uint(&mut buf, 10, record.metrics.flags as u64);

    put_tag(&mut buf, 11, WIRE_LEN);
    put_varint(&mut buf, record.interface.len() as u64);
    buf.extend_from_slice(record.interface.as_bytes());

    put_uint(&mut buf, 12, record.duplicate as u64);
    put_message(&mut buf, 13, &encode_ip(agent_ip_value(record.agent_ip)));
    buf
}

fn encode_timestamp(time: SystemTime) -> Vec<u8> {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let mut buf = Vec::with_capacity(16);
    put_uint(&mut buf, 1, since_epoch.as_secs());
    put_uint(&mut buf, 2, since_epoch.subsec_nanos() as u64);
    buf
}

fn encode_ip(value: IpValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    match value {
        IpValue::V4(addr) => put_uint(&mut buf, 1, addr as u64),
        IpValue::V6(octets) => {
            put_tag(&mut buf, 2, WIRE_LEN);
            put_varint(&mut buf, octets.len() as u64);
            buf.extend_from_slice(&octets);
        }
    }
    buf
}

fn key_ip_value(raw: &[u8; IP_LEN], eth_protocol: u16) -> IpValue {
    if eth_protocol == ETH_P_IPV6 {
        IpValue::V6(*raw)
    } else {
        IpValue::V4(u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]))
    }
}

fn agent_ip_value(ip: IpAddr) -> IpValue {
    match ip {
        IpAddr::V4(v4) => IpValue::V4(u32::from_be_bytes(v4.octets())),
        IpAddr::V6(v6) => IpValue::V6(v6.octets()),
    }
}

/// MAC bytes are packed in array order: 11:22:33:44:55:66 → 0x112233445566.
fn mac_to_u64(mac: &[u8; MAC_LEN]) -> u64 {
    mac.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

// --- encoding primitives -------------------------------------------------

fn put_tag(buf: &mut Vec<u8>, field: u64, wire_type: u64) {
    put_varint(buf, (field << 3) | wire_type);
}

fn put_uint(buf: &mut Vec<u8>, field: u64, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

fn put_message(buf: &mut Vec<u8>, field: u64, body: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, body.len() as u64);
    buf.extend_from_slice(body);
}

pub(crate) fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

// --- decoding ------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| anyhow!("truncated varint"))?;
            self.pos += 1;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift >= 64 {
                bail!("varint too long");
            }
        }
    }

    fn field(&mut self) -> Result<(u64, u64)> {
        let tag = self.varint()?;
        Ok((tag >> 3, tag & 0x7))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| anyhow!("truncated length-delimited field"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, wire_type: u64) -> Result<()> {
        match wire_type {
            WIRE_VARINT => {
                self.varint()?;
            }
            1 => self.pos += 8,
            WIRE_LEN => {
                self.bytes()?;
            }
            5 => self.pos += 4,
            other => bail!("unsupported wire type {other}"),
        }
        Ok(())
    }
}

pub fn decode_records(buf: &[u8]) -> Result<Vec<WireRecord>> {
    let mut reader = Reader::new(buf);
    let mut records = Vec::new();
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        if field == 1 && wire_type == WIRE_LEN {
            records.push(decode_record(reader.bytes()?)?);
        } else {
            reader.skip(wire_type)?;
        }
    }
    Ok(records)
}

fn decode_record(buf: &[u8]) -> Result<WireRecord> {
    let mut reader = Reader::new(buf);
    let mut rec = WireRecord::default();
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => rec.eth_protocol = reader.varint()? as u32,
            2 => rec.direction = reader.varint()? as u32,
            3 => (rec.start_seconds, rec.start_nanos) = decode_timestamp(reader.bytes()?)?,
            4 => (rec.end_seconds, rec.end_nanos) = decode_timestamp(reader.bytes()?)?,
            5 => (rec.src_mac, rec.dst_mac) = decode_data_link(reader.bytes()?)?,
            6 => (rec.src_addr, rec.dst_addr) = decode_network(reader.bytes()?)?,
            7 => {
                (rec.src_port, rec.dst_port, rec.protocol) = decode_transport(reader.bytes()?)?;
            }
            8 => rec.bytes = reader.varint()?,
            9 => rec.packets = reader.varint()?,
            10 => rec.flags = reader.varint()? as u32,
            11 => rec.interface = String::from_utf8_lossy(reader.bytes()?).into_owned(),
            12 => rec.duplicate = reader.varint()? != 0,
            13 => rec.agent_ip = decode_ip(reader.bytes()?)?,
            _ => reader.skip(wire_type)?,
        }
    }
    Ok(rec)
}

fn decode_timestamp(buf: &[u8]) -> Result<(u64, u32)> {
    let mut reader = Reader::new(buf);
    let (mut seconds, mut nanos) = (0, 0);
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => seconds = reader.varint()?,
            2 => nanos = reader.varint()? as u32,
            _ => reader.skip(wire_type)?,
        }
    }
    Ok((seconds, nanos))
}

fn decode_data_link(buf: &[u8]) -> Result<(u64, u64)> {
    let mut reader = Reader::new(buf);
    let (mut src, mut dst) = (0, 0);
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => src = reader.varint()?,
            2 => dst = reader.varint()?,
            _ => reader.skip(wire_type)?,
        }
    }
    Ok((src, dst))
}

fn decode_network(buf: &[u8]) -> Result<(Option<IpValue>, Option<IpValue>)> {
    let mut reader = Reader::new(buf);
    let (mut src, mut dst) = (None, None);
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => src = decode_ip(reader.bytes()?)?,
            2 => dst = decode_ip(reader.bytes()?)?,
            _ => reader.skip(wire_type)?,
        }
    }
    Ok((src, dst))
}

fn decode_transport(buf: &[u8]) -> Result<(u32, u32, u32)> {
    let mut reader = Reader::new(buf);
    let (mut src_port, mut dst_port, mut protocol) = (0, 0, 0);
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => src_port = reader.varint()? as u32,
            2 => dst_port = reader.varint()? as u32,
            3 => protocol = reader.varint()? as u32,
            _ => reader.skip(wire_type)?,
        }
    }
    Ok((src_port, dst_port, protocol))
}

fn decode_ip(buf: &[u8]) -> Result<Option<IpValue>> {
    let mut reader = Reader::new(buf);
    let mut ip = None;
    while !reader.done() {
        let (field, wire_type) = reader.field()?;
        match field {
            1 => ip = Some(IpValue::V4(reader.varint()? as u32)),
            2 => {
                let bytes = reader.bytes()?;
                if bytes.len() != IP_LEN {
                    bail!("IPv6 address of {} bytes", bytes.len());
                }
                let mut octets = [0u8; IP_LEN];
                octets.copy_from_slice(bytes);
                ip = Some(IpValue::V6(octets));
            }
            _ => reader.skip(wire_type)?,
        }
    }
    Ok(ip)
}
