//! Minimal Kafka producer speaking the classic wire protocol directly:
//! produce requests (v2) carrying a single-message set (v1) whose value is
//! the protobuf-encoded record batch. One partition, leader discovery and
//! rebalancing are left to the collector-side tooling.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::config::KafkaCompression;

const API_KEY_PRODUCE: i16 = 0;
const API_VERSION: i16 = 2;
const CLIENT_ID: &str = "flow-agent";
const REQUIRED_ACKS: i16 = 1;
const REQUEST_TIMEOUT_MS: i32 = 5_000;
const MESSAGE_MAGIC: i8 = 1;

pub struct KafkaSink {
    stream: TcpStream,
    topic: String,
    correlation: i32,
}

impl KafkaSink {
    /// Connects to the first reachable broker of the list.
    pub async fn connect(
        brokers: &[String],
        topic: &str,
        compression: KafkaCompression,
    ) -> Result<KafkaSink> {
        if compression != KafkaCompression::None {
            warn!("Kafka compression {compression:?} accepted but not applied by this producer");
        }
        for broker in brokers {
            match TcpStream::connect(broker.as_str()).await {
                Ok(stream) => {
                    debug!("connected to Kafka broker {broker}");
                    return Ok(KafkaSink {
                        stream,
                        topic: topic.to_string(),
                        correlation: 0,
                    });
                }
                Err(err) => warn!("Kafka broker {broker} unreachable: {err}"),
            }
        }
        Err(anyhow!("no reachable Kafka broker among {brokers:?}"))
    }

    pub async fn send(&mut self, value: &[u8]) -> Result<()> {
        self.correlation = self.correlation.wrapping_add(1);
        let request = build_produce_request(
            &self.topic,
            self.correlation,
            unix_millis(),
            value,
        );
        self.stream
            .write_all(&request)
            .await
            .context("writing produce request")?;

        let mut size = [0u8; 4];
        self.stream
            .read_exact(&mut size)
            .await
            .context("reading produce response size")?;
        let size = i32::from_be_bytes(size);
        if !(8..=1_048_576).contains(&size) {
            bail!("implausible produce response size {size}");
        }
        let mut body = vec![0u8; size as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .context("reading produce response")?;

        let error_code = parse_produce_error(&body)?;
        if error_code != 0 {
            bail!("broker rejected batch with error code {error_code}");
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            debug!("closing Kafka stream: {err}");
        }
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Serializes a complete produce request frame, size prefix included.
fn build_produce_request(topic: &str, correlation: i32, timestamp_ms: i64, value: &[u8]) -> Vec<u8> {
    // message: crc, magic, attributes, timestamp, key (null), value
    let mut message = Vec::with_capacity(22 + value.len());
    message.push(MESSAGE_MAGIC as u8);
    message.push(0); // attributes: no compression
    message.extend_from_slice(&timestamp_ms.to_be_bytes());
    message.extend_from_slice(&(-1i32).to_be_bytes());
    message.extend_from_slice(&(value.len() as i32).to_be_bytes());
    message.extend_from_slice(value);
    let crc = crc32(&message);

    let mut message_set = Vec::with_capacity(16 + message.len());
    message_set.extend_from_slice(&0i64.to_be_bytes()); // offset, broker-assigned
    message_set.extend_from_slice(&((message.len() + 4) as i32).to_be_bytes());
    message_set.extend_from_slice(&crc.to_be_bytes());
    message_set.extend_from_slice(&message);

    let mut body = Vec::with_capacity(64 + message_set.len());
    body.extend_from_slice(&API_KEY_PRODUCE.to_be_bytes());
    body.extend_from_slice(&API_VERSION.to_be_bytes());
    body.extend_from_slice(&correlation.to_be_bytes());
    put_string(&mut body, CLIENT_ID);
    body.extend_from_slice(&REQUIRED_ACKS.to_be_bytes());
    body.extend_from_slice(&REQUEST_TIMEOUT_MS.to_be_bytes());
    body.extend_from_slice(&1i32.to_be_bytes()); // one topic
    put_string(&mut body, topic);
    body.extend_from_slice(&1i32.to_be_bytes()); // one partition
    body.extend_from_slice(&0i32.to_be_bytes()); // partition 0
    body.extend_from_slice(&(message_set.len() as i32).to_be_bytes());
    body.extend_from_slice(&message_set);

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as i16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Extracts the first partition error code from a produce v2 response body
/// (correlation id onward, size prefix stripped).
fn parse_produce_error(body: &[u8]) -> Result<i16> {
    let mut pos = 4; // correlation id
    let topic_count = read_i32(body, &mut pos)?;
    if topic_count < 1 {
        bail!("produce response without topics");
    }
    let topic_len = read_i16(body, &mut pos)? as usize;
    pos += topic_len;
    let partition_count = read_i32(body, &mut pos)?;
    if partition_count < 1 {
        bail!("produce response without partitions");
    }
    pos += 4; // partition index
    read_i16(body, &mut pos)
}

fn read_i16(buf: &[u8], pos: &mut usize) -> Result<i16> {
    let bytes = buf
        .get(*pos..*pos + 2)
        .ok_or_else(|| anyhow!("truncated produce response"))?;
    *pos += 2;
    Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_i32(buf: &[u8], pos: &mut usize) -> Result<i32> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| anyhow!("truncated produce response"))?;
    *pos += 4;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

// CRC-32 (IEEE 802.3), the checksum the classic message format mandates.
const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc32_table();

fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}
