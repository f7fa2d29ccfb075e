use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::ValueEnum;
use serde::Serialize;

use crate::error::StartupError;

pub const DEFAULT_BUFFERS_LENGTH: usize = 50;
pub const DEFAULT_CACHE_MAX_FLOWS: u32 = 5000;
pub const DEFAULT_MESSAGE_MAX_FLOWS: usize = 10_000;

/// How the informer learns about network interfaces.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ValueEnum)]
pub enum ListenMode {
    /// Enumerate interfaces every `listen_poll_period`.
    Poll,
    /// Subscribe to kernel link notifications.
    Watch,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ValueEnum)]
pub enum Direction {
    Ingress,
    Egress,
    Both,
}

impl Direction {
    /// Returns the (ingress, egress) tracing switches.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Direction::Ingress => (true, false),
            Direction::Egress => (false, true),
            Direction::Both => (true, true),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ValueEnum)]
pub enum DeduperMode {
    None,
    #[value(name = "firstCome")]
    FirstCome,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, ValueEnum)]
pub enum ExportProto {
    Grpc,
    Kafka,
    #[value(name = "ipfix+udp")]
    IpfixUdp,
    #[value(name = "ipfix+tcp")]
    IpfixTcp,
}

/// Kafka compression codec names accepted by the configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KafkaCompression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl FromStr for KafkaCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(KafkaCompression::None),
            "gzip" => Ok(KafkaCompression::Gzip),
            "snappy" => Ok(KafkaCompression::Snappy),
            "lz4" => Ok(KafkaCompression::Lz4),
            "zstd" => Ok(KafkaCompression::Zstd),
            other => Err(format!(
                "wrong Kafka compression value {other}. Admitted values are none, gzip, snappy, lz4, zstd"
            )),
        }
    }
}

/// Full agent configuration. Built by the CLI layer, validated once before
/// anything is attached.
#[derive(Clone, Debug, Serialize)]
pub struct Config {
    pub listen_interfaces: ListenMode,
    pub listen_poll_period: Duration,
    pub buffers_length: usize,
    /// 0 means "use `buffers_length`".
    pub exporter_buffer_length: usize,
    /// Allow-list of interface names; empty allows everything. Items may be
    /// literal names or slash-delimited regular expressions (`/pattern/`).
    pub interfaces: Vec<String>,
    /// Deny-list, checked after the allow-list. Same item syntax.
    pub exclude_interfaces: Vec<String>,
    pub direction: Direction,
    pub sampling: u32,
    pub cache_max_flows: u32,
    pub cache_active_timeout: Duration,
    pub deduper: DeduperMode,
    pub deduper_fc_expiry: Duration,
    pub deduper_just_mark: bool,
    pub export: ExportProto,
    pub target_host: String,
    pub target_port: u16,
    pub message_max_flows: usize,
    pub kafka_brokers: Vec<String>,
    pub kafka_topic: String,
    pub kafka_compression: String,
    pub kafka_enable_tls: bool,
    pub enable_pano: bool,
    pub log_level: String,
    pub bpf_object_path: PathBuf,
    /// Overrides agent IP auto-detection.
    pub agent_ip: Option<IpAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_interfaces: ListenMode::Watch,
            listen_poll_period: Duration::from_secs(10),
            buffers_length: DEFAULT_BUFFERS_LENGTH,
            exporter_buffer_length: 0,
            interfaces: Vec::new(),
            exclude_interfaces: Vec::new(),
            direction: Direction::Both,
            sampling: 0,
            cache_max_flows: DEFAULT_CACHE_MAX_FLOWS,
            cache_active_timeout: Duration::from_secs(5),
            deduper: DeduperMode::None,
            deduper_fc_expiry: Duration::from_secs(120),
            deduper_just_mark: false,
            export: ExportProto::Grpc,
            target_host: String::new(),
            target_port: 0,
            message_max_flows: DEFAULT_MESSAGE_MAX_FLOWS,
            kafka_brokers: Vec::new(),
            kafka_topic: "network-flows".to_string(),
            kafka_compression: "none".to_string(),
            kafka_enable_tls: false,
            enable_pano: false,
            log_level: "info".to_string(),
            bpf_object_path: PathBuf::from("/usr/lib/flow-agent/flow-agent.bpf.o"),
            agent_ip: None,
        }
    }
}

impl Config {
    /// Kernel-side trace messages follow the agent log level.
    pub fn kernel_tracing(&self) -> bool {
        matches!(self.log_level.as_str(), "debug" | "trace")
    }

    pub fn exporter_buffers(&self) -> usize {
        if self.exporter_buffer_length == 0 {
            self.buffers_length
        } else {
            self.exporter_buffer_length
        }
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        let fail = |msg: String| Err(StartupError::Config(msg));
        if self.cache_max_flows == 0 {
            return fail("cache max flows must be greater than zero".into());
        }
        if self.cache_active_timeout.is_zero() {
            return fail("cache active timeout must be greater than zero".into());
        }
        if self.buffers_length == 0 {
            return fail("buffers length must be greater than zero".into());
        }
        if self.message_max_flows == 0 {
            return fail("message max flows must be greater than zero".into());
        }
        if self.listen_interfaces == ListenMode::Poll && self.listen_poll_period.is_zero() {
            return fail("listen poll period must be greater than zero".into());
        }
        match self.export {
            ExportProto::Grpc | ExportProto::IpfixUdp | ExportProto::IpfixTcp => {
                if self.target_host.is_empty() || self.target_port == 0 {
                    return fail(format!(
                        "missing target host or port: {}:{}",
                        self.target_host, self.target_port
                    ));
                }
            }
            ExportProto::Kafka => {
                if self.kafka_brokers.is_empty() {
                    return fail("at least one Kafka broker is needed".into());
                }
                if self.kafka_topic.is_empty() {
                    return fail("a Kafka topic is needed".into());
                }
                self.kafka_compression
                    .parse::<KafkaCompression>()
                    .map_err(StartupError::Config)?;
                if self.kafka_enable_tls {
                    return fail("TLS transport to Kafka is not supported by this agent".into());
                }
            }
        }
        Ok(())
    }
}
