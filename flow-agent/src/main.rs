use std::{net::IpAddr, path::PathBuf, process::exit, time::Duration};

use clap::Parser;
use log::{error, info};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use flow_agent::agent::Flows;
use flow_agent::config::{Config, DeduperMode, Direction, ExportProto, ListenMode};

#[derive(Parser)]
#[command(name = "flow-agent")]
#[command(about = "Network-flow observability agent", long_about = None)]
struct Cli {
    /// How to learn about network interfaces
    #[arg(long, value_enum, default_value_t = ListenMode::Watch)]
    listen_interfaces: ListenMode,
    /// Seconds between interface enumerations when polling
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    listen_poll_period_secs: u64,
    /// Bounded channel size between pipeline stages
    #[arg(long, default_value_t = flow_agent::config::DEFAULT_BUFFERS_LENGTH)]
    buffers_length: usize,
    /// Channel size into the exporter; 0 uses --buffers-length
    #[arg(long, default_value_t = 0)]
    exporter_buffer_length: usize,
    /// Allowed interface names; literal or /regex/. Empty allows all
    #[arg(long = "interface", value_name = "NAME")]
    interfaces: Vec<String>,
    /// Denied interface names, checked after the allow list
    #[arg(long = "exclude-interface", value_name = "NAME")]
    exclude_interfaces: Vec<String>,
    /// Traffic directions to trace
    #[arg(long, value_enum, default_value_t = Direction::Both)]
    direction: Direction,
    /// Packet sampling ratio passed to the kernel program (0 = all packets)
    #[arg(long, default_value_t = 0)]
    sampling: u32,
    /// Bound for the kernel map and the userspace flow cache
    #[arg(long, default_value_t = flow_agent::config::DEFAULT_CACHE_MAX_FLOWS)]
    cache_max_flows: u32,
    /// Seconds a flow may stay cached before eviction
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    cache_active_timeout_secs: u64,
    /// Cross-interface duplicate suppression
    #[arg(long, value_enum, default_value_t = DeduperMode::None)]
    deduper: DeduperMode,
    /// Seconds of inactivity before the deduper forgets a flow
    #[arg(long, value_name = "SECONDS", default_value_t = 120)]
    deduper_fc_expiry_secs: u64,
    /// Forward duplicates flagged instead of dropping them
    #[arg(long)]
    deduper_just_mark: bool,
    /// Export wire format
    #[arg(long, value_enum, default_value_t = ExportProto::Grpc)]
    export: ExportProto,
    /// Collector host for grpc and ipfix exports
    #[arg(long, default_value = "")]
    target_host: String,
    /// Collector port for grpc and ipfix exports
    #[arg(long, default_value_t = 0)]
    target_port: u16,
    /// Maximum records per outbound message
    #[arg(long, default_value_t = flow_agent::config::DEFAULT_MESSAGE_MAX_FLOWS)]
    message_max_flows: usize,
    /// Kafka bootstrap brokers (host:port)
    #[arg(long = "kafka-broker", value_name = "BROKER")]
    kafka_brokers: Vec<String>,
    #[arg(long, default_value = "network-flows")]
    kafka_topic: String,
    /// none, gzip, snappy, lz4 or zstd
    #[arg(long, default_value = "none")]
    kafka_compression: String,
    #[arg(long)]
    kafka_enable_tls: bool,
    /// Perf-only topology: per-packet events aggregated in userspace
    #[arg(long)]
    enable_pano: bool,
    /// error, warn, info, debug or trace; debug and trace also enable
    /// kernel-side trace messages
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Compiled TC classifier object
    #[arg(long, value_name = "PATH", default_value = "/usr/lib/flow-agent/flow-agent.bpf.o")]
    bpf_object: PathBuf,
    /// Reported agent IP; autodetected from the export route when unset
    #[arg(long)]
    agent_ip: Option<IpAddr>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            listen_interfaces: self.listen_interfaces,
            listen_poll_period: Duration::from_secs(self.listen_poll_period_secs),
            buffers_length: self.buffers_length,
            exporter_buffer_length: self.exporter_buffer_length,
            interfaces: self.interfaces,
            exclude_interfaces: self.exclude_interfaces,
            direction: self.direction,
            sampling: self.sampling,
            cache_max_flows: self.cache_max_flows,
            cache_active_timeout: Duration::from_secs(self.cache_active_timeout_secs),
            deduper: self.deduper,
            deduper_fc_expiry: Duration::from_secs(self.deduper_fc_expiry_secs),
            deduper_just_mark: self.deduper_just_mark,
            export: self.export,
            target_host: self.target_host,
            target_port: self.target_port,
            message_max_flows: self.message_max_flows,
            kafka_brokers: self.kafka_brokers,
            kafka_topic: self.kafka_topic,
            kafka_compression: self.kafka_compression,
            kafka_enable_tls: self.kafka_enable_tls,
            enable_pano: self.enable_pano,
            log_level: self.log_level,
            bpf_object_path: self.bpf_object,
            agent_ip: self.agent_ip,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cli.log_level.clone()),
    )
    .init();

    let cfg = cli.into_config();
    let mut agent = match Flows::new(cfg).await {
        Ok(agent) => agent,
        Err(err) => {
            error!("can't start the flows agent: {err}");
            exit(1);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    if let Err(err) = agent.run(cancel).await {
        error!("flows agent error: {err:#}");
        exit(1);
    }
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!("can't install SIGTERM handler: {err}");
            cancel.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    cancel.cancel();
}
