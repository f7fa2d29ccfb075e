//! The flows agent: builds the processing graph, runs it, and tears it down
//! in order on cancellation.

use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    account::Accounter,
    config::{Config, DeduperMode, ListenMode},
    dedup::Deduper,
    error::StartupError,
    export::{self, Sink},
    fetch::FlowFetcher,
    ifaces::{Informer, InterfaceFilter, NameCache, run_registrar},
    model,
    pipeline,
    scrape::MapScraper,
    trace::{PerfTracer, RingBufTracer},
};

/// Lifecycle of the agent, mostly useful to tests and health reporting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NotStarted => "NotStarted",
            Status::Starting => "Starting",
            Status::Started => "Started",
            Status::Stopping => "Stopping",
            Status::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

pub struct Flows {
    cfg: Config,
    filter: Option<InterfaceFilter>,
    informer: Informer,
    fetcher: Arc<Mutex<FlowFetcher>>,
    names: NameCache,
    agent_ip: IpAddr,
    sink: Option<Sink>,
    dropped_batches: Arc<AtomicU64>,
    status: Status,
}

impl Flows {
    /// Validates the configuration and acquires every startup-fatal
    /// resource: agent IP, eBPF objects, the exporter connection.
    pub async fn new(cfg: Config) -> Result<Flows, StartupError> {
        info!("initializing flows agent");
        cfg.validate()?;
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "effective configuration: {}",
                serde_json::to_string(&cfg).unwrap_or_default()
            );
        }

        let agent_ip = resolve_agent_ip(&cfg)?;
        debug!("agent IP: {agent_ip}");

        let filter = InterfaceFilter::new(&cfg.interfaces, &cfg.exclude_interfaces)?;
        let informer = match cfg.listen_interfaces {
            ListenMode::Poll => {
                debug!(
                    "listening for new interfaces: polling every {:?}",
                    cfg.listen_poll_period
                );
                Informer::Poll {
                    period: cfg.listen_poll_period,
                }
            }
            ListenMode::Watch => {
                debug!("listening for new interfaces: kernel notifications");
                Informer::Watch
            }
        };

        let (ingress, egress) = cfg.direction.flags();
        let fetcher = FlowFetcher::new(
            &cfg.bpf_object_path,
            cfg.kernel_tracing(),
            cfg.sampling,
            cfg.cache_max_flows,
            ingress,
            egress,
            cfg.enable_pano,
        )
        .map_err(StartupError::BpfLoad)?;

        let sink = export::build_sink(&cfg, agent_ip).await?;

        Ok(Flows {
            cfg,
            filter: Some(filter),
            informer,
            fetcher: Arc::new(Mutex::new(fetcher)),
            names: NameCache::default(),
            agent_ip,
            sink: Some(sink),
            dropped_batches: Arc::new(AtomicU64::new(0)),
            status: Status::NotStarted,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Runs the agent until the token is cancelled, then drains the graph:
    /// producers stop first and close their outputs, consumers drain, the
    /// exporter sink is closed last.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.status != Status::NotStarted {
            bail!("agent already ran (status {})", self.status);
        }
        self.status = Status::Starting;
        info!("starting flows agent");

        let sink = self.sink.take().context("exporter sink missing")?;
        let filter = self.filter.take().context("interface filter missing")?;
        let buffers = self.cfg.buffers_length;

        let events = self
            .informer
            .subscribe(buffers, cancel.clone())
            .context("subscribing to interface events")?;
        let registrar = tokio::spawn(run_registrar(
            events,
            filter,
            self.fetcher.clone(),
            self.names.clone(),
            cancel.clone(),
        ));

        // Fan-in point of every record producer.
        let (records_tx, records_rx) = mpsc::channel(buffers);
        let (raw_tx, raw_rx) = mpsc::channel(buffers);

        let mut producers: Vec<JoinHandle<()>> = vec![registrar];
        let mut consumers: Vec<JoinHandle<()>> = Vec::new();

        if self.cfg.enable_pano {
            // Perf-only topology: single-packet events, aggregated in
            // userspace; the map scraper and ring buffer stay idle.
            let perf = {
                let mut fetcher = self.fetcher.lock().expect("flow fetcher mutex poisoned");
                fetcher.take_perf().context("taking perf array")?
            };
            let (payload_tx, payload_rx) = mpsc::channel(buffers);
            producers.push(tokio::spawn(PerfTracer::new(perf).run(
                cancel.clone(),
                raw_tx.clone(),
                payload_tx,
            )));
            consumers.push(tokio::spawn(pipeline::drain_packets(payload_rx)));
        } else {
            let (flow_map, ringbuf) = {
                let mut fetcher = self.fetcher.lock().expect("flow fetcher mutex poisoned");
                (
                    fetcher.take_flow_map().context("taking aggregated map")?,
                    fetcher.take_ringbuf().context("taking ring buffer")?,
                )
            };
            producers.push(tokio::spawn(
                MapScraper::new(flow_map, self.cfg.cache_active_timeout)
                    .run(cancel.clone(), records_tx.clone()),
            ));
            producers.push(tokio::spawn(
                RingBufTracer::new(ringbuf).run(cancel.clone(), raw_tx.clone()),
            ));
        }
        drop(raw_tx);

        let accounter = Accounter::new(
            self.cfg.cache_max_flows as usize,
            self.cfg.cache_active_timeout,
            model::wall_now,
            model::mono_now_ns,
        );
        consumers.push(tokio::spawn(accounter.run(raw_rx, records_tx.clone())));
        drop(records_tx);

        let deduped_rx = if self.cfg.deduper == DeduperMode::FirstCome {
            let deduper = Deduper::new(self.cfg.deduper_fc_expiry, self.cfg.deduper_just_mark);
            let (tx, rx) = mpsc::channel(buffers);
            consumers.push(tokio::spawn(deduper.run(records_rx, tx)));
            rx
        } else {
            records_rx
        };

        let (decorate_tx, decorate_rx) = mpsc::channel(buffers);
        consumers.push(tokio::spawn(pipeline::limit(
            deduped_rx,
            decorate_tx,
            self.dropped_batches.clone(),
        )));

        let (export_tx, export_rx) = mpsc::channel(self.cfg.exporter_buffers());
        consumers.push(tokio::spawn(pipeline::decorate(
            decorate_rx,
            export_tx,
            self.agent_ip,
            self.names.clone(),
        )));
        consumers.push(tokio::spawn(export::export_loop(
            export_rx,
            sink,
            self.cfg.message_max_flows,
        )));

        self.status = Status::Started;
        info!("flows agent successfully started");
        cancel.cancelled().await;

        self.status = Status::Stopping;
        info!("stopping flows agent");
        for handle in producers {
            let _ = handle.await;
        }
        let closed = self
            .fetcher
            .lock()
            .expect("flow fetcher mutex poisoned")
            .close();
        if let Err(err) = closed {
            warn!("eBPF resources not correctly closed: {err:#}");
        }

        debug!("waiting for the pipeline to drain");
        for handle in consumers {
            let _ = handle.await;
        }

        let dropped = self.dropped_batches.load(Ordering::Relaxed);
        if dropped > 0 {
            info!("{dropped} batches were dropped by the capacity limiter");
        }
        self.status = Status::Stopped;
        info!("flows agent stopped");
        Ok(())
    }
}

/// Resolves the IP this agent reports about itself: the configured override,
/// or the local address of a probe socket routed toward the export target.
fn resolve_agent_ip(cfg: &Config) -> Result<IpAddr, StartupError> {
    if let Some(ip) = cfg.agent_ip {
        return Ok(ip);
    }
    let target = match cfg.export {
        crate::config::ExportProto::Kafka => cfg.kafka_brokers[0].clone(),
        _ => format!("{}:{}", cfg.target_host, cfg.target_port),
    };
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")
        .map_err(|err| StartupError::AgentIp(err.to_string()))?;
    // No packet goes out: connect() only asks the kernel for a route.
    if socket.connect(&target).is_err() {
        socket
            .connect("8.8.8.8:80")
            .map_err(|err| StartupError::AgentIp(format!("no route to {target}: {err}")))?;
    }
    let local = socket
        .local_addr()
        .map_err(|err| StartupError::AgentIp(err.to_string()))?;
    Ok(local.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn status_names_are_stable() {
        assert_eq!(Status::NotStarted.to_string(), "NotStarted");
        assert_eq!(Status::Stopped.to_string(), "Stopped");
    }

    #[test]
    fn configured_agent_ip_wins_over_detection() {
        let cfg = Config {
            agent_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7))),
            ..Config::default()
        };
        let ip = resolve_agent_ip(&cfg).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)));
    }
}
