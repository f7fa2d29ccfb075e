//! Producers B and C: event streams from the kernel.
//!
//! The ring buffer carries flows the kernel could not keep in the
//! aggregation map; the perf array carries one event per sampled packet plus
//! its payload snippet, and only feeds the pipeline when the pano topology is
//! selected.

use bytes::BytesMut;
use log::{debug, warn};
use tokio::{io::unix::AsyncFd, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use aya::maps::{MapData, RingBuf, perf::AsyncPerfEventArray};
use aya::util::online_cpus;

use crate::model::{RawRecord, parse_raw_record};

const PERF_READ_BUFFERS: usize = 10;
const PERF_BUFFER_CAPACITY: usize = 10240;

pub struct RingBufTracer {
    ring: RingBuf<MapData>,
}

impl RingBufTracer {
    pub fn new(ring: RingBuf<MapData>) -> RingBufTracer {
        RingBufTracer { ring }
    }

    /// Forwards forced-evicted flow records to the accounter input. Exits on
    /// cancellation; a malformed event is logged and skipped.
    pub async fn run(self, cancel: CancellationToken, out: mpsc::Sender<RawRecord>) {
        let mut fd = match AsyncFd::new(self.ring) {
            Ok(fd) => fd,
            Err(err) => {
                warn!("can't poll ring buffer: {err}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ring buffer tracer exiting");
                    return;
                }
                guard = fd.readable_mut() => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(err) => {
                            warn!("ring buffer poll error: {err}");
                            return;
                        }
                    };
                    let ring = guard.get_inner_mut();
                    while let Some(item) = ring.next() {
                        match parse_raw_record(&item) {
                            Ok(raw) => {
                                if raw.metrics.errno != 0 {
                                    debug!(
                                        "flow evicted through ring buffer, map insertion errno {}",
                                        raw.metrics.errno
                                    );
                                }
                                drop(item);
                                if out.send(raw).await.is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!("ignoring ring buffer event: {err}");
                            }
                        }
                    }
                    guard.clear_ready();
                }
            }
        }
    }
}

pub struct PerfTracer {
    perf: AsyncPerfEventArray<MapData>,
}

impl PerfTracer {
    pub fn new(perf: AsyncPerfEventArray<MapData>) -> PerfTracer {
        PerfTracer { perf }
    }

    /// Spawns one reader per online CPU. Each event parses into a
    /// single-packet record for the accounter; the raw bytes are also teed to
    /// the payload drain.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        out: mpsc::Sender<RawRecord>,
        payloads: mpsc::Sender<Vec<u8>>,
    ) {
        let cpus = match online_cpus() {
            Ok(cpus) => cpus,
            Err((_, err)) => {
                warn!("can't list online CPUs: {err}");
                return;
            }
        };

        let mut readers = JoinSet::new();
        for cpu_id in cpus {
            let buf = match self.perf.open(cpu_id, None) {
                Ok(buf) => buf,
                Err(err) => {
                    warn!("can't open perf buffer for CPU {cpu_id}: {err}");
                    continue;
                }
            };
            let cancel = cancel.clone();
            let out = out.clone();
            let payloads = payloads.clone();
            readers.spawn(per_cpu_loop(buf, cpu_id, cancel, out, payloads));
        }
        drop(out);
        drop(payloads);
        while readers.join_next().await.is_some() {}
        debug!("perf tracer exiting");
    }
}

async fn per_cpu_loop(
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    cpu_id: u32,
    cancel: CancellationToken,
    out: mpsc::Sender<RawRecord>,
    payloads: mpsc::Sender<Vec<u8>>,
) {
    let mut buffers = (0..PERF_READ_BUFFERS)
        .map(|_| BytesMut::with_capacity(PERF_BUFFER_CAPACITY))
        .collect::<Vec<_>>();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            events = buf.read_events(&mut buffers) => {
                let events = match events {
                    Ok(events) => events,
                    Err(err) => {
                        warn!("reading perf events on CPU {cpu_id}: {err}");
                        return;
                    }
                };
                if events.lost > 0 {
                    warn!("perf buffer on CPU {cpu_id} lost {} events", events.lost);
                }
                for event in buffers.iter().take(events.read) {
                    match parse_raw_record(event) {
                        Ok(raw) => {
                            if out.send(raw).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!("ignoring perf event: {err}");
                            continue;
                        }
                    }
                    if payloads.send(event.to_vec()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
