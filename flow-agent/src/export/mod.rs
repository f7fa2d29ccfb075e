//! Exporter adapter: batches records, splits oversized batches and forwards
//! them to the configured sink. Delivery errors are logged and the batch
//! dropped; the pipeline is lossy by contract.

pub mod ipfix;
pub mod kafka;
pub mod wire;

use std::net::IpAddr;

use anyhow::{Context, Result};
use log::{debug, warn};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc};

use crate::{
    config::{Config, ExportProto},
    error::StartupError,
    model::Record,
};

#[allow(async_fn_in_trait)]
pub trait RecordSink {
    async fn accept(&mut self, batch: &[Record]) -> Result<()>;
    async fn close(&mut self);
}

/// One variant per wire format; constructed once at startup.
pub enum Sink {
    Grpc(GrpcSink),
    Kafka(kafka::KafkaSink),
    Ipfix(ipfix::IpfixSink),
}

impl RecordSink for Sink {
    async fn accept(&mut self, batch: &[Record]) -> Result<()> {
        match self {
            Sink::Grpc(sink) => sink.send(batch).await,
            Sink::Kafka(sink) => sink.send(&wire::encode_records(batch)).await,
            Sink::Ipfix(sink) => sink.send(batch).await,
        }
    }

    async fn close(&mut self) {
        match self {
            Sink::Grpc(sink) => sink.close().await,
            Sink::Kafka(sink) => sink.close().await,
            Sink::Ipfix(sink) => sink.close().await,
        }
    }
}

/// Streams varint-length-delimited protobuf `Records` messages over a
/// persistent TCP connection to the collector's flow socket.
pub struct GrpcSink {
    stream: TcpStream,
}

impl GrpcSink {
    pub async fn connect(target: &str) -> Result<GrpcSink> {
        let stream = TcpStream::connect(target)
            .await
            .with_context(|| format!("connecting to flow collector {target}"))?;
        Ok(GrpcSink { stream })
    }

    async fn send(&mut self, batch: &[Record]) -> Result<()> {
        let body = wire::encode_records(batch);
        let mut frame = Vec::with_capacity(body.len() + 5);
        wire::put_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        self.stream
            .write_all(&frame)
            .await
            .context("writing flow records")
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.shutdown().await {
            debug!("closing collector stream: {err}");
        }
    }
}

/// Opens the outbound connection for the configured export format. Failures
/// here are startup-fatal.
pub async fn build_sink(cfg: &Config, agent_ip: IpAddr) -> Result<Sink, StartupError> {
    let target = format!("{}:{}", cfg.target_host, cfg.target_port);
    match cfg.export {
        ExportProto::Grpc => Ok(Sink::Grpc(
            GrpcSink::connect(&target)
                .await
                .map_err(StartupError::Export)?,
        )),
        ExportProto::Kafka => {
            let compression = cfg
                .kafka_compression
                .parse()
                .map_err(StartupError::Config)?;
            Ok(Sink::Kafka(
                kafka::KafkaSink::connect(&cfg.kafka_brokers, &cfg.kafka_topic, compression)
                    .await
                    .map_err(StartupError::Export)?,
            ))
        }
        ExportProto::IpfixUdp => Ok(Sink::Ipfix(
            ipfix::IpfixSink::connect_udp(&target, agent_ip)
                .await
                .map_err(StartupError::Export)?,
        )),
        ExportProto::IpfixTcp => Ok(Sink::Ipfix(
            ipfix::IpfixSink::connect_tcp(&target, agent_ip)
                .await
                .map_err(StartupError::Export)?,
        )),
    }
}

/// Splits a batch into consecutive sub-batches of at most `max_len` records.
pub fn split_batch(mut batch: Vec<Record>, max_len: usize) -> Vec<Vec<Record>> {
    if batch.len() <= max_len {
        return if batch.is_empty() { Vec::new() } else { vec![batch] };
    }
    let mut out = Vec::with_capacity(batch.len().div_ceil(max_len));
    while batch.len() > max_len {
        let rest = batch.split_off(max_len);
        out.push(batch);
        batch = rest;
    }
    out.push(batch);
    out
}

/// Terminal pipeline stage. Consumes batches until the channel closes, then
/// closes the sink.
pub async fn export_loop<S: RecordSink>(
    mut input: mpsc::Receiver<Vec<Record>>,
    mut sink: S,
    max_len: usize,
) {
    while let Some(batch) = input.recv().await {
        for sub in split_batch(batch, max_len) {
            if let Err(err) = sink.accept(&sub).await {
                warn!("can't export flow batch: {err:#}");
            }
        }
    }
    sink.close().await;
    debug!("exporter exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowKey, Record};
    use std::net::Ipv4Addr;
    use std::time::SystemTime;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn record(src_port: u16) -> Record {
        Record {
            key: FlowKey {
                src_port,
                ..FlowKey::default()
            },
            metrics: Default::default(),
            start: SystemTime::UNIX_EPOCH,
            end: SystemTime::UNIX_EPOCH,
            interface: String::new(),
            agent_ip: IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7)),
            duplicate: false,
        }
    }

    fn batch(n: usize) -> Vec<Record> {
        (0..n).map(|i| record(i as u16)).collect()
    }

    #[test]
    fn splits_into_capped_consecutive_subbatches() {
        let out = split_batch(batch(25_000), 10_000);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].len(), 10_000);
        assert_eq!(out[1].len(), 10_000);
        assert_eq!(out[2].len(), 5_000);
        // Order is preserved across the split boundary.
        assert_eq!(out[1][0].key.src_port, 10_000);
        assert_eq!(out[2][0].key.src_port, 20_000);
    }

    #[test]
    fn exact_multiples_produce_no_tail() {
        let out = split_batch(batch(20), 10);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|b| b.len() == 10));
    }

    #[test]
    fn small_and_empty_batches_pass_through() {
        assert_eq!(split_batch(batch(3), 10).len(), 1);
        assert!(split_batch(batch(0), 10).is_empty());
    }

    struct MemSink {
        batches: Vec<Vec<Record>>,
        closed: bool,
    }

    impl RecordSink for &mut MemSink {
        async fn accept(&mut self, batch: &[Record]) -> Result<()> {
            self.batches.push(batch.to_vec());
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn export_loop_splits_and_closes() {
        let mut sink = MemSink {
            batches: Vec::new(),
            closed: false,
        };
        let (tx, rx) = mpsc::channel(4);
        tx.send(batch(25)).await.unwrap();
        drop(tx);
        export_loop(rx, &mut sink, 10).await;

        assert!(sink.closed);
        assert_eq!(
            sink.batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
    }

    #[tokio::test]
    async fn grpc_sink_frames_are_varint_delimited() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            data
        });

        let mut sink = GrpcSink::connect(&addr.to_string()).await.unwrap();
        sink.send(&batch(2)).await.unwrap();
        sink.close().await;
        let data = server.await.unwrap();

        // Decode the varint length prefix by hand.
        let mut len: u64 = 0;
        let mut shift = 0;
        let mut pos = 0;
        loop {
            let byte = data[pos];
            pos += 1;
            len |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        assert_eq!(len as usize, data.len() - pos);
        let decoded = wire::decode_records(&data[pos..]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].src_port, 1);
    }
}
