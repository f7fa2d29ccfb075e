//! Small pass-through stages: the capacity limiter, the decorator and the
//! packet-payload drain.

use std::net::IpAddr;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::{debug, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{ifaces::NameCache, model::Record};

/// Log the running drop total every this many dropped batches.
const DROP_LOG_INTERVAL: u64 = 100;

/// Forwards batches without ever blocking: when the downstream buffer is
/// full the whole batch is dropped and counted, trading loss for bounded
/// latency.
pub async fn limit(
    mut input: mpsc::Receiver<Vec<Record>>,
    out: mpsc::Sender<Vec<Record>>,
    dropped: Arc<AtomicU64>,
) {
    while let Some(batch) = input.recv().await {
        match out.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("exporter queue full, dropped batch of {} flows", batch.len());
                if total % DROP_LOG_INTERVAL == 0 {
                    warn!("exporter queue saturated: {total} batches dropped so far");
                }
            }
            Err(TrySendError::Closed(_)) => return,
        }
    }
    debug!("capacity limiter exiting");
}

/// Stamps the agent IP and resolves the interface name of every record.
pub async fn decorate(
    mut input: mpsc::Receiver<Vec<Record>>,
    out: mpsc::Sender<Vec<Record>>,
    agent_ip: IpAddr,
    names: NameCache,
) {
    while let Some(mut batch) = input.recv().await {
        for record in &mut batch {
            record.agent_ip = agent_ip;
            record.interface = names.name_for_index(record.key.if_index);
        }
        if out.send(batch).await.is_err() {
            return;
        }
    }
    debug!("decorator exiting");
}

/// Terminal stage of the perf tracer's payload tap. The pcap formatter is an
/// external collaborator; this drain only accounts for the bytes flowing by.
pub async fn drain_packets(mut input: mpsc::Receiver<Vec<u8>>) {
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    while let Some(payload) = input.recv().await {
        packets += 1;
        bytes += payload.len() as u64;
        trace!("packet payload of {} bytes buffered", payload.len());
    }
    debug!("packet drain exiting after {packets} packets, {bytes} bytes");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifaces::{NameCache, UNKNOWN_INTERFACE};
    use crate::model::{FlowKey, Record};
    use std::net::Ipv4Addr;
    use std::time::SystemTime;

    fn record(if_index: u32) -> Record {
        Record {
            key: FlowKey {
                if_index,
                ..FlowKey::default()
            },
            metrics: Default::default(),
            start: SystemTime::UNIX_EPOCH,
            end: SystemTime::UNIX_EPOCH,
            interface: String::new(),
            agent_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            duplicate: false,
        }
    }

    #[tokio::test]
    async fn limiter_drops_batches_when_downstream_is_full() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = dropped.clone();
        let handle = tokio::spawn(limit(in_rx, out_tx, counter));

        // Nobody reads out_rx yet: the first batch fills the buffer, the
        // next two are dropped.
        in_tx.send(vec![record(1)]).await.unwrap();
        in_tx.send(vec![record(2)]).await.unwrap();
        in_tx.send(vec![record(3)]).await.unwrap();
        drop(in_tx);
        handle.await.unwrap();

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        let delivered = out_rx.recv().await.unwrap();
        assert_eq!(delivered[0].key.if_index, 1);
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn decorator_stamps_ip_and_interface_name() {
        let names = NameCache::default();
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let agent_ip = IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7));
        let handle = tokio::spawn(decorate(in_rx, out_tx, agent_ip, names));

        in_tx.send(vec![record(42)]).await.unwrap();
        drop(in_tx);
        handle.await.unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch[0].agent_ip, agent_ip);
        assert_eq!(batch[0].interface, UNKNOWN_INTERFACE);
    }
}
