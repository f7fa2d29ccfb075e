//! First-come deduper: flows observed on several interfaces are reported
//! only for the interface that saw them first, until the flow goes quiet for
//! the expiry period. Single consumer, not shared.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use log::debug;
use tokio::sync::mpsc;

use crate::model::{self, FlowKey, MonoClock, Record};

struct DedupEntry {
    if_index: u32,
    expiry_ns: u64,
    seq: u64,
}

pub struct Deduper {
    expire: Duration,
    just_mark: bool,
    entries: HashMap<FlowKey, DedupEntry>,
    /// Expiry order. Refreshing an entry appends a new slot and bumps the
    /// seq, so stale slots are skipped during expiry walks.
    order: VecDeque<(u64, FlowKey)>,
    next_seq: u64,
    mono: MonoClock,
}

/// Zeroes the fields that must not participate in the duplicate comparison:
/// interface index, MACs and direction.
fn masked(key: &FlowKey) -> FlowKey {
    let mut rk = *key;
    rk.if_index = 0;
    rk.src_mac = [0; model::MAC_LEN];
    rk.dst_mac = [0; model::MAC_LEN];
    rk.direction = 0;
    rk
}

impl Deduper {
    pub fn new(expire: Duration, just_mark: bool) -> Deduper {
        Deduper::with_clock(expire, just_mark, model::mono_now_ns)
    }

    fn with_clock(expire: Duration, just_mark: bool, mono: MonoClock) -> Deduper {
        Deduper {
            expire,
            just_mark,
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            mono,
        }
    }

    pub async fn run(mut self, mut input: mpsc::Receiver<Vec<Record>>, out: mpsc::Sender<Vec<Record>>) {
        while let Some(batch) = input.recv().await {
            let fwd = self.process(batch);
            if !fwd.is_empty() && out.send(fwd).await.is_err() {
                return;
            }
        }
        debug!("deduper exiting");
    }

    fn process(&mut self, batch: Vec<Record>) -> Vec<Record> {
        self.remove_expired();
        let mut fwd = Vec::with_capacity(batch.len());
        for mut record in batch {
            if self.is_dupe(&record.key) {
                if !self.just_mark {
                    continue;
                }
                record.duplicate = true;
            }
            fwd.push(record);
        }
        fwd
    }

    /// Looks up the masked key. A hit refreshes the expiry and is a
    /// duplicate when the stored interface differs from the record's; a miss
    /// registers the record's interface as the flow's first.
    fn is_dupe(&mut self, key: &FlowKey) -> bool {
        let rk = masked(key);
        let expiry_ns = (self.mono)() + self.expire.as_nanos() as u64;
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(&rk) {
            entry.expiry_ns = expiry_ns;
            entry.seq = seq;
            self.order.push_back((seq, rk));
            return entry.if_index != key.if_index;
        }
        self.entries.insert(
            rk,
            DedupEntry {
                if_index: key.if_index,
                expiry_ns,
                seq,
            },
        );
        self.order.push_back((seq, rk));
        false
    }

    fn remove_expired(&mut self) {
        let now = (self.mono)();
        let mut evicted = 0;
        while let Some((seq, key)) = self.order.front().copied() {
            match self.entries.get(&key) {
                Some(entry) if entry.seq != seq => {
                    // Stale slot for a refreshed entry.
                    self.order.pop_front();
                }
                Some(entry) if entry.expiry_ns <= now => {
                    self.entries.remove(&key);
                    self.order.pop_front();
                    evicted += 1;
                }
                Some(_) => break,
                None => {
                    self.order.pop_front();
                }
            }
        }
        if evicted > 0 {
            debug!(
                "{evicted} entries evicted from the deduper cache, {} remain",
                self.entries.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static FAKE_MONO_NS: AtomicU64 = AtomicU64::new(0);
    // Tests share the fake clock, so they take turns.
    static CLOCK_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn fake_mono() -> u64 {
        FAKE_MONO_NS.load(Ordering::Relaxed)
    }

    fn set_mono(ns: u64) {
        FAKE_MONO_NS.store(ns, Ordering::Relaxed);
    }

    fn lock_clock() -> std::sync::MutexGuard<'static, ()> {
        CLOCK_GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deduper(expire_secs: u64, just_mark: bool) -> Deduper {
        Deduper::with_clock(Duration::from_secs(expire_secs), just_mark, fake_mono)
    }

    fn record(if_index: u32, direction: u8) -> Record {
        let mut key = FlowKey {
            if_index,
            direction,
            src_port: 443,
            dst_port: 53210,
            ..FlowKey::default()
        };
        key.src_mac = [if_index as u8; model::MAC_LEN];
        Record {
            key,
            metrics: Default::default(),
            start: UNIX_EPOCH,
            end: SystemTime::now(),
            interface: String::new(),
            agent_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            duplicate: false,
        }
    }

    #[test]
    fn first_interface_wins_and_others_are_dropped() {
        let _clock = lock_clock();
        set_mono(1_000);
        let mut dedup = deduper(120, false);
        let fwd = dedup.process(vec![record(1, 0), record(2, 0), record(1, 1)]);
        assert_eq!(fwd.len(), 2);
        assert!(fwd.iter().all(|r| r.key.if_index == 1));
        assert!(fwd.iter().all(|r| !r.duplicate));
    }

    #[test]
    fn just_mark_forwards_duplicates_flagged() {
        let _clock = lock_clock();
        set_mono(1_000);
        let mut dedup = deduper(120, true);
        let fwd = dedup.process(vec![record(1, 0), record(2, 0), record(1, 0)]);
        assert_eq!(fwd.len(), 3);
        assert!(!fwd[0].duplicate);
        assert!(fwd[1].duplicate);
        assert!(!fwd[2].duplicate);
    }

    #[test]
    fn expired_entries_forget_the_first_interface() {
        let _clock = lock_clock();
        set_mono(0);
        let mut dedup = deduper(10, false);
        assert_eq!(dedup.process(vec![record(1, 0)]).len(), 1);

        // Past the expiry window, interface 2 becomes the new first-comer.
        set_mono(11_000_000_000);
        let fwd = dedup.process(vec![record(2, 0)]);
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd[0].key.if_index, 2);
        assert!(!fwd[0].duplicate);
    }

    #[test]
    fn activity_refreshes_the_expiry() {
        let _clock = lock_clock();
        set_mono(0);
        let mut dedup = deduper(10, false);
        dedup.process(vec![record(1, 0)]);

        // 6s later the flow is seen again on interface 1: still first.
        set_mono(6_000_000_000);
        dedup.process(vec![record(1, 0)]);

        // 6 more seconds: the original expiry has passed, but the refresh
        // keeps interface 2 a duplicate.
        set_mono(12_000_000_000);
        assert!(dedup.process(vec![record(2, 0)]).is_empty());
    }

    #[test]
    fn masked_key_ignores_iface_macs_and_direction() {
        let a = record(1, 0).key;
        let b = record(2, 1).key;
        assert_ne!(a, b);
        assert_eq!(masked(&a), masked(&b));
    }

    #[tokio::test]
    async fn run_filters_between_channels() {
        let _clock = lock_clock();
        set_mono(1_000);
        let dedup = deduper(120, false);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let handle = tokio::spawn(dedup.run(in_rx, out_tx));

        in_tx
            .send(vec![record(1, 0), record(2, 0)])
            .await
            .unwrap();
        drop(in_tx);
        handle.await.unwrap();

        let fwd = out_rx.recv().await.unwrap();
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd[0].key.if_index, 1);
    }
}
