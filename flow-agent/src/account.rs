//! Userspace flow accounter: aggregates single-packet events into flow
//! records, bounded by `cache_max_flows` and evicted on activity timeouts.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use log::debug;
use tokio::{sync::mpsc, time};

use crate::model::{Clock, FlowKey, FlowMetrics, MonoClock, RawRecord, Record};

struct CacheEntry {
    metrics: FlowMetrics,
    seq: u64,
}

pub struct Accounter {
    max_flows: usize,
    timeout: Duration,
    entries: HashMap<FlowKey, CacheEntry>,
    /// First-seen order; stale (seq-mismatched) slots are skipped lazily.
    order: VecDeque<(u64, FlowKey)>,
    next_seq: u64,
    clock: Clock,
    mono: MonoClock,
}

impl Accounter {
    pub fn new(max_flows: usize, timeout: Duration, clock: Clock, mono: MonoClock) -> Accounter {
        Accounter {
            max_flows,
            timeout,
            entries: HashMap::with_capacity(max_flows),
            order: VecDeque::with_capacity(max_flows),
            next_seq: 0,
            clock,
            mono,
        }
    }

    /// Consumes raw events until the input closes, emitting eviction batches
    /// downstream. A full output channel blocks the accounter and, through
    /// it, the producers.
    pub async fn run(mut self, mut input: mpsc::Receiver<RawRecord>, out: mpsc::Sender<Vec<Record>>) {
        let mut ticker = time::interval(self.timeout);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let batch = self.evict_idle();
                    if !batch.is_empty() {
                        debug!("accounter evicting {} idle flows", batch.len());
                        if out.send(batch).await.is_err() {
                            return;
                        }
                    }
                }
                event = input.recv() => match event {
                    Some(raw) => {
                        let batch = self.account(raw);
                        if !batch.is_empty() && out.send(batch).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let batch = self.flush();
                        if !batch.is_empty() {
                            let _ = out.send(batch).await;
                        }
                        debug!("accounter exiting");
                        return;
                    }
                }
            }
        }
    }

    /// Folds one event into the cache. Returns the records this event forced
    /// out: an over-age flow it updated, or the eldest flow displaced by a
    /// new key arriving at capacity.
    fn account(&mut self, raw: RawRecord) -> Vec<Record> {
        let mut evicted = Vec::new();
        if let Some(entry) = self.entries.get_mut(&raw.key) {
            let m = &mut entry.metrics;
            m.bytes = m.bytes.wrapping_add(raw.metrics.bytes);
            m.packets = m.packets.wrapping_add(raw.metrics.packets);
            m.flags |= raw.metrics.flags;
            if raw.metrics.end_mono_ns > m.end_mono_ns {
                m.end_mono_ns = raw.metrics.end_mono_ns;
            }
            // A continuously-updated flow still leaves once it has been
            // active for the full timeout.
            if (self.mono)().saturating_sub(m.start_mono_ns) >= self.timeout.as_nanos() as u64 {
                evicted.push(raw.key);
            }
        } else {
            if self.entries.len() >= self.max_flows {
                if let Some(eldest) = self.pop_eldest() {
                    evicted.push(eldest);
                }
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(
                raw.key,
                CacheEntry {
                    metrics: raw.metrics,
                    seq,
                },
            );
            self.order.push_back((seq, raw.key));
        }
        self.emit(evicted)
    }

    /// Timer eviction: all flows idle for longer than the timeout.
    fn evict_idle(&mut self) -> Vec<Record> {
        let now_mono = (self.mono)();
        let timeout_ns = self.timeout.as_nanos() as u64;
        let idle: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                now_mono.saturating_sub(entry.metrics.end_mono_ns) >= timeout_ns
            })
            .map(|(key, _)| *key)
            .collect();
        self.emit(idle)
    }

    fn flush(&mut self) -> Vec<Record> {
        let all: Vec<FlowKey> = self.entries.keys().copied().collect();
        self.emit(all)
    }

    fn pop_eldest(&mut self) -> Option<FlowKey> {
        while let Some((seq, key)) = self.order.pop_front() {
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                return Some(key);
            }
        }
        None
    }

    fn emit(&mut self, keys: Vec<FlowKey>) -> Vec<Record> {
        if keys.is_empty() {
            return Vec::new();
        }
        let now = (self.clock)();
        let now_mono = (self.mono)();
        keys.into_iter()
            .filter_map(|key| {
                self.entries
                    .remove(&key)
                    .map(|entry| Record::new(key, entry.metrics, now, now_mono))
            })
            .collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static FAKE_MONO_NS: AtomicU64 = AtomicU64::new(0);
    // Tests share the fake clock, so they take turns.
    static CLOCK_GUARD: Mutex<()> = Mutex::new(());

    fn fake_mono() -> u64 {
        FAKE_MONO_NS.load(Ordering::Relaxed)
    }

    fn fake_clock() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_000_000)
    }

    fn set_mono(ns: u64) {
        FAKE_MONO_NS.store(ns, Ordering::Relaxed);
    }

    fn lock_clock() -> std::sync::MutexGuard<'static, ()> {
        CLOCK_GUARD.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accounter(max: usize, timeout_secs: u64) -> Accounter {
        Accounter::new(
            max,
            Duration::from_secs(timeout_secs),
            fake_clock,
            fake_mono,
        )
    }

    fn event(port: u16, bytes: u64, flags: u32, ts_ns: u64) -> RawRecord {
        let mut raw = RawRecord::default();
        raw.key.src_port = port;
        raw.metrics.bytes = bytes;
        raw.metrics.packets = 1;
        raw.metrics.flags = flags;
        raw.metrics.start_mono_ns = ts_ns;
        raw.metrics.end_mono_ns = ts_ns;
        raw
    }

    #[test]
    fn updates_accumulate_counters() {
        let _clock = lock_clock();
        set_mono(1_000_000_000);
        let mut acc = accounter(10, 60);
        assert!(acc.account(event(80, 100, 0x02, 1_000_000_000)).is_empty());
        assert!(acc.account(event(80, 50, 0x10, 2_000_000_000)).is_empty());
        assert_eq!(acc.len(), 1);

        let batch = acc.flush();
        assert_eq!(batch.len(), 1);
        let rec = &batch[0];
        assert_eq!(rec.metrics.bytes, 150);
        assert_eq!(rec.metrics.packets, 2);
        assert_eq!(rec.metrics.flags, 0x12);
        assert_eq!(rec.metrics.start_mono_ns, 1_000_000_000);
        assert_eq!(rec.metrics.end_mono_ns, 2_000_000_000);
        assert!(rec.end >= rec.start);
        assert!(rec.metrics.packets >= 1);
        assert!(rec.metrics.bytes >= rec.metrics.packets);
    }

    #[test]
    fn capacity_evicts_the_eldest_entry() {
        let _clock = lock_clock();
        set_mono(1_000);
        let mut acc = accounter(2, 60);
        assert!(acc.account(event(1, 10, 0, 1_000)).is_empty());
        assert!(acc.account(event(2, 20, 0, 1_000)).is_empty());

        let batch = acc.account(event(3, 30, 0, 1_000));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key.src_port, 1);
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn cache_never_exceeds_max_flows() {
        let _clock = lock_clock();
        set_mono(0);
        let mut acc = accounter(4, 60);
        for port in 0..100u16 {
            acc.account(event(port, 1, 0, 1));
            assert!(acc.len() <= 4);
        }
    }

    #[test]
    fn long_active_flow_is_evicted_on_update() {
        let _clock = lock_clock();
        set_mono(1_000_000_000);
        let mut acc = accounter(10, 5);
        assert!(acc.account(event(80, 10, 0, 1_000_000_000)).is_empty());

        // 6 seconds after first-seen, the next update pushes it out.
        set_mono(7_000_000_000);
        let batch = acc.account(event(80, 10, 0, 7_000_000_000));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].metrics.bytes, 20);
        assert_eq!(acc.len(), 0);
    }

    #[test]
    fn timer_evicts_only_idle_flows() {
        let _clock = lock_clock();
        set_mono(10_000_000_000);
        let mut acc = accounter(10, 5);
        acc.account(event(1, 10, 0, 1_000_000_000));
        acc.account(event(2, 10, 0, 9_000_000_000));

        let batch = acc.evict_idle();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key.src_port, 1);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn reinserted_key_is_not_displaced_by_its_stale_slot() {
        let _clock = lock_clock();
        set_mono(1_000);
        let mut acc = accounter(2, 60);
        acc.account(event(1, 10, 0, 1_000));
        acc.account(event(2, 20, 0, 1_000));
        // Evicts port 1, then reinsert it: the stale order slot for the first
        // insertion must not satisfy the next capacity eviction.
        acc.account(event(3, 30, 0, 1_000));
        acc.flush();
        acc.account(event(1, 40, 0, 2_000));
        acc.account(event(4, 50, 0, 2_000));

        let batch = acc.account(event(5, 60, 0, 2_000));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key.src_port, 1);
        assert_eq!(batch[0].metrics.bytes, 40);
    }

    #[tokio::test]
    async fn run_flushes_on_input_close() {
        let _clock = lock_clock();
        set_mono(1_000);
        let acc = accounter(10, 60);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let handle = tokio::spawn(acc.run(in_rx, out_tx));

        in_tx.send(event(80, 100, 0, 1_000)).await.unwrap();
        drop(in_tx);
        handle.await.unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].metrics.bytes, 100);
        assert!(out_rx.recv().await.is_none());
    }
}
