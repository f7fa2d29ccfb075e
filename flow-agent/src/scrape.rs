//! Producer A: periodically drains the in-kernel aggregation map.

use std::{collections::HashMap, time::Duration};

use aya::maps::{MapData, PerCpuHashMap};
use log::{debug, warn};
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;

use crate::model::{self, Clock, FlowKey, FlowMetrics, MonoClock, Record, merge_metrics};

pub struct MapScraper {
    map: PerCpuHashMap<MapData, FlowKey, FlowMetrics>,
    period: Duration,
    clock: Clock,
    mono: MonoClock,
}

impl MapScraper {
    pub fn new(map: PerCpuHashMap<MapData, FlowKey, FlowMetrics>, period: Duration) -> MapScraper {
        MapScraper {
            map,
            period,
            clock: model::wall_now,
            mono: model::mono_now_ns,
        }
    }

    /// Ticks at the cache active timeout; every tick drains the whole map and
    /// emits one batch. Cancellation triggers a final drain so in-kernel
    /// state is not lost on shutdown.
    pub async fn run(mut self, cancel: CancellationToken, out: mpsc::Sender<Vec<Record>>) {
        let mut ticker = time::interval(self.period);
        // The first tick fires immediately and would scrape an empty map.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let batch = self.drain();
                    if !batch.is_empty() {
                        let _ = out.send(batch).await;
                    }
                    debug!("map scraper exiting");
                    return;
                }
                _ = ticker.tick() => {
                    let batch = self.drain();
                    debug!("map scraper evicting {} flows", batch.len());
                    if !batch.is_empty() && out.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Reads every key with its per-CPU metric list, then deletes the keys.
    /// The kernel keeps writing during the walk: a key updated after its read
    /// simply shows up again next tick, and a key observed twice in one walk
    /// is merged through the per-key list.
    fn drain(&mut self) -> Vec<Record> {
        let mut flows: HashMap<FlowKey, Vec<FlowMetrics>> = HashMap::new();
        for item in self.map.iter() {
            match item {
                Ok((key, per_cpu)) => {
                    flows.entry(key).or_default().extend(per_cpu.iter().copied());
                }
                Err(err) => {
                    warn!("iterating aggregated flows: {err}");
                    break;
                }
            }
        }
        for key in flows.keys() {
            if let Err(err) = self.map.remove(key) {
                warn!("couldn't delete flow entry: {err}");
            }
        }

        let now = (self.clock)();
        let now_mono = (self.mono)();
        flows
            .into_iter()
            .map(|(key, variants)| Record::new(key, merge_metrics(variants.iter()), now, now_mono))
            .collect()
    }
}
