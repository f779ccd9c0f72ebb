//! Background sampling of pool and cache statistics.
//!
//! Gauges are exported as sampled. Cumulative counters are exported as the
//! growth since the previous sample, so the Prometheus counters stay
//! monotone across pool restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rampart_cache::LocalStats;
use rampart_core::PoolSnapshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::PoolProbe;

pub type StatsSource = Arc<dyn Fn() -> LocalStats + Send + Sync>;

/// Last-seen cumulative values per pool. Owned by the collector task.
#[derive(Debug, Default)]
pub struct CounterMemory {
    last: HashMap<String, PoolSnapshot>,
}

/// Growth of the cumulative counters between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDelta {
    pub waits: u64,
    pub wait_time: Duration,
    pub stale_closed: u64,
}

impl CounterMemory {
    /// Remember `current` and return the growth since the last sample.
    ///
    /// A counter lower than its remembered value means the pool was
    /// recreated; the new value is then the delta.
    pub fn delta(&mut self, pool: &str, current: &PoolSnapshot) -> CounterDelta {
        let delta = match self.last.get(pool) {
            Some(prev) => CounterDelta {
                waits: grow(prev.wait_count, current.wait_count),
                wait_time: if current.wait_duration >= prev.wait_duration {
                    current.wait_duration - prev.wait_duration
                } else {
                    current.wait_duration
                },
                stale_closed: grow(prev.stale_closed, current.stale_closed),
            },
            None => CounterDelta {
                waits: current.wait_count,
                wait_time: current.wait_duration,
                stale_closed: current.stale_closed,
            },
        };
        self.last.insert(pool.to_string(), current.clone());
        delta
    }
}

fn grow(prev: u64, current: u64) -> u64 {
    if current >= prev { current - prev } else { current }
}

/// Take one sample and export it.
pub fn sample(probes: &[Arc<dyn PoolProbe>], cache: Option<&StatsSource>, memory: &mut CounterMemory) {
    for probe in probes {
        let snapshot = probe.snapshot();
        crate::metrics::record_pool_gauges(
            probe.name(),
            snapshot.open,
            snapshot.in_use,
            snapshot.idle,
        );
        let delta = memory.delta(probe.name(), &snapshot);
        crate::metrics::record_pool_deltas(
            probe.name(),
            delta.waits,
            delta.wait_time,
            delta.stale_closed,
        );
    }
    if let Some(stats) = cache {
        let stats = stats();
        rampart_cache::metrics::set_entries("L1", stats.entries);
        crate::metrics::set_cache_cost(stats.cost);
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TelemetryCollector {
    running: Mutex<Option<Running>>,
}

impl TelemetryCollector {
    /// Spawn the sampling loop. The first sample is taken immediately.
    pub fn start(interval: Duration, probes: Vec<Arc<dyn PoolProbe>>, cache: Option<StatsSource>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut memory = CounterMemory::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => sample(&probes, cache.as_ref(), &mut memory),
                }
            }
            tracing::debug!("telemetry collector stopped");
        });
        tracing::info!(interval_secs = interval.as_secs(), "telemetry collector started");
        Self {
            running: Mutex::new(Some(Running { cancel, handle })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
    }
}
