//! Process-wide decoded-group counters, published periodically alongside
//! pipeline health as a broker status snapshot.

use parking_lot::Mutex;
use std::time::Instant;

struct Inner {
    start: Instant,
    groups_total: u64,
}

pub struct Stats {
    inner: Mutex<Inner>,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct StatsSnapshot {
    pub uptime_sec: u64,
    pub groups_total: u64,
    pub groups_per_sec: f64,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            inner: Mutex::new(Inner { start: Instant::now(), groups_total: 0 }),
        }
    }

    pub fn record_group(&self) {
        self.inner.lock().groups_total += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        let elapsed = inner.start.elapsed().as_secs_f64();
        let gps = if elapsed > 0.0 { inner.groups_total as f64 / elapsed } else { 0.0 };
        StatsSnapshot {
            uptime_sec: elapsed as u64,
            groups_total: inner.groups_total,
            groups_per_sec: (gps * 10.0).round() / 10.0,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_counts_recorded_groups() {
        let stats = Stats::new();
        stats.record_group();
        stats.record_group();
        assert_eq!(stats.snapshot().groups_total, 2);
    }
}
