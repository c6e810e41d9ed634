use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct CpuCounters {
    pushed: AtomicU64,
    dropped: AtomicU64,
}

/// Event counters, kept for the lifetime of a capture context
#[derive(Debug)]
pub struct CaptureStats {
    cpus: Box<[CpuCounters]>,
    /// Submissions whose CPU hint is outside the buffer pool
    misrouted: AtomicU64,
}

impl CaptureStats {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus: (0..cpus).map(|_| CpuCounters::default()).collect(),
            misrouted: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn record_push(&self, cpu: usize) {
        if let Some(counters) = self.cpus.get(cpu) {
            counters.pushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_drop(&self, cpu: usize) {
        match self.cpus.get(cpu) {
            Some(counters) => counters.dropped.fetch_add(1, Ordering::Relaxed),
            None => self.misrouted.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            per_cpu: self
                .cpus
                .iter()
                .enumerate()
                .map(|(cpu, counters)| CpuStats {
                    cpu,
                    pushed: counters.pushed.load(Ordering::Relaxed),
                    dropped_events: counters.dropped.load(Ordering::Relaxed),
                })
                .collect(),
            misrouted: self.misrouted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuStats {
    pub cpu: usize,
    pub pushed: u64,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub per_cpu: Vec<CpuStats>,
    pub misrouted: u64,
}

impl StatsSnapshot {
    pub fn total_pushed(&self) -> u64 {
        self.per_cpu.iter().map(|c| c.pushed).sum()
    }

    /// Dropped events, misrouted submissions included
    pub fn total_dropped(&self) -> u64 {
        self.per_cpu.iter().map(|c| c.dropped_events).sum::<u64>() + self.misrouted
    }

    /// Counters accumulated since `earlier` was taken
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            per_cpu: self
                .per_cpu
                .iter()
                .map(|now| {
                    let before = earlier.per_cpu.get(now.cpu).copied().unwrap_or_default();
                    CpuStats {
                        cpu: now.cpu,
                        pushed: now.pushed - before.pushed,
                        dropped_events: now.dropped_events - before.dropped_events,
                    }
                })
                .collect(),
            misrouted: self.misrouted - earlier.misrouted,
        }
    }
}
