use crate::IoKind;
use core::time::Duration;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};

struct Stat {
    count: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    cancelled: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Stat {
    const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    fn observe(&self, bytes: u64, dur: Duration, failed: bool) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let avg_ns = if count == 0 {
            0.0
        } else {
            total_ns as f64 / count as f64
        };
        StatSnapshot {
            count,
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            avg_ns,
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

static READ: Stat = Stat::new();
static WRITE: Stat = Stat::new();
static FLUSH: Stat = Stat::new();
static UNMAP: Stat = Stat::new();
static BUSY_REJECTS: AtomicU64 = AtomicU64::new(0);
static INFLIGHT: AtomicU64 = AtomicU64::new(0);

fn stat(kind: IoKind) -> &'static Stat {
    match kind {
        IoKind::Read => &READ,
        IoKind::Write => &WRITE,
        IoKind::Flush => &FLUSH,
        IoKind::Unmap => &UNMAP,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StatSnapshot {
    pub count: u64,
    pub bytes: u64,
    pub errors: u64,
    pub cancelled: u64,
    pub avg_ns: f64,
    pub max_ns: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSnapshot {
    pub read: StatSnapshot,
    pub write: StatSnapshot,
    pub flush: StatSnapshot,
    pub unmap: StatSnapshot,
    pub busy_rejects: u64,
    /// Requests currently in flight across every channel.
    pub inflight: u64,
}

pub fn record_submit(kind: IoKind) {
    counter!("vbd_submitted_total", "op" => kind.as_str()).increment(1);
}

pub fn observe_completion(kind: IoKind, bytes: u64, dur: Duration, failed: bool) {
    let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
    counter!("vbd_completed_total", "op" => kind.as_str()).increment(1);
    if failed {
        counter!("vbd_remote_errors_total", "op" => kind.as_str()).increment(1);
    } else {
        counter!("vbd_bytes_total", "op" => kind.as_str()).increment(bytes);
    }
    histogram!("vbd_io_latency_ns", "op" => kind.as_str()).record(ns as f64);
    stat(kind).observe(if failed { 0 } else { bytes }, dur, failed);
}

pub fn record_cancelled(kind: IoKind) {
    counter!("vbd_cancelled_total", "op" => kind.as_str()).increment(1);
    stat(kind).cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_busy_reject() {
    counter!("vbd_channel_busy_total").increment(1);
    BUSY_REJECTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inflight_add(count: usize) {
    if count == 0 {
        return;
    }
    gauge!("vbd_inflight_requests").increment(count as f64);
    INFLIGHT.fetch_add(count as u64, Ordering::Relaxed);
}

pub fn inflight_sub(count: usize) {
    if count == 0 {
        return;
    }
    gauge!("vbd_inflight_requests").decrement(count as f64);
    INFLIGHT.fetch_sub(count as u64, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        read: READ.snapshot(),
        write: WRITE.snapshot(),
        flush: FLUSH.snapshot(),
        unmap: UNMAP.snapshot(),
        busy_rejects: BUSY_REJECTS.load(Ordering::Relaxed),
        inflight: INFLIGHT.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_unmap_completions() {
        let before = snapshot().unmap;
        observe_completion(IoKind::Unmap, 4096, Duration::from_micros(3), false);
        observe_completion(IoKind::Unmap, 4096, Duration::from_micros(9), true);
        record_cancelled(IoKind::Unmap);
        let after = snapshot().unmap;
        assert!(after.count >= before.count + 2);
        assert!(after.errors > before.errors);
        assert!(after.cancelled > before.cancelled);
        assert!(after.max_ns >= 9_000);
        assert!(after.avg_ns > 0.0);
    }

    #[test]
    fn inflight_gauge_is_aggregate() {
        let before = snapshot().inflight;
        inflight_add(3);
        inflight_add(0);
        inflight_sub(2);
        assert_eq!(snapshot().inflight, before + 1);
        inflight_sub(1);
        assert_eq!(snapshot().inflight, before);
    }
}
