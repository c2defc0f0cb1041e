use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
use vbd_core::{BdevErrorKind, BdevResult, Device, IoChannel, IoCompletion, RequestId, SgList};

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WorkerReport {
    pub writes: u64,
    pub reads: u64,
    pub failures: u64,
    pub mismatches: u64,
}

impl WorkerReport {
    pub fn merge(&mut self, other: WorkerReport) {
        self.writes += other.writes;
        self.reads += other.reads;
        self.failures += other.failures;
        self.mismatches += other.mismatches;
    }
}

#[derive(Default)]
struct Tally {
    writes: AtomicU64,
    reads: AtomicU64,
    failures: AtomicU64,
    mismatches: AtomicU64,
}

impl Tally {
    fn report(&self) -> WorkerReport {
        WorkerReport {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
        }
    }
}

fn pattern(lba: u64) -> u8 {
    (lba % 251) as u8 ^ 0x5a
}

/// Write `ops` blocks through a private channel, read them back and flush.
///
/// Runs on its own thread; the channel never leaves it.
pub fn run_worker(
    device: Device,
    worker: usize,
    ops: u64,
    stop: Arc<AtomicBool>,
) -> Result<WorkerReport> {
    let mut channel = IoChannel::open(&device)
        .with_context(|| format!("open channel for worker {worker}"))?;
    let tally = Arc::new(Tally::default());
    let block_size = device.block_size() as u64;
    let block_count = device.block_count();
    let lbas: Vec<u64> = (0..ops)
        .map(|i| (worker as u64 * ops + i) % block_count)
        .collect();
    debug!(device = device.name(), worker, ops, "worker started");

    for &lba in &lbas {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        submit_with_retry(&mut channel, |channel| {
            let tally = tally.clone();
            device.write(
                channel,
                SgList::from(vec![pattern(lba); block_size as usize]),
                lba * block_size,
                block_size,
                move |done: IoCompletion| {
                    if done.is_success() {
                        tally.writes.fetch_add(1, Ordering::Relaxed);
                    } else {
                        tally.failures.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )
        })?;
    }
    drain(&mut channel);

    for &lba in &lbas {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        submit_with_retry(&mut channel, |channel| {
            let tally = tally.clone();
            device.read(
                channel,
                SgList::zeroed(block_size as usize),
                lba * block_size,
                block_size,
                move |done: IoCompletion| {
                    if !done.is_success() {
                        tally.failures.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    tally.reads.fetch_add(1, Ordering::Relaxed);
                    let expected = pattern(lba);
                    let intact = done
                        .buffers
                        .as_ref()
                        .is_some_and(|buf| buf.to_vec().iter().all(|b| *b == expected));
                    if !intact {
                        tally.mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                },
            )
        })?;
    }
    drain(&mut channel);

    submit_with_retry(&mut channel, |channel| {
        let tally = tally.clone();
        device.flush(channel, 0, 0, move |done: IoCompletion| {
            if let Err(err) = &done.result {
                warn!(error = %err, "flush failed");
                tally.failures.fetch_add(1, Ordering::Relaxed);
            }
        })
    })?;
    drain(&mut channel);
    channel.close();

    let report = tally.report();
    debug!(device = device.name(), worker, ?report, "worker finished");
    Ok(report)
}

fn submit_with_retry<F>(channel: &mut IoChannel, mut submit: F) -> Result<RequestId>
where
    F: FnMut(&mut IoChannel) -> BdevResult<RequestId>,
{
    loop {
        match submit(channel) {
            Ok(id) => return Ok(id),
            Err(err) if err.kind() == BdevErrorKind::ChannelBusy => {
                if channel.poll() == 0 {
                    thread::yield_now();
                }
            }
            Err(err) => return Err(err).context("submit request"),
        }
    }
}

fn drain(channel: &mut IoChannel) {
    while !channel.is_idle() {
        if channel.poll() == 0 {
            thread::yield_now();
        }
    }
}
