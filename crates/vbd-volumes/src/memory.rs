use anyhow::{ensure, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;
use vbd_core::{
    RemoteVolume, SgList, VolumeClient, VolumeCompletion, VolumeError, VolumeErrorKind,
    VolumeQueue, VolumeResult,
};

/// In-memory stand-in for a distributed storage cluster.
///
/// Images are byte vectors keyed by `(pool, image)`. Queued operations only execute when their
/// queue is polled, and polling can be paused, which makes completion timing fully controllable.
#[derive(Clone, Default)]
pub struct MemoryVolumeClient {
    images: Arc<Mutex<BTreeMap<(String, String), MemoryVolume>>>,
}

impl MemoryVolumeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled image of `size` bytes, replacing any previous one.
    pub fn create_image(&self, pool: &str, image: &str, size: u64) -> Result<MemoryVolume> {
        ensure!(size > 0, "image size must be non-zero");
        let len = usize::try_from(size)?;
        let volume = MemoryVolume::new(len);
        lock(&self.images).insert((pool.to_owned(), image.to_owned()), volume.clone());
        Ok(volume)
    }

    pub fn image(&self, pool: &str, image: &str) -> Option<MemoryVolume> {
        lock(&self.images)
            .get(&(pool.to_owned(), image.to_owned()))
            .cloned()
    }
}

#[async_trait]
impl VolumeClient for MemoryVolumeClient {
    async fn open(&self, pool: &str, image: &str) -> VolumeResult<Arc<dyn RemoteVolume>> {
        let volume = self.image(pool, image).ok_or_else(|| {
            VolumeError::with_message(VolumeErrorKind::NotFound, format!("{pool}/{image}"))
        })?;
        if volume.inner.deny_open.load(Ordering::SeqCst) {
            return Err(VolumeError::with_message(
                VolumeErrorKind::AccessDenied,
                format!("{pool}/{image}"),
            ));
        }
        volume.inner.closed.store(false, Ordering::SeqCst);
        Ok(Arc::new(volume))
    }
}

/// Handle to one in-memory image. Clones share state.
#[derive(Clone)]
pub struct MemoryVolume {
    inner: Arc<MemoryVolumeInner>,
}

struct MemoryVolumeInner {
    data: Mutex<Vec<u8>>,
    paused: AtomicBool,
    deny_open: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
    open_queues: AtomicUsize,
    faults: Mutex<VecDeque<i32>>,
}

impl MemoryVolume {
    fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(MemoryVolumeInner {
                data: Mutex::new(vec![0u8; len]),
                paused: AtomicBool::new(false),
                deny_open: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
                open_queues: AtomicUsize::new(0),
                faults: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Hold back completions until [`MemoryVolume::resume`].
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Make subsequent opens fail as if authentication was refused.
    pub fn deny_open(&self, deny: bool) {
        self.inner.deny_open.store(deny, Ordering::SeqCst);
    }

    /// Complete the next executed operation with `status` instead of performing it.
    pub fn inject_status(&self, status: i32) {
        lock(&self.inner.faults).push_back(status);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Queues opened and not yet dropped.
    pub fn open_queues(&self) -> usize {
        self.inner.open_queues.load(Ordering::SeqCst)
    }

    /// Copy of `len` bytes at `offset`.
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        lock(&self.inner.data)[offset..offset + len].to_vec()
    }

    fn execute(&self, op: PendingOp) -> VolumeCompletion {
        if let Some(status) = lock(&self.inner.faults).pop_front() {
            trace!(id = op.id(), status, "injected completion");
            return VolumeCompletion::new(op.id(), status, op.into_buffers());
        }
        let mut data = lock(&self.inner.data);
        match op {
            PendingOp::Read {
                id,
                offset,
                mut buffers,
            } => match range(&data, offset, buffers.total_len()) {
                Some((start, end)) => {
                    let copied = buffers.copy_from_slice(&data[start..end]);
                    VolumeCompletion::new(id, status_from_len(copied), Some(buffers))
                }
                None => VolumeCompletion::new(id, -libc::EINVAL, Some(buffers)),
            },
            PendingOp::Write {
                id,
                offset,
                buffers,
            } => match range(&data, offset, buffers.total_len()) {
                Some((start, _)) => {
                    let mut pos = start;
                    for seg in buffers.segments() {
                        data[pos..pos + seg.len()].copy_from_slice(seg);
                        pos += seg.len();
                    }
                    VolumeCompletion::new(id, 0, Some(buffers))
                }
                None => VolumeCompletion::new(id, -libc::EINVAL, Some(buffers)),
            },
            PendingOp::Flush { id } => VolumeCompletion::new(id, 0, None),
            PendingOp::Unmap { id, offset, length } => match range(&data, offset, length) {
                Some((start, end)) => {
                    data[start..end].fill(0);
                    VolumeCompletion::new(id, 0, None)
                }
                None => VolumeCompletion::new(id, -libc::EINVAL, None),
            },
        }
    }
}

#[async_trait]
impl RemoteVolume for MemoryVolume {
    async fn size(&self) -> VolumeResult<u64> {
        Ok(lock(&self.inner.data).len() as u64)
    }

    fn open_queue(&self) -> VolumeResult<Box<dyn VolumeQueue>> {
        if self.is_closed() {
            return Err(VolumeError::with_message(
                VolumeErrorKind::Io,
                "volume closed",
            ));
        }
        self.inner.open_queues.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryQueue {
            volume: self.clone(),
            pending: VecDeque::new(),
        }))
    }

    async fn close(&self) -> VolumeResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

enum PendingOp {
    Read { id: u64, offset: u64, buffers: SgList },
    Write { id: u64, offset: u64, buffers: SgList },
    Flush { id: u64 },
    Unmap { id: u64, offset: u64, length: u64 },
}

impl PendingOp {
    fn id(&self) -> u64 {
        match self {
            PendingOp::Read { id, .. }
            | PendingOp::Write { id, .. }
            | PendingOp::Flush { id }
            | PendingOp::Unmap { id, .. } => *id,
        }
    }

    fn into_buffers(self) -> Option<SgList> {
        match self {
            PendingOp::Read { buffers, .. } | PendingOp::Write { buffers, .. } => Some(buffers),
            PendingOp::Flush { .. } | PendingOp::Unmap { .. } => None,
        }
    }
}

struct MemoryQueue {
    volume: MemoryVolume,
    pending: VecDeque<PendingOp>,
}

impl MemoryQueue {
    fn push(&mut self, op: PendingOp) -> VolumeResult<()> {
        if self.volume.is_closed() {
            return Err(VolumeError::with_message(
                VolumeErrorKind::Io,
                "volume closed",
            ));
        }
        self.pending.push_back(op);
        Ok(())
    }
}

impl VolumeQueue for MemoryQueue {
    fn submit_read(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()> {
        self.push(PendingOp::Read {
            id,
            offset,
            buffers,
        })
    }

    fn submit_write(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()> {
        self.push(PendingOp::Write {
            id,
            offset,
            buffers,
        })
    }

    fn submit_flush(&mut self, id: u64) -> VolumeResult<()> {
        self.push(PendingOp::Flush { id })
    }

    fn submit_unmap(&mut self, id: u64, offset: u64, length: u64) -> VolumeResult<()> {
        self.push(PendingOp::Unmap { id, offset, length })
    }

    fn poll_completions(&mut self) -> Vec<VolumeCompletion> {
        if self.volume.inner.paused.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut done = Vec::with_capacity(self.pending.len());
        while let Some(op) = self.pending.pop_front() {
            done.push(self.volume.execute(op));
        }
        done
    }
}

impl Drop for MemoryQueue {
    fn drop(&mut self) {
        self.volume.inner.open_queues.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn range(data: &[u8], offset: u64, len: u64) -> Option<(usize, usize)> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= data.len()).then_some((start, end))
}

/// Channels refuse reads past `i32::MAX` bytes, so the clamp is never observed through one.
fn status_from_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}
