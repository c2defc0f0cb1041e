use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::fs::OpenOptions;
use tokio::task;
use tracing::{debug, trace};
use vbd_core::{
    RemoteVolume, SgList, VolumeClient, VolumeCompletion, VolumeError, VolumeErrorKind,
    VolumeQueue, VolumeResult,
};

const ZERO_CHUNK: usize = 64 * 1024;

/// Client mapping `pool/image` onto `<root>/<pool>/<image>` regular files.
///
/// Each channel queue gets its own worker thread performing positional I/O, so submissions never
/// block the channel's thread.
#[derive(Clone, Debug)]
pub struct DirectoryVolumeClient {
    root: PathBuf,
}

impl DirectoryVolumeClient {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure!(root.is_dir(), "{} is not a directory", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or resize) the backing file for `pool/image`.
    pub fn create_image(&self, pool: &str, image: &str, size: u64) -> Result<PathBuf> {
        ensure!(size > 0, "image size must be non-zero");
        let path = self.image_path(pool, image)?;
        let dir = self.root.join(pool);
        std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("resize {}", path.display()))?;
        debug!(path = %path.display(), size, "image created");
        Ok(path)
    }

    fn image_path(&self, pool: &str, image: &str) -> VolumeResult<PathBuf> {
        for part in [pool, image] {
            if part.is_empty() || part == "." || part == ".." || part.contains('/') {
                return Err(VolumeError::with_message(
                    VolumeErrorKind::NotFound,
                    format!("invalid path component {part:?}"),
                ));
            }
        }
        Ok(self.root.join(pool).join(image))
    }
}

#[async_trait]
impl VolumeClient for DirectoryVolumeClient {
    async fn open(&self, pool: &str, image: &str) -> VolumeResult<Arc<dyn RemoteVolume>> {
        let path = self.image_path(pool, image)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|err| open_error(&path, err))?;
        let len = file
            .metadata()
            .await
            .map_err(|err| open_error(&path, err))?
            .len();
        debug!(path = %path.display(), len, "volume opened");
        Ok(Arc::new(FileVolume {
            file: Arc::new(file.into_std().await),
            len,
            path,
            next_queue: AtomicU64::new(0),
        }))
    }
}

fn open_error(path: &Path, err: io::Error) -> VolumeError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => VolumeErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => VolumeErrorKind::AccessDenied,
        _ => VolumeErrorKind::Io,
    };
    VolumeError::with_message(kind, format!("{}: {err}", path.display()))
}

fn io_error(err: io::Error) -> VolumeError {
    VolumeError::with_message(VolumeErrorKind::Io, err.to_string())
}

struct FileVolume {
    file: Arc<File>,
    len: u64,
    path: PathBuf,
    next_queue: AtomicU64,
}

#[async_trait]
impl RemoteVolume for FileVolume {
    async fn size(&self) -> VolumeResult<u64> {
        Ok(self.len)
    }

    fn open_queue(&self) -> VolumeResult<Box<dyn VolumeQueue>> {
        let queue_id = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let (op_tx, op_rx) = mpsc::channel::<FileOp>();
        let (done_tx, done_rx) = mpsc::channel::<VolumeCompletion>();
        let file = self.file.clone();
        let len = self.len;
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        std::thread::Builder::new()
            .name(format!("vbd-file-q{queue_id}"))
            .spawn(move || queue_worker_main(file, len, op_rx, done_tx, worker_stop))
            .map_err(io_error)?;
        trace!(path = %self.path.display(), queue_id, "queue worker started");
        Ok(Box::new(FileQueue {
            queue_id,
            ops: Some(op_tx),
            completions: done_rx,
            stop,
        }))
    }

    async fn close(&self) -> VolumeResult<()> {
        let file = self.file.clone();
        task::spawn_blocking(move || file.sync_all())
            .await
            .unwrap_or_else(|err| {
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("close join error: {err}"),
                ))
            })
            .map_err(io_error)?;
        debug!(path = %self.path.display(), "volume closed");
        Ok(())
    }
}

enum FileOp {
    Read { id: u64, offset: u64, buffers: SgList },
    Write { id: u64, offset: u64, buffers: SgList },
    Flush { id: u64 },
    Unmap { id: u64, offset: u64, length: u64 },
}

/// Submission side of a queue worker. The worker is detached: dropping the queue tells it to
/// skip whatever is still queued and exit after the operation it is currently running.
struct FileQueue {
    queue_id: u64,
    ops: Option<mpsc::Sender<FileOp>>,
    completions: mpsc::Receiver<VolumeCompletion>,
    stop: Arc<AtomicBool>,
}

impl FileQueue {
    fn send(&mut self, op: FileOp) -> VolumeResult<()> {
        let ops = self
            .ops
            .as_ref()
            .ok_or_else(|| VolumeError::with_message(VolumeErrorKind::Io, "queue stopped"))?;
        ops.send(op)
            .map_err(|_| VolumeError::with_message(VolumeErrorKind::Io, "queue worker exited"))
    }
}

impl VolumeQueue for FileQueue {
    fn submit_read(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()> {
        self.send(FileOp::Read {
            id,
            offset,
            buffers,
        })
    }

    fn submit_write(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()> {
        self.send(FileOp::Write {
            id,
            offset,
            buffers,
        })
    }

    fn submit_flush(&mut self, id: u64) -> VolumeResult<()> {
        self.send(FileOp::Flush { id })
    }

    fn submit_unmap(&mut self, id: u64, offset: u64, length: u64) -> VolumeResult<()> {
        self.send(FileOp::Unmap { id, offset, length })
    }

    fn poll_completions(&mut self) -> Vec<VolumeCompletion> {
        self.completions.try_iter().collect()
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.ops = None;
        trace!(queue_id = self.queue_id, "queue worker detached");
    }
}

fn queue_worker_main(
    file: Arc<File>,
    len: u64,
    ops: mpsc::Receiver<FileOp>,
    done: mpsc::Sender<VolumeCompletion>,
    stop: Arc<AtomicBool>,
) {
    for op in ops {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let completion = match op {
            FileOp::Read {
                id,
                offset,
                mut buffers,
            } => {
                let status = read_into(&file, offset, &mut buffers);
                VolumeCompletion::new(id, status, Some(buffers))
            }
            FileOp::Write {
                id,
                offset,
                buffers,
            } => {
                let status = write_from(&file, len, offset, &buffers);
                VolumeCompletion::new(id, status, Some(buffers))
            }
            FileOp::Flush { id } => {
                VolumeCompletion::new(id, errno_status(file.sync_data()), None)
            }
            FileOp::Unmap { id, offset, length } => {
                VolumeCompletion::new(id, errno_status(discard(&file, offset, length)), None)
            }
        };
        if done.send(completion).is_err() {
            break;
        }
    }
}

/// Fill `buffers` from `offset`, stopping early at end of file.
fn read_into(file: &File, offset: u64, buffers: &mut SgList) -> i32 {
    let mut pos = offset;
    let mut total = 0usize;
    for seg in buffers.segments_mut() {
        let mut filled = 0;
        while filled < seg.len() {
            match file.read_at(&mut seg[filled..], pos) {
                Ok(0) => return len_status(total + filled),
                Ok(n) => {
                    filled += n;
                    pos += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return -raw_errno(&err),
            }
        }
        total += filled;
    }
    len_status(total)
}

fn write_from(file: &File, len: u64, offset: u64, buffers: &SgList) -> i32 {
    if offset.saturating_add(buffers.total_len()) > len {
        return -libc::EINVAL;
    }
    let mut pos = offset;
    for seg in buffers.segments() {
        if let Err(err) = file.write_all_at(seg, pos) {
            return -raw_errno(&err);
        }
        pos += seg.len() as u64;
    }
    0
}

fn discard(file: &File, offset: u64, length: u64) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }
    if punch_hole(file, offset, length).is_ok() {
        return Ok(());
    }
    let zeros = vec![0u8; ZERO_CHUNK];
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let n = (end - pos).min(ZERO_CHUNK as u64) as usize;
        file.write_all_at(&zeros[..n], pos)?;
        pos += n as u64;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let offset = libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
    let length = libc::off_t::try_from(length)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            length,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _length: u64) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

fn raw_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn errno_status(result: io::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => -raw_errno(&err),
    }
}

/// Byte count as a completion status. Channels refuse reads longer than `i32::MAX`, so the
/// clamp only matters to callers driving a queue directly.
fn len_status(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}
