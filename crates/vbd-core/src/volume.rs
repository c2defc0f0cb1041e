use crate::{BdevError, BdevErrorKind, SgList};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub type VolumeResult<T> = core::result::Result<T, VolumeError>;

/// Describes the failure category for remote volume operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeErrorKind {
    NotFound,
    AccessDenied,
    Io,
    Unsupported,
    Other,
}

impl VolumeErrorKind {
    /// Negative errno reported alongside this failure, librbd style.
    pub fn errno(self) -> i32 {
        match self {
            VolumeErrorKind::NotFound => -libc::ENOENT,
            VolumeErrorKind::AccessDenied => -libc::EACCES,
            VolumeErrorKind::Unsupported => -libc::EOPNOTSUPP,
            VolumeErrorKind::Io | VolumeErrorKind::Other => -libc::EIO,
        }
    }
}

/// Error surfaced by [`VolumeClient`], [`RemoteVolume`] and [`VolumeQueue`] implementations.
#[derive(Clone, Debug)]
pub struct VolumeError {
    kind: VolumeErrorKind,
    message: Option<String>,
}

impl VolumeError {
    pub const fn new(kind: VolumeErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: VolumeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> VolumeErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Failure while opening or sizing a volume. The device never came up, so every kind
    /// collapses into [`BdevErrorKind::VolumeOpenFailed`].
    pub(crate) fn into_open_error(self, context: impl fmt::Display) -> BdevError {
        BdevError::with_message(BdevErrorKind::VolumeOpenFailed, format!("{context}: {self}"))
    }

    /// Failure on an open volume, reported as [`BdevErrorKind::RemoteIo`] with the kind's errno.
    pub(crate) fn into_remote_error(self, context: impl fmt::Display) -> BdevError {
        BdevError::remote(self.kind.errno(), format!("{context}: {self}"))
    }
}

impl fmt::Display for VolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for VolumeError {}

/// One finished operation reported by [`VolumeQueue::poll_completions`].
///
/// `status` follows the librbd convention: a negative errno on failure, otherwise the number of
/// bytes transferred for reads and zero for everything else.
#[derive(Debug)]
pub struct VolumeCompletion {
    pub id: u64,
    pub status: i32,
    pub buffers: Option<SgList>,
}

impl VolumeCompletion {
    pub fn new(id: u64, status: i32, buffers: Option<SgList>) -> Self {
        Self {
            id,
            status,
            buffers,
        }
    }
}

/// Entry point into the distributed storage client library.
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Open `image` inside `pool`, returning a handle shared by every channel of one device.
    async fn open(&self, pool: &str, image: &str) -> VolumeResult<Arc<dyn RemoteVolume>>;
}

/// An open remote volume.
///
/// Implementations must tolerate concurrent use from several channel threads; the device only
/// guarantees [`RemoteVolume::close`] is called after every channel has drained.
#[async_trait]
pub trait RemoteVolume: Send + Sync {
    /// Volume size in bytes.
    async fn size(&self) -> VolumeResult<u64>;

    /// Create the submission/completion queue used by one channel.
    fn open_queue(&self) -> VolumeResult<Box<dyn VolumeQueue>>;

    /// Release the volume.
    async fn close(&self) -> VolumeResult<()>;
}

/// Per-channel submission and completion-polling handle.
///
/// Submissions must not block; each accepted submission yields exactly one
/// [`VolumeCompletion`] carrying the same `id`.
pub trait VolumeQueue: Send {
    fn submit_read(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()>;

    fn submit_write(&mut self, id: u64, offset: u64, buffers: SgList) -> VolumeResult<()>;

    /// Volume-wide flush.
    fn submit_flush(&mut self, id: u64) -> VolumeResult<()>;

    /// Hint that `length` bytes at `offset` may be deallocated.
    fn submit_unmap(&mut self, id: u64, offset: u64, length: u64) -> VolumeResult<()>;

    /// Drain every completion that is ready right now without waiting.
    fn poll_completions(&mut self) -> Vec<VolumeCompletion>;
}
