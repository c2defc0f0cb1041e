use crate::{BdevError, BdevErrorKind, BdevResult, SgList};
use std::fmt;
use std::time::Instant;

/// Block operation kinds accepted by a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Flush,
    Unmap,
}

impl IoKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IoKind::Read => "read",
            IoKind::Write => "write",
            IoKind::Flush => "flush",
            IoKind::Unmap => "unmap",
        }
    }

    /// Whether the request moves data through a buffer descriptor.
    pub fn carries_data(self) -> bool {
        matches!(self, IoKind::Read | IoKind::Write)
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-local request identifier, also used as the collaborator's opaque id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result delivered exactly once for every accepted request.
#[derive(Debug)]
pub struct IoCompletion {
    pub id: RequestId,
    pub kind: IoKind,
    pub offset: u64,
    pub length: u64,
    pub result: BdevResult<()>,
    /// Buffers handed back by the collaborator. `None` for cancelled requests and for
    /// operations that carry no data.
    pub buffers: Option<SgList>,
}

impl IoCompletion {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_kind(&self) -> Option<BdevErrorKind> {
        self.result.as_ref().err().map(BdevError::kind)
    }
}

/// Completion callback; any caller context is captured by the closure.
pub type IoCallback = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

/// Bookkeeping for one in-flight operation.
pub(crate) struct RequestTracker {
    pub(crate) id: RequestId,
    pub(crate) kind: IoKind,
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) channel_id: u64,
    pub(crate) submitted_at: Instant,
    callback: IoCallback,
}

impl RequestTracker {
    pub(crate) fn new(
        id: RequestId,
        kind: IoKind,
        offset: u64,
        length: u64,
        channel_id: u64,
        callback: IoCallback,
    ) -> Self {
        Self {
            id,
            kind,
            offset,
            length,
            channel_id,
            submitted_at: Instant::now(),
            callback,
        }
    }

    /// Consume the tracker and invoke its callback.
    pub(crate) fn complete(self, result: BdevResult<()>, buffers: Option<SgList>) {
        let completion = IoCompletion {
            id: self.id,
            kind: self.kind,
            offset: self.offset,
            length: self.length,
            result,
            buffers,
        };
        (self.callback)(completion);
    }
}

impl fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

/// Longest read a channel accepts. Completion status is an `i32` byte count, so a longer
/// read could never be reported as complete.
pub const MAX_READ_LEN: u64 = i32::MAX as u64;

/// Translate a raw collaborator status into the local taxonomy.
///
/// Reads must report exactly `length` bytes; every other operation must report zero.
pub(crate) fn map_status(kind: IoKind, length: u64, status: i32) -> BdevResult<()> {
    if status < 0 {
        return Err(BdevError::remote(status, format!("remote {kind} failed")));
    }
    let expected = match kind {
        IoKind::Read => length,
        IoKind::Write | IoKind::Flush | IoKind::Unmap => 0,
    };
    if status as u64 != expected {
        return Err(BdevError::remote(
            status,
            format!("remote {kind} transferred {status} bytes, expected {expected}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_status_is_remote_error() {
        let err = map_status(IoKind::Write, 512, -5).unwrap_err();
        assert_eq!(err.kind(), BdevErrorKind::RemoteIo);
        assert_eq!(err.remote_status(), Some(-5));
    }

    #[test]
    fn read_requires_full_length() {
        assert!(map_status(IoKind::Read, 512, 512).is_ok());
        let err = map_status(IoKind::Read, 512, 256).unwrap_err();
        assert_eq!(err.kind(), BdevErrorKind::RemoteIo);
        assert_eq!(err.remote_status(), Some(256));
    }

    #[test]
    fn non_read_ops_expect_zero() {
        assert!(map_status(IoKind::Flush, 0, 0).is_ok());
        assert!(map_status(IoKind::Unmap, 4096, 0).is_ok());
        assert!(map_status(IoKind::Write, 512, 512).is_err());
    }

    #[test]
    fn tracker_invokes_callback_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tracker = RequestTracker::new(
            RequestId(7),
            IoKind::Flush,
            0,
            0,
            1,
            Box::new(move |done| tx.send(done).unwrap()),
        );
        tracker.complete(Err(BdevError::new(BdevErrorKind::Cancelled)), None);
        let done = rx.recv().unwrap();
        assert_eq!(done.id, RequestId(7));
        assert_eq!(done.error_kind(), Some(BdevErrorKind::Cancelled));
        assert!(rx.try_recv().is_err());
    }
}
