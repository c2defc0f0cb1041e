use crate::device::ChannelMsg;
use crate::request::{map_status, RequestTracker, MAX_READ_LEN};
use crate::{
    metrics, BdevError, BdevErrorKind, BdevResult, Device, IoCompletion, IoKind, RequestId,
    SgList, VolumeQueue,
};
use futures_channel::{mpsc, oneshot};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// Per-thread submission and completion context for one device.
///
/// A channel is driven by exactly one thread: submissions and [`IoChannel::poll`] calls come
/// from the same place, so the in-flight table needs no locking. The device reaches the
/// channel only through its mailbox, which is drained at the start of every poll.
pub struct IoChannel {
    id: u64,
    device: Device,
    queue: Option<Box<dyn VolumeQueue>>,
    inflight: BTreeMap<RequestId, RequestTracker>,
    capacity: usize,
    next_request_id: u64,
    mailbox: mpsc::UnboundedReceiver<ChannelMsg>,
    quiesce_waiters: Vec<oneshot::Sender<()>>,
    closed: bool,
}

impl IoChannel {
    /// Open a channel on the calling thread.
    pub fn open(device: &Device) -> BdevResult<Self> {
        let (id, mailbox) = device.register_channel()?;
        let queue = match device.volume().open_queue() {
            Ok(queue) => queue,
            Err(err) => {
                device.unregister_channel(id);
                return Err(err.into_remote_error("open completion queue"));
            }
        };
        debug!(device = device.name(), channel = id, "channel opened");
        Ok(Self {
            id,
            device: device.clone(),
            queue: Some(queue),
            inflight: BTreeMap::new(),
            capacity: device.channel_capacity(),
            next_request_id: 1,
            mailbox,
            quiesce_waiters: Vec::new(),
            closed: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests submitted but not yet completed.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Validate and forward one request.
    ///
    /// Errors are returned synchronously and never produce a callback. On success the callback
    /// runs exactly once from a later [`IoChannel::poll`] or from channel teardown.
    pub fn submit<F>(
        &mut self,
        kind: IoKind,
        buffers: SgList,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        if self.closed {
            return Err(BdevError::with_message(
                BdevErrorKind::DeviceNotFound,
                "channel closed",
            ));
        }
        self.device.ensure_active()?;
        self.validate(kind, &buffers, offset, length)?;
        if self.inflight.len() >= self.capacity {
            metrics::record_busy_reject();
            return Err(BdevError::with_message(
                BdevErrorKind::ChannelBusy,
                format!("{} requests in flight", self.inflight.len()),
            ));
        }
        let Some(queue) = self.queue.as_mut() else {
            return Err(BdevError::new(BdevErrorKind::DeviceDeleting));
        };

        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let submitted = match kind {
            IoKind::Read => queue.submit_read(id.0, offset, buffers),
            IoKind::Write => queue.submit_write(id.0, offset, buffers),
            IoKind::Flush => queue.submit_flush(id.0),
            IoKind::Unmap => queue.submit_unmap(id.0, offset, length),
        };
        if let Err(err) = submitted {
            debug!(channel = self.id, request = %id, op = %kind, error = %err, "submit rejected by volume");
            return Err(err.into_remote_error(format_args!("submit {kind}")));
        }

        let tracker =
            RequestTracker::new(id, kind, offset, length, self.id, Box::new(callback));
        self.inflight.insert(id, tracker);
        metrics::record_submit(kind);
        metrics::inflight_add(1);
        trace!(
            channel = self.id,
            request = %id,
            op = %kind,
            offset,
            length,
            inflight = self.inflight.len(),
            "request submitted"
        );
        Ok(id)
    }

    fn validate(&self, kind: IoKind, buffers: &SgList, offset: u64, length: u64) -> BdevResult<()> {
        let size = self.device.size_bytes();
        let end = offset.checked_add(length).ok_or_else(|| {
            BdevError::with_message(BdevErrorKind::OutOfRange, "offset + length overflows")
        })?;
        if end > size {
            return Err(BdevError::with_message(
                BdevErrorKind::OutOfRange,
                format!("request [{offset}, {end}) past end of device ({size} bytes)"),
            ));
        }
        if kind == IoKind::Read && length > MAX_READ_LEN {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidArgument,
                format!("read of {length} bytes exceeds limit of {MAX_READ_LEN}"),
            ));
        }
        let described = buffers.total_len();
        if kind.carries_data() {
            if described != length {
                return Err(BdevError::with_message(
                    BdevErrorKind::InvalidArgument,
                    format!("buffers describe {described} bytes, request declares {length}"),
                ));
            }
        } else if described != 0 {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidArgument,
                format!("{kind} does not take data buffers"),
            ));
        }
        Ok(())
    }

    /// Drain every ready completion, invoking callbacks in the order the volume reports them.
    ///
    /// Returns the number of completions processed so the caller can decide whether to keep
    /// polling.
    ///
    /// # Panics
    ///
    /// Panics if the volume reports a completion for a request this channel is not tracking;
    /// that means the volume broke its one-completion-per-submission contract.
    pub fn poll(&mut self) -> usize {
        self.drain_mailbox();
        let completions = match self.queue.as_mut() {
            Some(queue) => queue.poll_completions(),
            None => Vec::new(),
        };
        let processed = completions.len();
        for done in completions {
            let id = RequestId(done.id);
            let Some(tracker) = self.inflight.remove(&id) else {
                panic!(
                    "channel {} received completion for unknown request {id} (status {})",
                    self.id, done.status
                );
            };
            let result = map_status(tracker.kind, tracker.length, done.status);
            let elapsed = tracker.submitted_at.elapsed();
            metrics::observe_completion(tracker.kind, tracker.length, elapsed, result.is_err());
            match &result {
                Ok(()) => trace!(
                    channel = self.id,
                    request = %id,
                    op = %tracker.kind,
                    elapsed_us = elapsed.as_micros() as u64,
                    "request completed"
                ),
                Err(err) => debug!(
                    channel = self.id,
                    request = %id,
                    op = %tracker.kind,
                    error = %err,
                    "request failed"
                ),
            }
            tracker.complete(result, done.buffers);
        }
        metrics::inflight_sub(processed);
        self.maybe_quiesce();
        processed
    }

    /// Close the channel, cancelling anything still in flight.
    pub fn close(mut self) {
        self.teardown();
    }

    fn drain_mailbox(&mut self) {
        while let Ok(msg) = self.mailbox.try_recv() {
            match msg {
                ChannelMsg::Quiesce { done } => {
                    debug!(
                        channel = self.id,
                        inflight = self.inflight.len(),
                        "quiesce requested"
                    );
                    self.quiesce_waiters.push(done);
                }
            }
        }
    }

    fn maybe_quiesce(&mut self) {
        if self.quiesce_waiters.is_empty() || !self.inflight.is_empty() {
            return;
        }
        // Nothing can be submitted once a quiesce is pending, so the queue is done.
        self.queue = None;
        debug!(channel = self.id, "channel quiesced");
        for done in self.quiesce_waiters.drain(..) {
            let _ = done.send(());
        }
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.drain_mailbox();
        let pending = std::mem::take(&mut self.inflight);
        if !pending.is_empty() {
            warn!(
                device = self.device.name(),
                channel = self.id,
                count = pending.len(),
                "cancelling in-flight requests"
            );
        }
        metrics::inflight_sub(pending.len());
        for (_, tracker) in pending {
            metrics::record_cancelled(tracker.kind);
            tracker.complete(Err(BdevError::new(BdevErrorKind::Cancelled)), None);
        }
        self.queue = None;
        self.device.unregister_channel(self.id);
        for done in self.quiesce_waiters.drain(..) {
            let _ = done.send(());
        }
        debug!(device = self.device.name(), channel = self.id, "channel closed");
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoChannel")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("inflight", &self.inflight.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.closed)
            .finish()
    }
}
