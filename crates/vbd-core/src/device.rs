use crate::{
    BdevError, BdevErrorKind, BdevResult, IoChannel, IoCompletion, IoKind, RemoteVolume,
    RequestId, SgList, VolumeClient,
};
use futures_channel::{mpsc, oneshot};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

/// Default bound on in-flight requests per channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;

/// Tunables shared by every device created through one backend.
#[derive(Clone, Copy, Debug)]
pub struct BackendConfig {
    /// Maximum number of in-flight requests a single channel accepts before answering
    /// [`BdevErrorKind::ChannelBusy`].
    pub channel_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> BdevResult<()> {
        if self.channel_capacity == 0 {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidConfig,
                "channel capacity must be non-zero",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Creating,
    Active,
    Deleting,
    Deleted,
}

impl DeviceState {
    fn as_str(self) -> &'static str {
        match self {
            DeviceState::Creating => "creating",
            DeviceState::Active => "active",
            DeviceState::Deleting => "deleting",
            DeviceState::Deleted => "deleted",
        }
    }

    /// Gate applied at every entry point that starts new work.
    fn ensure_active(self) -> BdevResult<()> {
        match self {
            DeviceState::Active => Ok(()),
            DeviceState::Creating => Err(BdevError::with_message(
                BdevErrorKind::DeviceNotFound,
                "device is still being created",
            )),
            DeviceState::Deleting => Err(BdevError::new(BdevErrorKind::DeviceDeleting)),
            DeviceState::Deleted => Err(BdevError::new(BdevErrorKind::DeviceNotFound)),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages delivered to a channel on its own thread.
pub(crate) enum ChannelMsg {
    /// Fire `done` once the channel's in-flight table is empty.
    Quiesce { done: oneshot::Sender<()> },
}

struct SharedDeviceState {
    inner: Mutex<SharedDeviceStateInner>,
}

struct SharedDeviceStateInner {
    state: DeviceState,
    channels: BTreeMap<u64, mpsc::UnboundedSender<ChannelMsg>>,
    next_channel_id: u64,
}

impl SharedDeviceState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SharedDeviceStateInner {
                state: DeviceState::Creating,
                channels: BTreeMap::new(),
                next_channel_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedDeviceStateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SharedDeviceStateInner {
    fn transition(&mut self, name: &str, next: DeviceState) {
        if self.state == next {
            return;
        }
        info!(
            device = name,
            from = %self.state,
            to = %next,
            "device state transition"
        );
        self.state = next;
    }
}

struct DeviceInner {
    name: String,
    pool: String,
    image: String,
    block_size: u32,
    block_count: u64,
    config: BackendConfig,
    volume: Arc<dyn RemoteVolume>,
    state: SharedDeviceState,
}

/// Handle to a block device backed by a remote volume.
///
/// Cloning is cheap; every clone refers to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open the remote volume and bring a device online.
    ///
    /// Name uniqueness is enforced by [`crate::Backend`]; this only validates geometry.
    pub async fn create(
        client: &dyn VolumeClient,
        name: &str,
        pool: &str,
        image: &str,
        block_size: u32,
        config: BackendConfig,
    ) -> BdevResult<Device> {
        debug!(device = name, pool, image, block_size, "create device requested");
        config.validate()?;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidConfig,
                format!("block size {block_size} must be a non-zero power of two"),
            ));
        }

        let volume = client
            .open(pool, image)
            .await
            .map_err(|err| err.into_open_error(format_args!("open {pool}/{image}")))?;
        let size = match volume.size().await {
            Ok(size) => size,
            Err(err) => {
                release_after_failed_create(volume.as_ref(), name).await;
                return Err(err.into_open_error(format_args!("query size of {pool}/{image}")));
            }
        };
        if size < block_size as u64 {
            release_after_failed_create(volume.as_ref(), name).await;
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidConfig,
                format!("volume size {size} is smaller than block size {block_size}"),
            ));
        }
        let block_count = size / block_size as u64;

        let device = Device {
            inner: Arc::new(DeviceInner {
                name: name.to_owned(),
                pool: pool.to_owned(),
                image: image.to_owned(),
                block_size,
                block_count,
                config,
                volume,
                state: SharedDeviceState::new(),
            }),
        };
        device
            .inner
            .state
            .lock()
            .transition(&device.inner.name, DeviceState::Active);
        debug!(device = name, block_count, "device online");
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool(&self) -> &str {
        &self.inner.pool
    }

    pub fn image(&self) -> &str {
        &self.inner.image
    }

    pub fn block_size(&self) -> u32 {
        self.inner.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.inner.block_count
    }

    /// Addressable bytes: `block_count * block_size`.
    pub fn size_bytes(&self) -> u64 {
        self.inner.block_count * self.inner.block_size as u64
    }

    pub fn state(&self) -> DeviceState {
        self.inner.state.lock().state
    }

    pub fn channel_capacity(&self) -> usize {
        self.inner.config.channel_capacity
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channels.len()
    }

    pub fn ptr_eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open an I/O channel bound to the calling thread; see [`IoChannel::open`].
    pub fn open_channel(&self) -> BdevResult<IoChannel> {
        IoChannel::open(self)
    }

    pub fn read<F>(
        &self,
        channel: &mut IoChannel,
        buffers: SgList,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit_on(channel, IoKind::Read, buffers, offset, length, callback)
    }

    pub fn write<F>(
        &self,
        channel: &mut IoChannel,
        buffers: SgList,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit_on(channel, IoKind::Write, buffers, offset, length, callback)
    }

    pub fn flush<F>(
        &self,
        channel: &mut IoChannel,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit_on(channel, IoKind::Flush, SgList::new(), offset, length, callback)
    }

    pub fn unmap<F>(
        &self,
        channel: &mut IoChannel,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        self.submit_on(channel, IoKind::Unmap, SgList::new(), offset, length, callback)
    }

    fn submit_on<F>(
        &self,
        channel: &mut IoChannel,
        kind: IoKind,
        buffers: SgList,
        offset: u64,
        length: u64,
        callback: F,
    ) -> BdevResult<RequestId>
    where
        F: FnOnce(IoCompletion) + Send + 'static,
    {
        if !channel.device().ptr_eq(self) {
            return Err(BdevError::with_message(
                BdevErrorKind::InvalidArgument,
                format!(
                    "channel {} belongs to device {}, not {}",
                    channel.id(),
                    channel.device().name(),
                    self.name()
                ),
            ));
        }
        channel.submit(kind, buffers, offset, length, callback)
    }

    /// Begin tearing the device down.
    ///
    /// New submissions and channel opens fail with [`BdevErrorKind::DeviceDeleting`] as soon as
    /// this returns. The returned task resolves once every channel has drained, the remote
    /// volume has been closed and `on_done` has been invoked; callers should spawn or poll it
    /// from their own event loop. Channels keep being polled by their owning threads meanwhile.
    ///
    /// The task must be driven to completion. Dropping it early leaves the device in
    /// [`DeviceState::Deleting`] with the volume open and `on_done` never called.
    pub fn delete<F>(&self, on_done: F) -> BdevResult<DeleteTask>
    where
        F: FnOnce(BdevResult<()>) + Send + 'static,
    {
        let waiters = {
            let mut guard = self.inner.state.lock();
            guard.state.ensure_active()?;
            guard.transition(&self.inner.name, DeviceState::Deleting);
            let mut waiters = Vec::with_capacity(guard.channels.len());
            for (channel_id, mailbox) in &guard.channels {
                let (done_tx, done_rx) = oneshot::channel();
                if mailbox
                    .unbounded_send(ChannelMsg::Quiesce { done: done_tx })
                    .is_err()
                {
                    debug!(
                        device = %self.inner.name,
                        channel = channel_id,
                        "channel mailbox closed; treating as drained"
                    );
                    continue;
                }
                waiters.push(done_rx);
            }
            waiters
        };
        debug!(
            device = %self.inner.name,
            channels = waiters.len(),
            "waiting for channels to quiesce"
        );

        let device = self.clone();
        let task = async move {
            // A cancelled receiver means the channel was dropped, which force-completes
            // everything it still tracked.
            let _ = join_all(waiters).await;
            debug!(device = %device.inner.name, "channels quiesced; releasing volume");
            let result = device.inner.volume.close().await.map_err(|err| {
                err.into_remote_error(format_args!(
                    "close {}/{}",
                    device.inner.pool, device.inner.image
                ))
            });
            if let Err(err) = &result {
                warn!(device = %device.inner.name, error = %err, "volume release failed");
            }
            {
                let mut guard = device.inner.state.lock();
                guard.channels.clear();
                guard.transition(&device.inner.name, DeviceState::Deleted);
            }
            on_done(result);
        };
        Ok(DeleteTask {
            device: self.inner.name.clone(),
            inner: task.boxed(),
            finished: false,
        })
    }

    pub(crate) fn ensure_active(&self) -> BdevResult<()> {
        self.inner.state.lock().state.ensure_active()
    }

    /// Register a new channel, returning its id and mailbox.
    pub(crate) fn register_channel(
        &self,
    ) -> BdevResult<(u64, mpsc::UnboundedReceiver<ChannelMsg>)> {
        let mut guard = self.inner.state.lock();
        guard.state.ensure_active()?;
        let channel_id = guard.next_channel_id;
        guard.next_channel_id += 1;
        let (tx, rx) = mpsc::unbounded();
        guard.channels.insert(channel_id, tx);
        Ok((channel_id, rx))
    }

    pub(crate) fn unregister_channel(&self, channel_id: u64) {
        self.inner.state.lock().channels.remove(&channel_id);
    }

    pub(crate) fn volume(&self) -> &Arc<dyn RemoteVolume> {
        &self.inner.volume
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("pool", &self.inner.pool)
            .field("image", &self.inner.image)
            .field("block_size", &self.inner.block_size)
            .field("block_count", &self.inner.block_count)
            .field("state", &self.state())
            .finish()
    }
}

async fn release_after_failed_create(volume: &dyn RemoteVolume, name: &str) {
    if let Err(err) = volume.close().await {
        warn!(device = name, error = %err, "close after failed create");
    }
}

/// Future driving a device deletion to completion.
#[must_use = "deletion only progresses while the task is polled"]
pub struct DeleteTask {
    device: String,
    inner: BoxFuture<'static, ()>,
    finished: bool,
}

impl DeleteTask {
    /// Whether the deletion has run to completion and `on_done` has been invoked.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Future for DeleteTask {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(());
        }
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.finished = true;
        }
        poll
    }
}

impl Drop for DeleteTask {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                device = %self.device,
                "delete task dropped before completion; device stays in deleting state"
            );
        }
    }
}

impl fmt::Debug for DeleteTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeleteTask")
            .field("device", &self.device)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BackendConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = BackendConfig {
            channel_capacity: 0,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.kind(), BdevErrorKind::InvalidConfig);
    }

    #[test]
    fn state_gate_maps_to_errors() {
        assert!(DeviceState::Active.ensure_active().is_ok());
        assert_eq!(
            DeviceState::Deleting.ensure_active().unwrap_err().kind(),
            BdevErrorKind::DeviceDeleting
        );
        assert_eq!(
            DeviceState::Deleted.ensure_active().unwrap_err().kind(),
            BdevErrorKind::DeviceNotFound
        );
        assert_eq!(
            DeviceState::Creating.ensure_active().unwrap_err().kind(),
            BdevErrorKind::DeviceNotFound
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(DeviceState::Deleting.to_string(), "deleting");
    }
}
