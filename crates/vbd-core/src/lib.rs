//! Block-device backend over a remote distributed-storage volume.
//!
//! A [`Backend`] creates named [`Device`]s on top of a [`VolumeClient`]. Every processing thread
//! opens its own [`IoChannel`], submits requests through it and drives completions by calling
//! [`IoChannel::poll`] from its event loop. Deleting a device waits for every channel to drain
//! before the remote volume is released.

mod buffer;
mod channel;
mod device;
mod error;
pub mod metrics;
mod registry;
mod request;
mod volume;

pub use buffer::SgList;
pub use channel::IoChannel;
pub use device::{
    BackendConfig, DeleteTask, Device, DeviceState, DEFAULT_CHANNEL_CAPACITY,
};
pub use error::{BdevError, BdevErrorKind, BdevResult};
pub use registry::Backend;
pub use request::{IoCallback, IoCompletion, IoKind, RequestId, MAX_READ_LEN};
pub use volume::{
    RemoteVolume, VolumeClient, VolumeCompletion, VolumeError, VolumeErrorKind, VolumeQueue,
    VolumeResult,
};
