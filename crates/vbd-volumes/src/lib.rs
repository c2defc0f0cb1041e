//! Volume clients for vbd devices.
//!
//! [`MemoryVolumeClient`] keeps images in memory and lets callers pause completions or inject
//! remote failures. [`DirectoryVolumeClient`] stores each image as a regular file under a root
//! directory.

mod file;
mod memory;

pub use file::DirectoryVolumeClient;
pub use memory::{MemoryVolume, MemoryVolumeClient};
