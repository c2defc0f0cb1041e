use std::fmt;

/// Failure categories surfaced to the I/O framework.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BdevErrorKind {
    /// Block size is not a positive power of two, the volume is smaller than one block, or a
    /// name is missing or already taken.
    InvalidConfig,
    /// The collaborator could not open or authenticate the remote volume.
    VolumeOpenFailed,
    /// The device is gone.
    DeviceNotFound,
    /// The device is being torn down and accepts no new work.
    DeviceDeleting,
    /// `offset + length` runs past the end of the device.
    OutOfRange,
    /// Buffer descriptor length disagrees with the declared request length.
    InvalidArgument,
    /// The channel's in-flight table is full.
    ChannelBusy,
    /// The request was force-completed during channel teardown.
    Cancelled,
    /// The collaborator reported an I/O failure.
    RemoteIo,
}

/// Error surfaced by the device controller, channels and completions.
#[derive(Clone, Debug)]
pub struct BdevError {
    kind: BdevErrorKind,
    message: Option<String>,
    status: Option<i32>,
}

impl BdevError {
    pub const fn new(kind: BdevErrorKind) -> Self {
        Self {
            kind,
            message: None,
            status: None,
        }
    }

    pub fn with_message(kind: BdevErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            status: None,
        }
    }

    /// A collaborator failure carrying the raw status for diagnostics.
    pub fn remote(status: i32, message: impl Into<String>) -> Self {
        Self {
            kind: BdevErrorKind::RemoteIo,
            message: Some(message.into()),
            status: Some(status),
        }
    }

    pub fn kind(&self) -> BdevErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Raw collaborator status, present on [`BdevErrorKind::RemoteIo`] errors raised from a
    /// completion or a refused request.
    pub fn remote_status(&self) -> Option<i32> {
        self.status
    }
}

impl fmt::Display for BdevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.message(), self.status) {
            (Some(msg), Some(status)) => write!(f, "{:?}: {} (status {})", self.kind, msg, status),
            (Some(msg), None) => write!(f, "{:?}: {}", self.kind, msg),
            (None, Some(status)) => write!(f, "{:?} (status {})", self.kind, status),
            (None, None) => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for BdevError {}

pub type BdevResult<T> = core::result::Result<T, BdevError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = BdevError::with_message(BdevErrorKind::OutOfRange, "past end of device");
        assert_eq!(err.to_string(), "OutOfRange: past end of device");
        assert_eq!(err.remote_status(), None);
    }

    #[test]
    fn remote_error_carries_status() {
        let err = BdevError::remote(-5, "read failed");
        assert_eq!(err.kind(), BdevErrorKind::RemoteIo);
        assert_eq!(err.remote_status(), Some(-5));
        assert_eq!(err.to_string(), "RemoteIo: read failed (status -5)");
    }

    #[test]
    fn bare_kind_display() {
        assert_eq!(BdevError::new(BdevErrorKind::Cancelled).to_string(), "Cancelled");
    }
}
