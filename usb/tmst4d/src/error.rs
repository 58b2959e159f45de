use std::result;

use syscall::error::{
    Error as SysError, E2BIG, EAGAIN, EBUSY, EFAULT, EINVAL, EIO, ENODEV, ENOMEM, ENOSYS, EPIPE,
    EPROTO, ETIMEDOUT, EOVERFLOW,
};
use thiserror::Error;

pub type Result<T, E = Error> = result::Result<T, E>;

/// A failure reported by the USB transport, passed through unchanged.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Error)]
pub enum TransportError {
    #[error("endpoint stalled")]
    Stalled,

    #[error("transfer timed out")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("babble/overflow on endpoint")]
    Overflow,

    #[error("i/o error (errno {0})")]
    Io(i32),
}

impl TransportError {
    /// The errno-style code latched as the session error status. Never zero.
    pub fn code(&self) -> i32 {
        match self {
            Self::Stalled => EPIPE,
            Self::Timeout => ETIMEDOUT,
            Self::Disconnected => ENODEV,
            Self::Overflow => EOVERFLOW,
            Self::Io(0) => EIO,
            Self::Io(errno) => *errno,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("out of DMA memory or transfer slots")]
    ResourceExhausted,

    #[error("operation not allowed in the current session state")]
    Busy,

    #[error("payload too large ({len} > {max})")]
    TooLarge { len: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("bad address")]
    Fault,

    #[error("buffer already mapped")]
    AlreadyMapped,

    #[error("unsupported command code {0}")]
    NotSupported(u32),

    #[error("device busy, try again")]
    RetryLater,

    #[error("device has been removed")]
    DeviceGone,

    #[error("unsupported device {vendor:04x}:{product:04x}")]
    UnsupportedDevice { vendor: u16, product: u16 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

impl Error {
    pub fn errno(&self) -> i32 {
        match self {
            Self::ResourceExhausted => ENOMEM,
            Self::Busy => EBUSY,
            Self::TooLarge { .. } => E2BIG,
            Self::Transport(err) => err.code(),
            Self::Fault | Self::AlreadyMapped => EFAULT,
            Self::NotSupported(_) => ENOSYS,
            Self::RetryLater => EAGAIN,
            Self::DeviceGone | Self::UnsupportedDevice { .. } => ENODEV,
            Self::InvalidArgument(_) => EINVAL,
            Self::Protocol(_) => EPROTO,
        }
    }
}

impl From<Error> for SysError {
    fn from(err: Error) -> Self {
        SysError::new(err.errno())
    }
}
