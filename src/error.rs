use std::fmt::Display;
use std::io;

/// A specialized error type for channel operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Runtime plumbing failed (thread spawn, shutdown races).
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ChannelError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a runtime error from a displayable value.
    pub fn runtime<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Runtime(msg.to_string())
    }
}

/// A Result type alias for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Extract the errno to latch into the channel for an I/O failure.
///
/// Errors without an OS code (synthetic errors from the I/O layer) collapse
/// to `EIO` so the consumer always receives a real errno.
pub fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = ChannelError::invalid_config("bad buffer dir");
        assert!(matches!(err, ChannelError::InvalidConfig(msg) if msg == "bad buffer dir"));
    }

    #[test]
    fn errno_extraction() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(errno_of(&err), libc::ENOSPC);
        let synthetic = io::Error::new(io::ErrorKind::Other, "no os code");
        assert_eq!(errno_of(&synthetic), libc::EIO);
    }
}
