//! Crate error type.
//!
//! All fallible operations in this crate return `Result<T> = Result<T,
//! StreamError>`. Errors are partitioned the way the engine's call sites
//! need them: programmer errors, capacity errors, transport errors, and
//! shutdown-race errors, plus the ambient logging/config wrapping variants.

use std::fmt;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by sender/receiver/pool/fifo operations.
#[derive(Debug)]
pub enum StreamError {
    /// Null/zero/out-of-range arguments, or reconfiguring a stopped instance.
    BadParameters(String),
    /// Allocation of a socket, thread, or pool entry failed.
    AllocFailed(String),
    /// `delete()` called while a thread flag still shows started.
    Busy,
    /// The FIFO (or a resender's FIFO) has no free slot.
    QueueFull,
    /// A submitted NAL exceeds what the pool/packetizer can ever carry.
    FrameTooLarge,
    /// Socket send/recv failure other than EAGAIN/timeout.
    Transport(String),
    /// Malformed wire packet (short header, truncated STAP-A tuple, ...).
    InvalidPacket(String),
    Io(std::io::Error),
    Logging(String),
    Config(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::BadParameters(msg) => write!(f, "bad parameters: {}", msg),
            StreamError::AllocFailed(msg) => write!(f, "allocation failed: {}", msg),
            StreamError::Busy => write!(f, "instance busy: stop() not completed"),
            StreamError::QueueFull => write!(f, "queue full"),
            StreamError::FrameTooLarge => write!(f, "frame too large"),
            StreamError::Transport(msg) => write!(f, "transport error: {}", msg),
            StreamError::InvalidPacket(msg) => write!(f, "invalid packet: {}", msg),
            StreamError::Io(e) => write!(f, "io error: {}", e),
            StreamError::Logging(msg) => write!(f, "logging error: {}", msg),
            StreamError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(err)
    }
}

impl From<logging::LoggingError> for StreamError {
    fn from(err: logging::LoggingError) -> Self {
        StreamError::Logging(err.to_string())
    }
}

impl From<config_loader::ConfigError> for StreamError {
    fn from(err: config_loader::ConfigError) -> Self {
        StreamError::Config(err.to_string())
    }
}

impl From<json_parser::JsonError> for StreamError {
    fn from(err: json_parser::JsonError) -> Self {
        StreamError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_bad_parameters() {
        let err = StreamError::BadParameters("port out of range".to_string());
        assert_eq!(err.to_string(), "bad parameters: port out of range");
    }

    #[test]
    fn test_error_display_queue_full() {
        assert_eq!(StreamError::QueueFull.to_string(), "queue full");
    }

    #[test]
    fn test_error_display_busy() {
        assert_eq!(
            StreamError::Busy.to_string(),
            "instance busy: stop() not completed"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: StreamError = io_err.into();
        assert!(matches!(err, StreamError::Io(_)));
    }

    #[test]
    fn test_error_is_error_trait() {
        let err = StreamError::FrameTooLarge;
        let _: &dyn std::error::Error = &err;
    }
}
