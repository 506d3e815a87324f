//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    /// The host backend could not be initialized; scanning stays disabled
    #[error("USB backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_conversion() {
        let err: Error = protocol::ProtocolError::BufferTooSmall {
            needed: 20,
            available: 4,
        }
        .into();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("needed 20"));
    }

    #[test]
    fn test_backend_unavailable_display() {
        let err = Error::BackendUnavailable("libusb init failed".to_string());
        assert_eq!(err.to_string(), "USB backend unavailable: libusb init failed");
    }
}
