//! Protocol error types

use thiserror::Error;

/// Descriptor, layout and checkpoint errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error from postcard
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Checkpoint written by an incompatible format version
    #[error(
        "Incompatible checkpoint version: {major}.{minor} (expected {expected_major}.{expected_minor})"
    )]
    IncompatibleVersion {
        major: u8,
        minor: u8,
        expected_major: u8,
        expected_minor: u8,
    },

    /// Stream does not start with the checkpoint magic
    #[error("Bad checkpoint magic: {found:02x?}")]
    BadMagic { found: [u8; 4] },

    /// Checkpoint payload does not match its trailing checksum
    #[error("Checkpoint checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// A descriptor block of an unexpected type was found
    #[error("Unexpected descriptor type {actual:#04x} (expected {expected:#04x})")]
    UnexpectedDescriptor { expected: u8, actual: u8 },

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// I/O error while writing or reading a stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::IncompatibleVersion {
            major: 2,
            minor: 0,
            expected_major: 1,
            expected_minor: 0,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Incompatible checkpoint version"));
        assert!(msg.contains("2.0"));
        assert!(msg.contains("1.0"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = ProtocolError::ChecksumMismatch {
            expected: 0xdeadbeef,
            computed: 0x1,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0x00000001"));
    }

    #[test]
    fn test_unexpected_descriptor_display() {
        let err = ProtocolError::UnexpectedDescriptor {
            expected: 0x02,
            actual: 0x05,
        };
        assert_eq!(
            format!("{}", err),
            "Unexpected descriptor type 0x05 (expected 0x02)"
        );
    }
}
