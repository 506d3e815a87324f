//! Checkpoint serialization using postcard
//!
//! The state bridge persists checkpoints as an opaque byte stream:
//!
//! ```text
//! [Magic: "VUSB"][Length: u32 (big-endian)][Checkpoint (postcard)][CRC32: u32 (big-endian)]
//! ```
//!
//! The CRC covers the postcard payload only. Maximum payload size is 1 MiB,
//! far above what a list of identity records ever needs.

use crate::integrity::compute_checksum;
use crate::{CURRENT_VERSION, Checkpoint, ProtocolVersion, error::ProtocolError, error::Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};

/// Stream magic
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"VUSB";

/// Maximum allowed payload size
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const HEADER_SIZE: usize = 8;
const TRAILER_SIZE: usize = 4;

/// Encode a checkpoint payload using postcard (no framing)
pub fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Vec<u8>> {
    postcard::to_allocvec(checkpoint).map_err(ProtocolError::from)
}

/// Decode a checkpoint payload using postcard (no framing)
pub fn decode_checkpoint(bytes: &[u8]) -> Result<Checkpoint> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate format version compatibility
///
/// Major versions must match; minor differences are readable both ways.
pub fn validate_version(version: &ProtocolVersion) -> Result<()> {
    if !CURRENT_VERSION.can_read(version) {
        return Err(ProtocolError::IncompatibleVersion {
            major: version.major,
            minor: version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Encode a checkpoint into a complete framed stream
///
/// # Example
/// ```
/// use protocol::{CURRENT_VERSION, Checkpoint, decode_framed, encode_framed};
///
/// let checkpoint = Checkpoint { version: CURRENT_VERSION, records: Vec::new() };
/// let framed = encode_framed(&checkpoint).unwrap();
/// assert_eq!(decode_framed(&framed).unwrap(), checkpoint);
/// ```
pub fn encode_framed(checkpoint: &Checkpoint) -> Result<Vec<u8>> {
    let payload = encode_checkpoint(checkpoint)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    frame.put_slice(&CHECKPOINT_MAGIC);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    frame.put_u32(compute_checksum(&payload));

    Ok(frame.to_vec())
}

/// Decode a framed checkpoint stream
///
/// Rejects bad magic, truncation, oversized frames, checksum mismatches and
/// incompatible format versions.
pub fn decode_framed(frame: &[u8]) -> Result<Checkpoint> {
    if frame.len() < HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE,
            actual: frame.len(),
        });
    }

    let mut buf = frame;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if magic != CHECKPOINT_MAGIC {
        return Err(ProtocolError::BadMagic { found: magic });
    }

    let length = buf.get_u32() as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    if buf.remaining() < length + TRAILER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE + length + TRAILER_SIZE,
            actual: frame.len(),
        });
    }

    let payload = &buf[..length];
    buf.advance(length);
    let expected = buf.get_u32();
    let computed = compute_checksum(payload);
    if expected != computed {
        return Err(ProtocolError::ChecksumMismatch { expected, computed });
    }

    let checkpoint = decode_checkpoint(payload)?;
    validate_version(&checkpoint.version)?;
    Ok(checkpoint)
}

/// Write a framed checkpoint to a writer (e.g. a save-state file)
pub fn write_framed<W: Write>(writer: &mut W, checkpoint: &Checkpoint) -> Result<()> {
    let framed = encode_framed(checkpoint)?;
    writer.write_all(&framed)?;
    Ok(())
}

/// Read one framed checkpoint from a reader
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Checkpoint> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + length + TRAILER_SIZE);
    frame.extend_from_slice(&header);
    frame.resize(HEADER_SIZE + length + TRAILER_SIZE, 0);
    reader.read_exact(&mut frame[HEADER_SIZE..])?;

    decode_framed(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceStateRecord, Uid};
    use std::io::Cursor;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            version: CURRENT_VERSION,
            records: vec![
                DeviceStateRecord {
                    uid: Uid(1),
                    vendor_id: 0x046d,
                    product_id: 0xc312,
                },
                DeviceStateRecord {
                    uid: Uid(2),
                    vendor_id: 0x1234,
                    product_id: 0x5678,
                },
            ],
        }
    }

    #[test]
    fn test_framed_layout() {
        let framed = encode_framed(&checkpoint()).unwrap();
        assert_eq!(&framed[..4], b"VUSB");
        let length = u32::from_be_bytes([framed[4], framed[5], framed[6], framed[7]]) as usize;
        assert_eq!(framed.len(), HEADER_SIZE + length + TRAILER_SIZE);
    }

    #[test]
    fn test_stream_roundtrip_through_reader() {
        let mut buffer = Vec::new();
        write_framed(&mut buffer, &checkpoint()).unwrap();
        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_framed(&mut cursor).unwrap(), checkpoint());
    }

    #[test]
    fn test_bad_magic() {
        let mut framed = encode_framed(&checkpoint()).unwrap();
        framed[0] = b'X';
        assert!(matches!(
            decode_framed(&framed),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_stream() {
        let framed = encode_framed(&checkpoint()).unwrap();
        assert!(matches!(
            decode_framed(&framed[..framed.len() - 2]),
            Err(ProtocolError::IncompleteFrame { .. })
        ));
        assert!(matches!(
            decode_framed(&framed[..3]),
            Err(ProtocolError::IncompleteFrame { expected: 8, actual: 3 })
        ));
    }

    #[test]
    fn test_corrupted_payload() {
        let mut framed = encode_framed(&checkpoint()).unwrap();
        framed[HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            decode_framed(&framed),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut framed = encode_framed(&checkpoint()).unwrap();
        framed[4..8].copy_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        assert!(matches!(
            decode_framed(&framed),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut old = checkpoint();
        old.version = ProtocolVersion {
            major: CURRENT_VERSION.major + 1,
            minor: 0,
            patch: 0,
        };
        let framed = encode_framed(&old).unwrap();
        assert!(matches!(
            decode_framed(&framed),
            Err(ProtocolError::IncompatibleVersion { .. })
        ));
    }
}
