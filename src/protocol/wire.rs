//! Wire framing for cross-boundary protocol messages
//!
//! Every message that crosses the process boundary travels in one frame:
//! magic bytes, a format version, the bincode payload, and a CRC32 trailer
//! over the payload. Decoding verifies all three before the payload is
//! touched. The framing layer itself never aborts — the session decides
//! which failures are fatal (magic/version skew on a live connection) and
//! which are ordinary errors.

use crate::checksum::crc32;
use crate::error::{Error, Result, WireErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes for protocol frames
pub const WIRE_MAGIC: &[u8; 4] = b"QJW\x01";

/// Wire format version. Bumped on any layout change; peers with different
/// versions must not exchange work items.
pub const WIRE_VERSION: u32 = 2;

/// Frame header: magic + version + payload length
const HEADER_LEN: usize = 4 + 4 + 4;
/// CRC32 trailer
const TRAILER_LEN: usize = 4;

/// Encode a value into a framed message
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|err| Error::Wire(WireErrorKind::Payload(err.to_string())))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.extend_from_slice(WIRE_MAGIC);
    frame.extend_from_slice(&WIRE_VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32(&payload).to_le_bytes());
    Ok(frame)
}

/// Decode a framed message, verifying magic, version, and checksum
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(Error::Wire(WireErrorKind::Truncated));
    }
    if &bytes[0..4] != WIRE_MAGIC {
        return Err(Error::Wire(WireErrorKind::BadMagic));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != WIRE_VERSION {
        return Err(Error::Wire(WireErrorKind::VersionMismatch {
            local: WIRE_VERSION,
            remote: version,
        }));
    }
    let payload_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    if bytes.len() != HEADER_LEN + payload_len + TRAILER_LEN {
        return Err(Error::Wire(WireErrorKind::Truncated));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + payload_len];
    let expected = u32::from_le_bytes(bytes[HEADER_LEN + payload_len..].try_into().unwrap());
    let actual = crc32(payload);
    if expected != actual {
        return Err(Error::Wire(WireErrorKind::ChecksumMismatch { expected, actual }));
    }

    bincode::deserialize(payload)
        .map_err(|err| Error::Wire(WireErrorKind::Payload(err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Message {
        id: u32,
        data: Vec<u8>,
    }

    #[test]
    fn test_frame_roundtrip() {
        let message = Message { id: 7, data: vec![1, 2, 3, 4] };
        let frame = encode_frame(&message).unwrap();
        let decoded: Message = decode_frame(&frame).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let message = Message { id: 1, data: vec![] };
        let mut frame = encode_frame(&message).unwrap();
        frame[0] = b'X';
        let result: Result<Message> = decode_frame(&frame);
        assert!(matches!(result, Err(Error::Wire(WireErrorKind::BadMagic))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let message = Message { id: 1, data: vec![] };
        let mut frame = encode_frame(&message).unwrap();
        frame[4..8].copy_from_slice(&(WIRE_VERSION + 1).to_le_bytes());
        let result: Result<Message> = decode_frame(&frame);
        assert!(matches!(
            result,
            Err(Error::Wire(WireErrorKind::VersionMismatch { remote, .. })) if remote == WIRE_VERSION + 1
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let message = Message { id: 1, data: vec![9, 9, 9, 9, 9, 9] };
        let mut frame = encode_frame(&message).unwrap();
        let payload_start = 12;
        frame[payload_start + 2] ^= 0xFF;
        let result: Result<Message> = decode_frame(&frame);
        assert!(matches!(
            result,
            Err(Error::Wire(WireErrorKind::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let message = Message { id: 1, data: vec![1, 2, 3] };
        let frame = encode_frame(&message).unwrap();
        let result: Result<Message> = decode_frame(&frame[..frame.len() - 2]);
        assert!(matches!(result, Err(Error::Wire(WireErrorKind::Truncated))));

        let result: Result<Message> = decode_frame(&frame[..6]);
        assert!(matches!(result, Err(Error::Wire(WireErrorKind::Truncated))));
    }
}
