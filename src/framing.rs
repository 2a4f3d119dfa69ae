//! Wire protocol codec for broker IPC over Unix domain sockets.
//!
//! Length-prefixed frames:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! The payload is opaque at this layer — no type byte, no checksum. Message
//! semantics belong entirely to the payload bytes, which the broker forwards
//! untouched. The one structural exception (the bind handshake) is handled a
//! layer up in `broker::connection`.
//!
//! A zero-length frame is legal and decodes to an empty payload.

use anyhow::{bail, Result};

/// Maximum frame payload size (10 MB).
///
/// A declared length above this cap is a protocol violation: the decoder
/// fails from the 4-byte header alone, before any payload bytes have been
/// buffered, and the offending connection is torn down.
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Encode a payload into a wire-format byte vector.
///
/// Returns `[u32 LE length][payload]`. The length is written via
/// `to_le_bytes` — never by reinterpreting buffer memory — so the encoding
/// is identical on any host byte order.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
/// Handles TCP-style byte stream reassembly: frames split across reads,
/// multiple frames per read, or both.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete payloads.
    ///
    /// Returns decoded payloads in arrival order. Incomplete data is
    /// buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a declared frame length exceeds
    /// [`MAX_FRAME_SIZE`]. The caller must treat this as fatal to the
    /// connection — the decoder buffer is left unusable.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            // Need at least 4 bytes for the length header
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length > MAX_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            payloads.push(self.buf[4..total].to_vec());

            // Remove consumed bytes
            self.buf.drain(..total);
        }

        Ok(payloads)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let payload = b"hello broker".to_vec();
        let encoded = encode_frame(&payload);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&encoded).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], payload);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let encoded = encode_frame(b"abc");
        assert_eq!(&encoded[..4], &[3, 0, 0, 0]);
        assert_eq!(&encoded[4..], b"abc");
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let encoded = encode_frame(b"");
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&encoded).unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].is_empty());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_frame(b"first"));
        buf.extend_from_slice(&encode_frame(b""));
        buf.extend_from_slice(&encode_frame(b"third"));

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&buf).unwrap();
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0], b"first");
        assert_eq!(payloads[1], b"");
        assert_eq!(payloads[2], b"third");
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = encode_frame(b"split across reads");

        let mut decoder = FrameDecoder::new();

        // Feed first half
        let mid = encoded.len() / 2;
        let payloads = decoder.feed(&encoded[..mid]).unwrap();
        assert_eq!(payloads.len(), 0);
        assert!(decoder.has_partial());

        // Feed second half
        let payloads = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], b"split across reads");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = encode_frame(b"x");

        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let payloads = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert_eq!(payloads.len(), 0);
            } else {
                assert_eq!(payloads.len(), 1);
                assert_eq!(payloads[0], b"x");
            }
        }
    }

    #[test]
    fn test_incomplete_header_is_not_an_error() {
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&[0x01, 0x00]).unwrap();
        assert!(payloads.is_empty());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let length = MAX_FRAME_SIZE + 1;
        let buf = length.to_le_bytes();
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected_from_header_alone() {
        // Only the 4-byte header is fed — the decoder must fail without
        // waiting for (or buffering) any of the declared payload.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        buf.extend_from_slice(b"some bytes that must never be requested");

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf[..4]).is_err());
    }

    #[test]
    fn test_max_frame_size_is_accepted() {
        // Boundary: a declared length of exactly MAX_FRAME_SIZE is valid.
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&MAX_FRAME_SIZE.to_le_bytes()).unwrap();
        assert!(payloads.is_empty());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_large_payload() {
        let data = vec![0x42u8; 256 * 1024]; // 256KB
        let encoded = encode_frame(&data);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&encoded).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), data.len());
    }

    #[test]
    fn test_frame_followed_by_partial() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_frame(b"whole"));
        buf.extend_from_slice(&encode_frame(b"partial")[..6]);

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.feed(&buf).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0], b"whole");
        assert!(decoder.has_partial());
    }
}
