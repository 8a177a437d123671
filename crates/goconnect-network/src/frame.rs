//! Stream framing
//!
//! Packets ride the encrypted bidirectional stream as
//! `length:u16be || bytes`. The length covers the payload only and must be
//! in `[1, 65535]`; a payload is delivered whole or not at all.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Maximum payload carried by one frame.
pub const MAX_FRAME_BYTES: usize = u16::MAX as usize;

/// Length prefix size in bytes.
pub const FRAME_HEADER_BYTES: usize = 2;

/// Encode one payload as a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> NetworkResult<Bytes> {
    if payload.is_empty() || payload.len() > MAX_FRAME_BYTES {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }
    let mut out = BytesMut::with_capacity(FRAME_HEADER_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Incremental decoder over an in-order byte stream.
///
/// Stream transports deliver arbitrary chunk boundaries, so the decoder
/// buffers until a whole frame is available.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame payload, if any.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < FRAME_HEADER_BYTES {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < FRAME_HEADER_BYTES + len {
            return None;
        }
        self.buf.advance(FRAME_HEADER_BYTES);
        Some(self.buf.split_to(len).freeze())
    }

    /// Bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for payload in [&b"x"[..], &b"hello"[..], &[0u8; MAX_FRAME_BYTES][..]] {
            let frame = encode_frame(payload).unwrap();
            let mut dec = FrameDecoder::new();
            dec.push(&frame);
            assert_eq!(dec.next_frame().unwrap().as_ref(), payload);
            assert_eq!(dec.pending(), 0);
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            encode_frame(&big),
            Err(NetworkError::FrameTooLarge(n)) if n == MAX_FRAME_BYTES + 1
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            encode_frame(b""),
            Err(NetworkError::FrameTooLarge(0))
        ));
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let frame = encode_frame(b"fragmented").unwrap();
        let mut dec = FrameDecoder::new();

        dec.push(&frame[..1]);
        assert!(dec.next_frame().is_none());
        dec.push(&frame[1..5]);
        assert!(dec.next_frame().is_none());
        dec.push(&frame[5..]);
        assert_eq!(dec.next_frame().unwrap().as_ref(), b"fragmented");
    }

    #[test]
    fn test_decoder_handles_coalesced_frames() {
        let mut joined = Vec::new();
        joined.extend_from_slice(&encode_frame(b"one").unwrap());
        joined.extend_from_slice(&encode_frame(b"two").unwrap());

        let mut dec = FrameDecoder::new();
        dec.push(&joined);
        assert_eq!(dec.next_frame().unwrap().as_ref(), b"one");
        assert_eq!(dec.next_frame().unwrap().as_ref(), b"two");
        assert!(dec.next_frame().is_none());
    }
}
