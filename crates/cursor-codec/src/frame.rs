//! ConnectRPC framing
//!
//! Each frame is `[flags: u8][length: u32 big-endian][payload: length bytes]`.
//! Flag bit 0x01 marks a gzip payload (0x02 is an alternate gzip marker some
//! deployments emit, so any bit under 0x03 is treated as "possibly
//! compressed"). Decompression failure falls back to the raw payload rather
//! than killing the stream — the fallback is counted so protocol corruption
//! is visible in metrics.

use std::io::{Read, Write};

use bytes::{Buf, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;

pub const FLAG_RAW: u8 = 0x00;
pub const FLAG_GZIP: u8 = 0x01;

/// Mask of flag bits that indicate a possibly compressed payload.
const GZIP_MASK: u8 = 0x03;

/// Frame header: flags byte plus 32-bit length.
const HEADER_LEN: usize = 5;

/// Encode one frame, optionally gzip-compressing the payload.
pub fn encode_frame(payload: &[u8], compress: bool) -> Vec<u8> {
    let (flags, body) = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        // Writing to a Vec cannot fail
        encoder.write_all(payload).expect("gzip write to Vec");
        let body = encoder.finish().expect("gzip finish to Vec");
        (FLAG_GZIP, body)
    } else {
        (FLAG_RAW, payload.to_vec())
    };

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(flags);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Incremental frame splitter over a chunked byte stream.
///
/// `push` buffers the chunk and drains every complete frame, returning the
/// decompressed payloads. An incomplete tail stays buffered for the next
/// chunk; a trailing partial frame at end of stream is silently tolerated.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes still buffered (an incomplete frame, or empty).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let flags = self.buf[0];
            let length =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if self.buf.len() < HEADER_LEN + length {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(length);
            payloads.push(decompress_payload(flags, &payload));
        }
        payloads
    }
}

/// Gunzip the payload when the flags say so, falling back to the raw bytes
/// when decompression fails.
fn decompress_payload(flags: u8, payload: &[u8]) -> Vec<u8> {
    if flags & GZIP_MASK == 0 {
        return payload.to_vec();
    }
    let mut decoder = GzDecoder::new(payload);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(e) => {
            warn!(flags, len = payload.len(), error = %e, "gzip decompression failed, using raw payload");
            metrics::counter!("cursor_gzip_fallback_total").increment(1);
            payload.to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_roundtrip() {
        let frame = encode_frame(b"hello", false);
        assert_eq!(frame[0], FLAG_RAW);
        assert_eq!(&frame[1..5], &5u32.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&frame);
        assert_eq!(payloads, vec![b"hello".to_vec()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn gzip_frame_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(10);
        let frame = encode_frame(&payload, true);
        assert_eq!(frame[0], FLAG_GZIP);
        // gzip should actually shrink a repetitive payload
        assert!(frame.len() < payload.len());

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&frame);
        assert_eq!(payloads, vec![payload]);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut buf = encode_frame(b"one", false);
        buf.extend(encode_frame(b"two", false));
        buf.extend(encode_frame(b"three", false));

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&buf);
        assert_eq!(
            payloads,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn frame_split_across_chunks() {
        let frame = encode_frame(b"split-me", false);
        let (head, tail) = frame.split_at(3);

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(head).is_empty());
        assert!(decoder.pending() > 0);
        let payloads = decoder.push(tail);
        assert_eq!(payloads, vec![b"split-me".to_vec()]);
    }

    #[test]
    fn incomplete_tail_is_tolerated() {
        let mut buf = encode_frame(b"complete", false);
        // Truncated second frame: header claims 100 bytes, only 4 provided
        buf.push(FLAG_RAW);
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"tail");

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&buf);
        assert_eq!(payloads, vec![b"complete".to_vec()]);
        // The partial frame stays pending, waiting for more bytes
        assert_eq!(decoder.pending(), HEADER_LEN + 4);
    }

    #[test]
    fn fewer_than_five_bytes_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&[0x00, 0x00, 0x00]).is_empty());
        assert_eq!(decoder.pending(), 3);
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw_payload() {
        // flags say gzip but the payload is not a gzip stream
        let mut frame = vec![FLAG_GZIP];
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(b"junk");

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&frame);
        assert_eq!(payloads, vec![b"junk".to_vec()]);
    }

    #[test]
    fn alternate_gzip_flag_is_decompressed() {
        let inner = encode_frame(b"alt-flagged", true);
        // Rewrite the flags byte to the alternate gzip marker 0x02
        let mut frame = inner.clone();
        frame[0] = 0x02;

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&frame);
        assert_eq!(payloads, vec![b"alt-flagged".to_vec()]);
    }

    #[test]
    fn empty_payload_frame() {
        let frame = encode_frame(b"", false);
        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&frame);
        assert_eq!(payloads, vec![Vec::<u8>::new()]);
    }
}
