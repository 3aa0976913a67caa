//! Framed codec for the worker byte channel.
//!
//! The two directions are asymmetric. Worker output is framed: a 4-byte
//! little-endian length prefix followed by that many payload bytes. Worker
//! input is raw newline-terminated UTF-8 with no framing at all, so the
//! encoder is a plain passthrough. Works over any AsyncRead/AsyncWrite.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame payload. Generous, because one frame can
/// carry a whole scene's vertex buffers.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// Decoder for worker output frames, yielding each payload as [`Bytes`].
///
/// Wraps LengthDelimitedCodec, which buffers partial input internally: a
/// frame fed one byte at a time decodes exactly once, when its last byte
/// arrives.
pub struct FrameDecoder {
    inner: LengthDelimitedCodec,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .little_endian()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(payload) => {
                tracing::trace!(payload_bytes = payload.len(), "Decoded frame");
                Ok(Some(payload.freeze()))
            }
            None => Ok(None),
        }
    }
}

/// Encoder for requests going down to the worker: bytes pass through
/// verbatim, no length prefix.
pub struct RequestEncoder;

impl Encoder<Bytes> for RequestEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut framed = (payload.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(payload);
        framed
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut codec = FrameDecoder::new();
        let mut buf = BytesMut::from(&frame(b"{\"ok\":true}\n")[..]);

        let payload = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"{\"ok\":true}\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_identically_from_one_byte_chunks() {
        let payloads: [&[u8]; 3] = [b"meta\n\x00\x01\xff", b"", b"second frame"];
        let mut stream = Vec::new();
        for payload in payloads {
            stream.extend_from_slice(&frame(payload));
        }

        let mut codec = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream {
            buf.extend_from_slice(&[byte]);
            while let Some(payload) = codec.decode(&mut buf).unwrap() {
                decoded.push(payload);
            }
        }

        assert_eq!(decoded.len(), payloads.len());
        for (got, want) in decoded.iter().zip(payloads) {
            assert_eq!(&got[..], want);
        }
    }

    #[test]
    fn decodes_multiple_frames_from_one_buffer() {
        let mut stream = frame(b"first");
        stream.extend_from_slice(&frame(b"second"));
        let mut buf = BytesMut::from(&stream[..]);

        let mut codec = FrameDecoder::new();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_prefix_yields_nothing() {
        let mut codec = FrameDecoder::new();
        let mut buf = BytesMut::from(&[5u8, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(b"hello");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"hello");
    }

    #[test]
    fn oversized_length_prefix_is_an_error() {
        let mut codec = FrameDecoder::new();
        let mut buf = BytesMut::from(&(u32::MAX).to_le_bytes()[..]);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encoder_writes_requests_unframed() {
        let mut codec = RequestEncoder;
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from_static(b"<g/>\n"), &mut buf).unwrap();
        codec
            .encode(Bytes::from_static(b"{\"command\":\"x\"}\n"), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"<g/>\n{\"command\":\"x\"}\n");
    }
}
