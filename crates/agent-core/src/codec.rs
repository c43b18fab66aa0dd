//! Frame delimiting over a byte transport (spec §3/§6): frames are JSON
//! objects separated by the ASCII record-separator byte `0x1E`. Empty slices
//! and the literal `{}` placeholder are skipped rather than treated as frames.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::frame::Frame;

const RECORD_SEPARATOR: u8 = 0x1E;

/// A [`tokio_util::codec::Decoder`]/[`Encoder`] pair that splits a byte
/// stream into [`Frame`]s on `0x1E`, mirroring the SignalR hub-protocol
/// record separator framing (spec §3, §6).
#[derive(Debug, Default)]
pub struct RecordSeparatorCodec;

impl RecordSeparatorCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for RecordSeparatorCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == RECORD_SEPARATOR) else {
                return Ok(None);
            };

            let chunk = src.split_to(pos);
            src.advance(1); // drop the separator itself

            if chunk.is_empty() || chunk.as_ref() == b"{}" {
                continue;
            }

            let frame: Frame = serde_json::from_slice(&chunk)?;
            return Ok(Some(frame));
        }
    }
}

impl Encoder<&Frame> for RecordSeparatorCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item)?;
        dst.extend_from_slice(&json);
        dst.extend_from_slice(&[RECORD_SEPARATOR]);
        Ok(())
    }
}

/// Encodes the literal version-handshake frame, which is not itself valid
/// JSON-Frame content and so bypasses [`RecordSeparatorCodec::encode`].
pub fn encode_handshake(dst: &mut BytesMut) {
    dst.extend_from_slice(crate::frame::VERSION_HANDSHAKE.as_bytes());
    dst.extend_from_slice(&[RECORD_SEPARATOR]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PingFrame};

    #[test]
    fn decodes_single_frame() {
        let mut codec = RecordSeparatorCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"type":6}"#);
        buf.extend_from_slice(&[RECORD_SEPARATOR]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Ping(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn skips_empty_and_placeholder_chunks() {
        let mut codec = RecordSeparatorCodec::new();
        let mut buf = BytesMut::new();
        // Empty chunk, then a literal `{}` keepalive, then a real Ping frame.
        buf.extend_from_slice(&[RECORD_SEPARATOR]);
        buf.extend_from_slice(b"{}");
        buf.extend_from_slice(&[RECORD_SEPARATOR]);
        buf.extend_from_slice(br#"{"type":6}"#);
        buf.extend_from_slice(&[RECORD_SEPARATOR]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Ping(_)));
    }

    #[test]
    fn returns_none_when_no_separator_yet() {
        let mut codec = RecordSeparatorCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(br#"{"type":6}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut codec = RecordSeparatorCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::Ping(PingFrame::new());
        codec.encode(&frame, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Frame::Ping(_)));
    }
}
