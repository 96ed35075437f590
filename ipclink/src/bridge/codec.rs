//! Framed codec for envelope streams.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for the body.
//! A frame whose body is not a valid envelope is surfaced as a per-item
//! `DecodeError` so the stream survives; only I/O failures end it.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{DecodeError, EncodeError, Envelope};

/// Largest frame body either side sends or accepts by default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that frames envelopes with a 4-byte length prefix.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

/// Encoded size of `envelope`, or an error when it would not fit in one
/// frame. Oversized envelopes must be caught before they reach a writer,
/// where the codec error would end the connection.
pub fn check_frame_len(
    envelope: &Envelope,
    max_frame_length: usize,
) -> Result<usize, EncodeError> {
    let len = envelope.encode()?.len();
    if len > max_frame_length {
        return Err(EncodeError(format!(
            "encoded envelope is {len} bytes, frame limit is {max_frame_length}"
        )));
    }
    Ok(len)
}

impl Decoder for EnvelopeCodec {
    type Item = Result<Envelope, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                tracing::trace!(frame_size_bytes = bytes.len(), "Decoding frame");
                Ok(Some(Envelope::decode(&bytes)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = item
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(json, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlAction, Kind, Secret, Token};
    use tokio_util::bytes::{BufMut, Bytes};

    #[test]
    fn codec_roundtrip_request() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let mut data = serde_json::Map::new();
        data.insert("x".to_string(), serde_json::json!(1));
        let req = Envelope::request("echo", data, Token::generate(), &Secret::new("s"));
        codec.encode(req.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = EnvelopeCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Envelope::control(ControlAction::Ping, None), &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap().unwrap();
        assert_eq!(decoded.kind, Kind::Control);
    }

    #[test]
    fn oversized_envelope_is_rejected_before_encoding() {
        let mut data = serde_json::Map::new();
        data.insert("blob".to_string(), serde_json::json!("x".repeat(2048)));
        let req = Envelope::request("echo", data, Token::generate(), &Secret::new("s"));

        let err = check_frame_len(&req, 1024).unwrap_err();
        assert!(err.0.contains("frame limit is 1024"));
        assert!(check_frame_len(&req, 4096).unwrap() > 2048);

        let mut codec = EnvelopeCodec::with_max_frame_length(1024);
        assert!(codec.encode(req, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn malformed_frame_does_not_poison_stream() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();

        let garbage = Bytes::from_static(b"[\"not an envelope\"]");
        buf.put_u32(garbage.len() as u32);
        buf.put_slice(&garbage);
        codec
            .encode(Envelope::control(ControlAction::Pong, None), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.control_action(), Some(ControlAction::Pong));
    }
}
