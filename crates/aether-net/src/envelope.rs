//! Envelope encoding and stream framing
//!
//! Two negotiated formats carry the same typed payloads: a compact
//! binary envelope (u8 type tag followed by the JSON-encoded inner
//! object, which stays introspectable) and a plain JSON envelope whose
//! `type` field is the tag. Stream transports add a 4-byte big-endian
//! length prefix in front of each envelope.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum envelope size. Content is capped at 16 MiB; hex and JSON
/// expansion need headroom on top of that.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Envelope type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0,
    Welcome = 1,
    Publish = 10,
    Subscribe = 11,
    Unsubscribe = 12,
    Event = 13,
    Ack = 14,
    Error = 15,
    Noise = 20,
}

impl TryFrom<u8> for MsgType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Hello),
            1 => Ok(Self::Welcome),
            10 => Ok(Self::Publish),
            11 => Ok(Self::Subscribe),
            12 => Ok(Self::Unsubscribe),
            13 => Ok(Self::Event),
            14 => Ok(Self::Ack),
            15 => Ok(Self::Error),
            20 => Ok(Self::Noise),
            _ => Err(CodecError::Malformed(format!("unknown type tag: {value}"))),
        }
    }
}

/// Frame formats negotiated at handshake. Binary is preferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Binary,
    Json,
}

impl FrameFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(Self::Binary),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// A decoded envelope: type tag plus the JSON-encoded inner payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub tag: MsgType,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(tag: MsgType, payload: Vec<u8>) -> Self {
        Self { tag, payload }
    }

    /// Encode to the binary envelope form: tag byte followed by payload.
    pub fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.tag as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a binary envelope.
    pub fn decode_binary(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(bytes.len()));
        }
        let (&tag_byte, payload) = bytes
            .split_first()
            .ok_or_else(|| CodecError::Malformed("empty frame".into()))?;
        Ok(Self {
            tag: MsgType::try_from(tag_byte)?,
            payload: payload.to_vec(),
        })
    }
}

/// One frame as read from or written to a transport, before envelope
/// decoding. WebSocket message boundaries map onto this directly; stream
/// transports go through [`FrameCodec`] first.
#[derive(Clone, Debug)]
pub enum RawFrame {
    Binary(Vec<u8>),
    Text(String),
}

/// Length-prefixed framing for stream transports.
///
/// Wire format: 4-byte big-endian length, then the envelope bytes.
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).to_vec()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(item.len()));
        }
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_envelope_roundtrip() {
        let env = Envelope::new(MsgType::Publish, b"{\"x\":1}".to_vec());
        let bytes = env.encode_binary();

        let decoded = Envelope::decode_binary(&bytes).unwrap();
        assert_eq!(decoded.tag, MsgType::Publish);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        assert!(matches!(
            Envelope::decode_binary(&[0x7F, b'{', b'}']),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode_binary(&[]),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn stream_framing_roundtrip() {
        let mut codec = FrameCodec::new();
        let env = Envelope::new(MsgType::Hello, b"{}".to_vec());

        let mut buf = BytesMut::new();
        codec.encode(env.encode_binary(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &3u32.to_be_bytes());

        let bytes = codec.decode(&mut buf).unwrap().unwrap();
        let decoded = Envelope::decode_binary(&bytes).unwrap();
        assert_eq!(decoded.tag, MsgType::Hello);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(vec![1, 2, 3, 4, 5], &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_slice(&[0; 16]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::TooLarge(_))));
    }
}
