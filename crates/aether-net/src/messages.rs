//! Typed protocol payloads
//!
//! One struct per envelope type, matching the wire contract exactly. In
//! JSON mode the tagged [`Message`] enum is the envelope itself; in
//! binary mode the tag byte is authoritative and the payload is the
//! JSON-encoded inner struct.

use crate::envelope::{CodecError, Envelope, FrameFormat, MsgType, RawFrame};
use aether_core::{EventWire, FilterWire};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NoiseOffer {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NoiseAccept {
    pub required: bool,
    pub pubkey: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub version: u32,
    pub formats: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseOffer>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    pub version: u32,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise: Option<NoiseAccept>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Publish {
    pub event: EventWire,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscribe {
    pub sub_id: String,
    pub filters: Vec<FilterWire>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Unsubscribe {
    pub sub_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventPush {
    pub sub_id: String,
    pub event: EventWire,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub event_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorMsg {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorMsg {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Some(message.into()),
        }
    }
}

/// NOISE wrapper: hex of `u64be(counter) || AEAD ciphertext`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NoisePayload {
    pub payload_hex: String,
}

/// Every message the native protocol can carry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Hello(Hello),
    Welcome(Welcome),
    Publish(Publish),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Event(EventPush),
    Ack(Ack),
    Error(ErrorMsg),
    Noise(NoisePayload),
}

impl Message {
    pub fn tag(&self) -> MsgType {
        match self {
            Self::Hello(_) => MsgType::Hello,
            Self::Welcome(_) => MsgType::Welcome,
            Self::Publish(_) => MsgType::Publish,
            Self::Subscribe(_) => MsgType::Subscribe,
            Self::Unsubscribe(_) => MsgType::Unsubscribe,
            Self::Event(_) => MsgType::Event,
            Self::Ack(_) => MsgType::Ack,
            Self::Error(_) => MsgType::Error,
            Self::Noise(_) => MsgType::Noise,
        }
    }

    /// Binary form: tag byte plus the JSON-encoded inner struct.
    pub fn to_envelope(&self) -> Result<Envelope, CodecError> {
        let payload = match self {
            Self::Hello(p) => serde_json::to_vec(p),
            Self::Welcome(p) => serde_json::to_vec(p),
            Self::Publish(p) => serde_json::to_vec(p),
            Self::Subscribe(p) => serde_json::to_vec(p),
            Self::Unsubscribe(p) => serde_json::to_vec(p),
            Self::Event(p) => serde_json::to_vec(p),
            Self::Ack(p) => serde_json::to_vec(p),
            Self::Error(p) => serde_json::to_vec(p),
            Self::Noise(p) => serde_json::to_vec(p),
        }
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Envelope::new(self.tag(), payload))
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self, CodecError> {
        fn parse<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, CodecError> {
            serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))
        }

        Ok(match env.tag {
            MsgType::Hello => Self::Hello(parse(&env.payload)?),
            MsgType::Welcome => Self::Welcome(parse(&env.payload)?),
            MsgType::Publish => Self::Publish(parse(&env.payload)?),
            MsgType::Subscribe => Self::Subscribe(parse(&env.payload)?),
            MsgType::Unsubscribe => Self::Unsubscribe(parse(&env.payload)?),
            MsgType::Event => Self::Event(parse(&env.payload)?),
            MsgType::Ack => Self::Ack(parse(&env.payload)?),
            MsgType::Error => Self::Error(parse(&env.payload)?),
            MsgType::Noise => Self::Noise(parse(&env.payload)?),
        })
    }

    /// JSON form: the tagged object itself.
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Encode for the negotiated format.
    pub fn encode(&self, format: FrameFormat) -> Result<RawFrame, CodecError> {
        Ok(match format {
            FrameFormat::Binary => RawFrame::Binary(self.to_envelope()?.encode_binary()),
            FrameFormat::Json => RawFrame::Text(self.to_json()?),
        })
    }

    /// Decode a raw frame by its shape: binary frames carry binary
    /// envelopes, text frames carry JSON envelopes.
    pub fn decode(raw: &RawFrame) -> Result<Self, CodecError> {
        match raw {
            RawFrame::Binary(bytes) => Self::from_envelope(&Envelope::decode_binary(bytes)?),
            RawFrame::Text(text) => Self::from_json(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Hello(Hello {
                version: 1,
                formats: vec!["binary".into(), "json".into()],
                noise: Some(NoiseOffer {
                    required: true,
                    pubkey: Some(hex::encode([7u8; 32])),
                }),
            }),
            Message::Welcome(Welcome {
                version: 1,
                format: "binary".into(),
                noise: None,
            }),
            Message::Subscribe(Subscribe {
                sub_id: "s1".into(),
                filters: vec![FilterWire::default()],
            }),
            Message::Unsubscribe(Unsubscribe { sub_id: "s1".into() }),
            Message::Ack(Ack {
                event_id: hex::encode([1u8; 32]),
                accepted: true,
                reason: Some("duplicate".into()),
            }),
            Message::Error(ErrorMsg::new("invalid_message", "bad frame")),
            Message::Noise(NoisePayload {
                payload_hex: "00".repeat(24),
            }),
        ]
    }

    #[test]
    fn roundtrip_both_formats() {
        for msg in sample_messages() {
            for format in [FrameFormat::Binary, FrameFormat::Json] {
                let raw = msg.encode(format).unwrap();
                let back = Message::decode(&raw).unwrap();
                assert_eq!(msg, back, "format {format:?}");
            }
        }
    }

    #[test]
    fn json_envelope_carries_type_field() {
        let msg = Message::Unsubscribe(Unsubscribe { sub_id: "x".into() });
        let json = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "unsubscribe");
        assert_eq!(value["sub_id"], "x");
    }

    #[test]
    fn binary_payload_stays_introspectable() {
        let msg = Message::Ack(Ack {
            event_id: "ab".into(),
            accepted: false,
            reason: Some("invalid_kind".into()),
        });
        let env = msg.to_envelope().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&env.payload).unwrap();
        assert_eq!(value["accepted"], false);
    }

    #[test]
    fn garbage_json_is_malformed() {
        assert!(Message::decode(&RawFrame::Text("{not json".into())).is_err());
        assert!(Message::decode(&RawFrame::Binary(vec![0, b'x'])).is_err());
    }
}
