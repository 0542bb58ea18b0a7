//! Ingress wire forms and normalization
//!
//! Every gateway deserializes into these types and converts to the
//! domain model exactly once, so later stages see a single normalized
//! shape. Normalization covers the `id` / `event_id` alias, hex fields,
//! numbers supplied as strings, and content given as text or bytes.

use crate::error::Reject;
use crate::types::{Event, EventId, Pubkey, Sig, Tag};
use serde::{Deserialize, Deserializer, Serialize};

/// Accepts a JSON number or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum U64Flex {
    Num(u64),
    Str(String),
}

impl U64Flex {
    fn value<E: serde::de::Error>(&self) -> Result<u64, E> {
        match self {
            Self::Num(n) => Ok(*n),
            Self::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("not an unsigned integer: {s:?}"))),
        }
    }
}

pub(crate) fn de_u64_flex<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    U64Flex::deserialize(d)?.value()
}

pub(crate) fn de_u16_flex<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
    let n = de_u64_flex(d)?;
    u16::try_from(n).map_err(|_| serde::de::Error::custom(format!("{n} exceeds u16")))
}

pub(crate) fn de_opt_u64_flex<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    match Option::<U64Flex>::deserialize(d)? {
        Some(v) => v.value().map(Some),
        None => Ok(None),
    }
}

pub(crate) fn de_opt_usize_flex<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<usize>, D::Error> {
    Ok(de_opt_u64_flex(d)?.map(|n| n as usize))
}

pub(crate) fn de_opt_kinds_flex<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<Vec<u16>>, D::Error> {
    match Option::<Vec<U64Flex>>::deserialize(d)? {
        Some(raw) => raw
            .iter()
            .map(|v| {
                let n = v.value::<D::Error>()?;
                u16::try_from(n)
                    .map_err(|_| serde::de::Error::custom(format!("kind {n} exceeds u16")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        None => Ok(None),
    }
}

/// Content arrives either as a UTF-8 string or as raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ContentWire {
    Text(String),
    Bytes(Vec<u8>),
}

impl ContentWire {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.into_bytes(),
            Self::Bytes(b) => b,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(s) => Self::Text(s.to_owned()),
            Err(_) => Self::Bytes(bytes.to_vec()),
        }
    }
}

impl Default for ContentWire {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// The event as it appears on every wire surface: hex-encoded binary
/// fields, tags as `[key, values...]` arrays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventWire {
    #[serde(alias = "id")]
    pub event_id: String,
    pub pubkey: String,
    #[serde(deserialize_with = "de_u16_flex")]
    pub kind: u16,
    #[serde(deserialize_with = "de_u64_flex")]
    pub created_at: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: ContentWire,
    pub sig: String,
}

fn hex32(field: &str, s: &str) -> Result<[u8; 32], Reject> {
    let bytes = hex::decode(s)
        .map_err(|_| Reject::InvalidEvent(format!("{field} is not valid hex")))?;
    bytes
        .try_into()
        .map_err(|_| Reject::InvalidEvent(format!("{field} must be 32 bytes")))
}

fn hex64(field: &str, s: &str) -> Result<[u8; 64], Reject> {
    let bytes = hex::decode(s)
        .map_err(|_| Reject::InvalidEvent(format!("{field} is not valid hex")))?;
    bytes
        .try_into()
        .map_err(|_| Reject::InvalidEvent(format!("{field} must be 64 bytes")))
}

impl EventWire {
    /// Decode hex fields and tag arrays into the domain event.
    pub fn into_event(self) -> Result<Event, Reject> {
        let event_id = EventId(hex32("event_id", &self.event_id)?);
        let pubkey = Pubkey(hex32("pubkey", &self.pubkey)?);
        let sig = Sig(hex64("sig", &self.sig)?);

        let mut tags = Vec::with_capacity(self.tags.len());
        for entry in self.tags {
            let mut it = entry.into_iter();
            let key = it
                .next()
                .ok_or_else(|| Reject::InvalidEvent("empty tag entry".into()))?;
            tags.push(Tag::new(key, it.collect()));
        }

        Ok(Event {
            pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags,
            content: self.content.into_bytes(),
            event_id,
            sig,
        })
    }

    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: hex::encode(event.event_id.0),
            pubkey: hex::encode(event.pubkey.0),
            kind: event.kind,
            created_at: event.created_at,
            tags: event
                .tags
                .iter()
                .map(|t| {
                    std::iter::once(t.key.clone())
                        .chain(t.values.iter().cloned())
                        .collect()
                })
                .collect(),
            content: ContentWire::from_bytes(&event.content),
            sig: hex::encode(event.sig.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn accepts_id_alias_and_numeric_strings() {
        let json = r#"{
            "id": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "pubkey": "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "kind": "10001",
            "created_at": "42",
            "tags": [["d", "x"]],
            "content": "hi",
            "sig": "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc"
        }"#;

        let wire: EventWire = serde_json::from_str(json).unwrap();
        assert_eq!(wire.kind, 10001);
        assert_eq!(wire.created_at, 42);

        let event = wire.into_event().unwrap();
        assert_eq!(event.event_id, EventId([0xAA; 32]));
        assert_eq!(event.pubkey, Pubkey([0xBB; 32]));
        assert_eq!(event.tags, vec![Tag::new("d", vec!["x".into()])]);
        assert_eq!(event.content, b"hi");
    }

    #[test]
    fn rejects_bad_hex() {
        let wire = EventWire {
            event_id: "zz".into(),
            pubkey: hex::encode([0u8; 32]),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: ContentWire::Text(String::new()),
            sig: hex::encode([0u8; 64]),
        };
        assert!(matches!(wire.into_event(), Err(Reject::InvalidEvent(_))));
    }

    #[test]
    fn roundtrips_signed_events() {
        let kp = KeyPair::from_seed(&[5; 32]);
        let event = kp.sign_event(
            7,
            30000,
            vec![Tag::new("d", vec!["slot".into()])],
            b"payload".to_vec(),
        );

        let wire = EventWire::from_event(&event);
        let back = wire.into_event().unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn non_utf8_content_survives_as_bytes() {
        let content = vec![0xFF, 0xFE, 0x00];
        let wire = ContentWire::from_bytes(&content);
        assert!(matches!(wire, ContentWire::Bytes(_)));
        assert_eq!(wire.into_bytes(), content);
    }
}
