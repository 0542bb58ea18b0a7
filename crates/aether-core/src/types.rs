//! Core protocol types for Aether
//!
//! Events are content-addressed: `event_id` is BLAKE3 over the canonical
//! byte layout in [`crate::canonical`]. The serde derives here exist for
//! storage encoding only; they are never the hashed representation.

use serde::{Deserialize, Serialize};

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

/// Maximum accepted content length (16 MiB).
pub const MAX_CONTENT_LEN: usize = 16 * 1024 * 1024;
/// Maximum byte length of a tag key.
pub const MAX_TAG_KEY_LEN: usize = 8;
/// Maximum number of values carried by a single tag.
pub const MAX_TAG_VALUES: usize = 16;
/// Maximum byte length of a single tag value.
pub const MAX_TAG_VALUE_LEN: usize = 1024;

/// Event identifier: BLAKE3(canonical_bytes(event))
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub Bytes32);

/// Ed25519 public key of an event publisher
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey(pub Bytes32);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Ed25519 signature over the event id.
///
/// Serde cannot derive for `[u8; 64]`, so the impls are written out; the
/// encoding is a plain byte string (postcard) or a number sequence (JSON).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sig(pub [u8; 64]);

impl std::fmt::Debug for Sig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sig({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Sig {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SigVisitor;

        impl<'de> serde::de::Visitor<'de> for SigVisitor {
            type Value = Sig;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("64 signature bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Sig, E> {
                let bytes: [u8; 64] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Sig(bytes))
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Sig, A::Error> {
                let mut bytes = [0u8; 64];
                for (i, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Sig(bytes))
            }
        }

        deserializer.deserialize_bytes(SigVisitor)
    }
}

/// A single event tag: a short key with an ordered list of values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub values: Vec<String>,
}

impl Tag {
    pub fn new(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

/// Storage class derived from the event kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindClass {
    /// 0..=999: stored indefinitely (subject to the configured TTL)
    Immutable,
    /// 10000..=19999: at most one live event per (pubkey, kind)
    Replaceable,
    /// 20000..=29999: fanned out only, never persisted
    Ephemeral,
    /// 30000..=39999: at most one live event per (pubkey, kind, d-value)
    ParameterizedReplaceable,
}

impl KindClass {
    /// Classify a kind, or `None` if it falls outside every storage class.
    pub fn of(kind: u16) -> Option<Self> {
        match kind {
            0..=999 => Some(Self::Immutable),
            10000..=19999 => Some(Self::Replaceable),
            20000..=29999 => Some(Self::Ephemeral),
            30000..=39999 => Some(Self::ParameterizedReplaceable),
            _ => None,
        }
    }

    pub fn is_persistent(self) -> bool {
        !matches!(self, Self::Ephemeral)
    }
}

/// The atomic unit moved by the relay: a signed, content-addressed record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub pubkey: Pubkey,
    /// Nanoseconds since the Unix epoch
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    /// Opaque payload bytes
    pub content: Vec<u8>,
    pub event_id: EventId,
    pub sig: Sig,
}

impl Event {
    pub fn class(&self) -> Option<KindClass> {
        KindClass::of(self.kind)
    }

    /// The first value of the first tag whose key is `"d"`, or the empty
    /// string when absent. Keys the parameterized-replaceable class.
    pub fn d_value(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.key == "d")
            .and_then(|t| t.values.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Every (key, value) pair the event carries, for tag-index lookups.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .flat_map(|t| t.values.iter().map(move |v| (t.key.as_str(), v.as_str())))
    }
}

/// Replaceable-conflict ordering: the greater `created_at` wins, ties
/// broken by the bytewise-greater `event_id`. Deterministic and
/// convergent under any receive order.
pub fn supersedes(new: &Event, old: &Event) -> bool {
    (new.created_at, &new.event_id.0) > (old.created_at, &old.event_id.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_event(kind: u16, created_at: u64, id_byte: u8) -> Event {
        Event {
            pubkey: Pubkey([0; 32]),
            created_at,
            kind,
            tags: vec![],
            content: vec![],
            event_id: EventId([id_byte; 32]),
            sig: Sig([0; 64]),
        }
    }

    #[test]
    fn kind_classification() {
        assert_eq!(KindClass::of(0), Some(KindClass::Immutable));
        assert_eq!(KindClass::of(999), Some(KindClass::Immutable));
        assert_eq!(KindClass::of(1000), None);
        assert_eq!(KindClass::of(9999), None);
        assert_eq!(KindClass::of(10000), Some(KindClass::Replaceable));
        assert_eq!(KindClass::of(19999), Some(KindClass::Replaceable));
        assert_eq!(KindClass::of(20000), Some(KindClass::Ephemeral));
        assert_eq!(KindClass::of(29999), Some(KindClass::Ephemeral));
        assert_eq!(KindClass::of(30000), Some(KindClass::ParameterizedReplaceable));
        assert_eq!(KindClass::of(39999), Some(KindClass::ParameterizedReplaceable));
        assert_eq!(KindClass::of(40000), None);
        assert_eq!(KindClass::of(u16::MAX), None);
    }

    #[test]
    fn d_value_takes_first_d_tag() {
        let mut event = bare_event(30000, 1, 1);
        assert_eq!(event.d_value(), "");

        event.tags = vec![
            Tag::new("p", vec!["x".into()]),
            Tag::new("d", vec!["alpha".into(), "beta".into()]),
            Tag::new("d", vec!["gamma".into()]),
        ];
        assert_eq!(event.d_value(), "alpha");
    }

    #[test]
    fn conflict_rule_prefers_created_at_then_id() {
        let older = bare_event(10001, 100, 0xAA);
        let newer = bare_event(10001, 200, 0x01);
        assert!(supersedes(&newer, &older));
        assert!(!supersedes(&older, &newer));

        // Same timestamp: bytewise-greater id wins.
        let low = bare_event(10001, 100, 0xAA);
        let high = bare_event(10001, 100, 0xBB);
        assert!(supersedes(&high, &low));
        assert!(!supersedes(&low, &high));
    }

    #[test]
    fn sig_roundtrips_through_serde() {
        let sig = Sig([7; 64]);
        let json = serde_json::to_string(&sig).unwrap();
        let back: Sig = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, back);
    }
}
