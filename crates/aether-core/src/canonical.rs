//! Canonical event serialization
//!
//! The byte layout hashed to produce `event_id`. All integers are
//! big-endian. Every ingress surface must hash exactly these bytes, so
//! the layout here is normative:
//!
//! ```text
//! pubkey(32) || u64(created_at) || u16(kind) || tags_blob || content
//! tags_blob = u16(tag_count)
//!             for each tag { u8(key_len) || key
//!                            u16(value_count)
//!                            for each value { u16(value_len) || value } }
//! ```

use crate::types::{EventId, Event, Pubkey, Tag};

/// Serialize the canonical fields to the normative byte layout.
pub fn canonical_bytes(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(44 + content.len() + tags.len() * 16);
    out.extend_from_slice(&pubkey.0);
    out.extend_from_slice(&created_at.to_be_bytes());
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(tags.len() as u16).to_be_bytes());
    for tag in tags {
        out.push(tag.key.len() as u8);
        out.extend_from_slice(tag.key.as_bytes());
        out.extend_from_slice(&(tag.values.len() as u16).to_be_bytes());
        for value in &tag.values {
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }
    }
    out.extend_from_slice(content);
    out
}

/// Compute the event id for a set of canonical fields.
pub fn compute_event_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: u16,
    tags: &[Tag],
    content: &[u8],
) -> EventId {
    let bytes = canonical_bytes(pubkey, created_at, kind, tags, content);
    EventId(*blake3::hash(&bytes).as_bytes())
}

/// Recompute the id an event's canonical fields hash to.
pub fn event_id_of(event: &Event) -> EventId {
    compute_event_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )
}

/// Count of leading zero bits in an event id (proof-of-work difficulty).
pub fn pow_bits(id: &EventId) -> u32 {
    let mut bits = 0;
    for byte in id.0 {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tag;

    #[test]
    fn layout_of_bare_event() {
        let pubkey = Pubkey([0xAB; 32]);
        let bytes = canonical_bytes(&pubkey, 1, 7, &[], b"");

        // 32 pubkey + 8 created_at + 2 kind + 2 tag_count
        assert_eq!(bytes.len(), 44);
        assert_eq!(&bytes[..32], &[0xAB; 32]);
        assert_eq!(&bytes[32..40], &1u64.to_be_bytes());
        assert_eq!(&bytes[40..42], &7u16.to_be_bytes());
        assert_eq!(&bytes[42..44], &0u16.to_be_bytes());
    }

    #[test]
    fn layout_of_tags_blob() {
        let pubkey = Pubkey([0; 32]);
        let tags = vec![Tag::new("d", vec!["x".into()])];
        let bytes = canonical_bytes(&pubkey, 0, 0, &tags, b"hi");

        let blob = &bytes[42..];
        // tag_count=1, key_len=1, 'd', value_count=1, value_len=1, 'x', content
        assert_eq!(blob, &[0, 1, 1, b'd', 0, 1, 0, 1, b'x', b'h', b'i']);
    }

    #[test]
    fn id_is_deterministic() {
        let pubkey = Pubkey([1; 32]);
        let tags = vec![Tag::new("c", vec!["vision".into(), "audio".into()])];
        let a = compute_event_id(&pubkey, 42, 10001, &tags, b"payload");
        let b = compute_event_id(&pubkey, 42, 10001, &tags, b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn id_distinguishes_every_canonical_field() {
        let pubkey = Pubkey([1; 32]);
        let base = compute_event_id(&pubkey, 1, 1, &[], b"hello");

        assert_ne!(base, compute_event_id(&Pubkey([2; 32]), 1, 1, &[], b"hello"));
        assert_ne!(base, compute_event_id(&pubkey, 2, 1, &[], b"hello"));
        assert_ne!(base, compute_event_id(&pubkey, 1, 2, &[], b"hello"));
        assert_ne!(
            base,
            compute_event_id(&pubkey, 1, 1, &[Tag::new("d", vec![])], b"hello")
        );
        assert_ne!(base, compute_event_id(&pubkey, 1, 1, &[], b"hellO"));
    }

    #[test]
    fn tag_boundaries_do_not_collide() {
        // ("ab", ["c"]) and ("a", ["bc"]) must hash differently because
        // the layout length-prefixes keys and values.
        let pubkey = Pubkey([0; 32]);
        let a = compute_event_id(&pubkey, 0, 0, &[Tag::new("ab", vec!["c".into()])], b"");
        let b = compute_event_id(&pubkey, 0, 0, &[Tag::new("a", vec!["bc".into()])], b"");
        assert_ne!(a, b);
    }

    #[test]
    fn pow_bit_counting() {
        assert_eq!(pow_bits(&EventId([0xFF; 32])), 0);
        let mut id = [0u8; 32];
        id[0] = 0x80;
        assert_eq!(pow_bits(&EventId(id)), 0);
        id[0] = 0x01;
        assert_eq!(pow_bits(&EventId(id)), 7);
        id[0] = 0x00;
        id[1] = 0x40;
        assert_eq!(pow_bits(&EventId(id)), 9);
        assert_eq!(pow_bits(&EventId([0; 32])), 256);
    }
}
