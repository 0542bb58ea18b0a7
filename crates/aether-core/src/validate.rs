//! Inbound event validation
//!
//! Checks run in a fixed order: structure, canonical hash, signature,
//! kind range, timestamp skew, proof-of-work. Hash comparison goes
//! through `blake3::Hash`, whose equality is constant-time.

use crate::canonical::{canonical_bytes, pow_bits};
use crate::crypto::verify_event_sig;
use crate::error::Reject;
use crate::types::{
    Event, KindClass, MAX_CONTENT_LEN, MAX_TAG_KEY_LEN, MAX_TAG_VALUES, MAX_TAG_VALUE_LEN,
};

/// Validator policy knobs, fixed at startup.
#[derive(Clone, Debug)]
pub struct ValidatorConfig {
    /// Maximum tolerated future clock skew in seconds
    pub max_future_skew_secs: u64,
    /// Minimum leading-zero-bit difficulty of the event id (0 disables)
    pub min_pow_bits: u32,
    /// Maximum accepted content length in bytes
    pub max_content_len: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: 60,
            min_pow_bits: 0,
            max_content_len: MAX_CONTENT_LEN,
        }
    }
}

pub struct Validator {
    cfg: ValidatorConfig,
}

impl Validator {
    pub fn new(cfg: ValidatorConfig) -> Self {
        Self { cfg }
    }

    /// Validate an inbound event against the relay policy. `now_ns` is the
    /// relay clock in nanoseconds since the Unix epoch.
    pub fn validate(&self, event: &Event, now_ns: u64) -> Result<(), Reject> {
        self.check_structure(event)?;

        let computed = blake3::hash(&canonical_bytes(
            &event.pubkey,
            event.created_at,
            event.kind,
            &event.tags,
            &event.content,
        ));
        if computed != blake3::Hash::from(event.event_id.0) {
            return Err(Reject::InvalidEventId);
        }

        verify_event_sig(&event.pubkey, &event.event_id, &event.sig)
            .map_err(|_| Reject::InvalidSignature)?;

        if KindClass::of(event.kind).is_none() {
            return Err(Reject::InvalidKind(event.kind));
        }

        let horizon = now_ns.saturating_add(self.cfg.max_future_skew_secs * 1_000_000_000);
        if event.created_at > horizon {
            return Err(Reject::TimestampOutOfRange);
        }

        if self.cfg.min_pow_bits > 0 && pow_bits(&event.event_id) < self.cfg.min_pow_bits {
            return Err(Reject::InsufficientPow);
        }

        Ok(())
    }

    fn check_structure(&self, event: &Event) -> Result<(), Reject> {
        if event.content.len() > self.cfg.max_content_len {
            return Err(Reject::InvalidEvent(format!(
                "content exceeds {} bytes",
                self.cfg.max_content_len
            )));
        }
        for tag in &event.tags {
            if tag.key.is_empty() || tag.key.len() > MAX_TAG_KEY_LEN {
                return Err(Reject::InvalidEvent(format!(
                    "tag key length {} outside 1..={}",
                    tag.key.len(),
                    MAX_TAG_KEY_LEN
                )));
            }
            if !tag
                .key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(Reject::InvalidEvent(format!(
                    "tag key {:?} contains invalid characters",
                    tag.key
                )));
            }
            if tag.values.len() > MAX_TAG_VALUES {
                return Err(Reject::InvalidEvent(format!(
                    "tag {:?} carries more than {} values",
                    tag.key, MAX_TAG_VALUES
                )));
            }
            if let Some(v) = tag.values.iter().find(|v| v.len() > MAX_TAG_VALUE_LEN) {
                return Err(Reject::InvalidEvent(format!(
                    "tag value of {} bytes exceeds {}",
                    v.len(),
                    MAX_TAG_VALUE_LEN
                )));
            }
        }
        Ok(())
    }
}
