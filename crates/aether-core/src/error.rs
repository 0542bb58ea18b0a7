//! Rejection discriminants surfaced at adapter boundaries
//!
//! Every failure mode a gateway can report maps onto one of these
//! variants; `code()` yields the stable wire string. Validators return
//! these as values, never as panics or hidden unwinds.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Reject {
    /// Malformed frame, unknown type, or an undecodable payload
    #[error("malformed message")]
    InvalidMessage,

    /// Structural violation: field sizes, tag constraints, content length
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Recomputed canonical hash does not match the transmitted id
    #[error("event id mismatch")]
    InvalidEventId,

    /// Ed25519 signature does not verify against the pubkey
    #[error("signature verification failed")]
    InvalidSignature,

    /// Kind falls outside every storage class
    #[error("kind {0} outside storage classes")]
    InvalidKind(u16),

    /// `created_at` exceeds the tolerated future skew
    #[error("created_at too far in the future")]
    TimestampOutOfRange,

    /// Event id does not meet the configured difficulty
    #[error("insufficient proof-of-work")]
    InsufficientPow,

    /// Catch-all validation failure
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Operation referenced a subscription this connection does not own
    #[error("unknown subscription")]
    SubscriptionNotFound,

    /// Publisher exceeded the configured rate limit
    #[error("rate limited")]
    RateLimited,

    /// Resource error (storage I/O and the like); logged, never fatal to
    /// the relay
    #[error("internal error: {0}")]
    Internal(String),
}

impl Reject {
    /// The stable error code string used on every wire surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::InvalidEvent(_) => "invalid_event",
            Self::InvalidEventId => "invalid_event_id",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidKind(_) => "invalid_kind",
            Self::TimestampOutOfRange => "timestamp_out_of_range",
            Self::InsufficientPow => "insufficient_pow",
            Self::ValidationFailed(_) => "validation_failed",
            Self::SubscriptionNotFound => "subscription_not_found",
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Reject::InvalidEventId.code(), "invalid_event_id");
        assert_eq!(Reject::InvalidKind(5000).code(), "invalid_kind");
        assert_eq!(Reject::RateLimited.code(), "rate_limited");
        assert_eq!(Reject::Internal("disk".into()).code(), "internal_error");
    }
}
