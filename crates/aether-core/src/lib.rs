//! Aether Core Library
//!
//! Core types, canonical encoding, and validation for the Aether
//! content-addressed pub/sub relay.
//!
//! # Modules
//!
//! - [`types`]: Event model, kind classes, conflict ordering
//! - [`canonical`]: Deterministic serialization hashed into event ids
//! - [`crypto`]: Ed25519 signing and verification
//! - [`validate`]: Inbound event validation pipeline
//! - [`filter`]: Subscription filters and matching
//! - [`wire`]: Ingress wire forms and normalization
//! - [`error`]: Rejection discriminants with stable wire codes

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod types;
pub mod validate;
pub mod wire;

pub use error::Reject;
pub use filter::{Filter, FilterWire};
pub use types::*;
pub use wire::EventWire;
