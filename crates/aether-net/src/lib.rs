//! Aether wire surfaces
//!
//! This crate provides:
//! - Envelope encoding in both negotiated formats, plus stream framing
//! - Typed protocol payloads (HELLO through NOISE)
//! - Transport encryption keyed by X25519 with counter nonces
//! - The per-connection session state machine

pub mod envelope;
pub mod messages;
pub mod noise;
pub mod session;

pub use envelope::{CodecError, Envelope, FrameCodec, FrameFormat, MsgType, RawFrame};
pub use messages::{Message, PROTOCOL_VERSION};
pub use noise::{ClientNoise, NoiseRx, NoiseTx};
pub use session::{seal_and_encode, ClientCommand, Session, SessionConfig, SessionOutput, SessionState};
