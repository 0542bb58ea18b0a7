//! aetherd - Aether Relay Daemon
//!
//! The relay core and its wire surfaces:
//! - Storage backends (memory, sled, sqlite) behind one contract
//! - Filter-indexed fan-out with bounded, drop-oldest outboxes
//! - The native WebSocket/QUIC gateway
//! - NIP-01 and HTTP adapters over the same core

pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod outbox;
pub mod relay;
pub mod server;
pub mod store;

pub use config::Config;
pub use dispatch::{ConnId, Dispatcher};
pub use outbox::Outbox;
pub use relay::{Acceptance, Relay};
pub use server::Server;
pub use store::{open_store, PutOutcome, Store, StoreBackend};
