//! Wire adapters over the relay core
//!
//! Every adapter normalizes at ingress through the shared wire types
//! and calls the same Validator, Store, and Dispatcher, so an event
//! accepted on one surface is dispatchable over all of them.

pub mod http;
pub mod nip01;
