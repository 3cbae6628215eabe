//! Consul KV backend for remote state.
//!
//! - `ConsulClient`: HTTP client for the KV, transaction and session APIs
//! - `ConsulState`: `StateStore` + `Locker` over one KV path, with
//!   modify-index compare-and-swap and session locks

mod client;
mod state;
mod transport;

#[cfg(test)]
mod memory;

pub use client::{ConsulClient, DEFAULT_SESSION_TTL};
pub use state::{
    ConsulState, ConsulStateOptions, DEFAULT_LOCK_WAIT, LOCK_INFO_SUFFIX, LOCK_SUFFIX,
};
pub use transport::{KvPair, KvTransport, KvVerb, SessionLock, TxnOutcome};
