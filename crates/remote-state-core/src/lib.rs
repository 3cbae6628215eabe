//! Core traits and types for remote state backends.
//!
//! This crate defines the abstractions shared by every backend:
//! - `StateStore`: Get, put and delete of a single state blob
//! - `Locker`: Optional mutual exclusion on top of a `StateStore`
//! - `Payload`: The state bytes plus their MD5 digest
//! - `LockInfo` / `LockError`: Lock metadata and "who holds it" diagnostics
//! - `conformance`: Checks every backend runs in its tests

pub mod conformance;
mod error;
mod lock;
mod payload;
mod store;

pub use error::{ErrorList, LockError, LockErrorKind, StateError};
pub use lock::{LockInfo, Locker};
pub use payload::{checksum, compress, decompress, is_gzip, Payload, GZIP_MAGIC};
pub use store::StateStore;
