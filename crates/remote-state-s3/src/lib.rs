//! S3 backend for remote state.
//!
//! - `S3Objects`: `aws-sdk-s3` client for one bucket with conditional puts
//! - `S3State`: `StateStore` + `Locker` with entity-tag compare-and-swap and
//!   a create-if-absent lock record

mod client;
mod state;
mod transport;

#[cfg(test)]
mod memory;

pub use client::S3Objects;
pub use state::{S3State, S3StateOptions, LOCK_SUFFIX};
pub use transport::{ObjectTransport, PutCondition, PutOutcome, StoredObject};
