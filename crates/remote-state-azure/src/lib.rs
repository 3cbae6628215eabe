//! Azure Blob Storage backend for remote state.
//!
//! - `AzureBlobClient`: Blob REST client authorized with a SAS token
//! - `AzureState`: `StateStore` + `Locker` over one blob, locked with an
//!   infinite blob lease whose id is the lock id

mod client;
mod state;
mod transport;

#[cfg(test)]
mod memory;

pub use client::AzureBlobClient;
pub use state::{AzureState, LOCK_INFO_META_KEY};
pub use transport::{BlobProperties, BlobTransport, LeaseOutcome, Metadata};
