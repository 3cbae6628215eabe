use async_trait::async_trait;

use crate::error::StateError;
use crate::payload::Payload;

/// Storage of a single remote state blob.
///
/// Every backend implements this. Backends that can also exclude other
/// writers additionally implement [`crate::Locker`].
///
/// Implementations keep whatever version token their backend offers and
/// condition writes on it, so a `put` after another client's write fails
/// with `StateError::Conflict` instead of silently overwriting it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the backend identifier (e.g., "consul", "s3").
    fn backend_name(&self) -> &'static str;

    /// Fetch the current state.
    ///
    /// Returns `Ok(None)` when nothing is stored. Records the backend's
    /// version token for later writes.
    async fn get(&self) -> Result<Option<Payload>, StateError>;

    /// Replace the stored state with `data`.
    async fn put(&self, data: &[u8]) -> Result<(), StateError>;

    /// Remove the stored state. Succeeds if it is already gone.
    async fn delete(&self) -> Result<(), StateError>;
}
