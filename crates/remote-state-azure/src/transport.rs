use std::collections::HashMap;

use async_trait::async_trait;
use remote_state_core::StateError;

/// User metadata attached to a blob.
pub type Metadata = HashMap<String, String>;

/// Blob properties relevant to state storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub metadata: Metadata,
    /// Whether a lease is currently held on the blob.
    pub leased: bool,
}

/// Result of a lease acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The lease is ours, with this id.
    Acquired(String),
    /// Another party holds a lease.
    AlreadyLeased,
}

/// The blob operations the Azure state backend needs.
///
/// `name` is `<container>/<blob>`. Where an operation takes `lease`, the
/// backend rejects it with `StateError::Conflict` when the blob is leased
/// under a different id, or leased while no id is given for a write.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    /// Blob contents, `Ok(None)` if the blob does not exist.
    async fn get_blob(&self, name: &str, lease: Option<&str>) -> Result<Option<Vec<u8>>, StateError>;

    /// Blob properties, `Ok(None)` if the blob does not exist.
    async fn get_properties(
        &self,
        name: &str,
        lease: Option<&str>,
    ) -> Result<Option<BlobProperties>, StateError>;

    /// Create or replace a block blob with the given metadata.
    async fn put_blob(
        &self,
        name: &str,
        data: &[u8],
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError>;

    /// Keep a read-only snapshot of the blob's current contents.
    async fn snapshot_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError>;

    /// Delete a blob and its snapshots. Succeeds if it does not exist.
    async fn delete_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError>;

    /// Replace the blob's metadata.
    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError>;

    /// Take an infinite lease, proposing `proposed_id` as its id.
    async fn acquire_lease(&self, name: &str, proposed_id: &str) -> Result<LeaseOutcome, StateError>;

    async fn release_lease(&self, name: &str, lease_id: &str) -> Result<(), StateError>;
}
