use async_trait::async_trait;
use remote_state_core::StateError;

/// An object body with its entity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

/// Precondition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    None,
    /// Create only; fail if the object exists (`If-None-Match: *`).
    IfAbsent,
    /// Replace only the version carrying this entity tag (`If-Match`).
    IfMatch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Written { etag: Option<String> },
    PreconditionFailed,
}

/// Object store operations the S3 state backend needs.
#[async_trait]
pub trait ObjectTransport: Send + Sync {
    /// Read an object. `Ok(None)` if it does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, StateError>;

    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        condition: PutCondition,
    ) -> Result<PutOutcome, StateError>;

    /// Delete an object. Succeeds if it does not exist.
    async fn delete_object(&self, key: &str) -> Result<(), StateError>;
}
