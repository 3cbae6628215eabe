use std::time::Duration;

use async_trait::async_trait;
use remote_state_core::StateError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// A key/value pair with the index of its last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

/// How a transactional write is conditioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvVerb {
    /// Unconditional write.
    Set,
    /// Write only if the key's modify index still equals the given one.
    Cas(u64),
}

/// Result of a single-operation KV transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed { modify_index: u64 },
    RolledBack { errors: Vec<String> },
}

/// A session lock held on a key.
///
/// The store signals through `lost` when the session backing the lock is
/// invalidated. Checking it never blocks.
#[derive(Debug)]
pub struct SessionLock {
    key: String,
    session: String,
    lost: oneshot::Receiver<()>,
    lost_seen: bool,
    monitor: Option<JoinHandle<()>>,
}

impl SessionLock {
    pub fn new(
        key: impl Into<String>,
        session: impl Into<String>,
        lost: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            key: key.into(),
            session: session.into(),
            lost,
            lost_seen: false,
            monitor: None,
        }
    }

    /// Attach the task keeping the session alive; it is aborted with the lock.
    pub fn with_monitor(mut self, monitor: JoinHandle<()>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Whether the lock was lost since it was acquired.
    ///
    /// A closed channel counts as lost: nothing is watching the session
    /// any more.
    pub fn is_lost(&mut self) -> bool {
        if !self.lost_seen {
            self.lost_seen = !matches!(
                self.lost.try_recv(),
                Err(oneshot::error::TryRecvError::Empty)
            );
        }
        self.lost_seen
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// The KV store operations the Consul state backend needs.
///
/// Implemented by [`crate::ConsulClient`] over HTTP; tests use an in-memory
/// store.
#[async_trait]
pub trait KvTransport: Send + Sync {
    /// Read a key. `Ok(None)` if it does not exist.
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StateError>;

    /// Plain unconditional write.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StateError>;

    /// Delete a key. Succeeds if it does not exist.
    async fn delete(&self, key: &str) -> Result<(), StateError>;

    /// Write a key through a single-operation transaction, which reports the
    /// key's new modify index.
    async fn txn_put(&self, key: &str, value: &[u8], verb: KvVerb)
        -> Result<TxnOutcome, StateError>;

    /// Try to take the session lock on `key`, waiting at most `wait`.
    ///
    /// # Returns
    /// * `Ok(Some(lock))` - The lock is held
    /// * `Ok(None)` - Someone else holds it
    async fn lock(&self, key: &str, wait: Duration) -> Result<Option<SessionLock>, StateError>;

    /// Release a session lock and discard its session.
    async fn unlock(&self, lock: SessionLock) -> Result<(), StateError>;
}
