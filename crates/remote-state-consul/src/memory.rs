//! In-memory KV store with Consul's index and session semantics, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remote_state_core::StateError;
use tokio::sync::oneshot;

use crate::transport::{KvPair, KvTransport, KvVerb, SessionLock, TxnOutcome};

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    fail_unlocks: AtomicBool,
    writes: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    index: u64,
    pairs: HashMap<String, (Vec<u8>, u64)>,
    locks: HashMap<String, (String, oneshot::Sender<()>)>,
    next_session: u64,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.pairs.get(key).map(|(value, _)| value.clone())
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.inner.lock().unwrap().locks.contains_key(key)
    }

    /// Invalidate every session, as if the agent lost them.
    pub fn expire_sessions(&self) {
        self.inner.lock().unwrap().locks.clear();
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unlocks(&self, fail: bool) {
        self.fail_unlocks.store(fail, Ordering::SeqCst);
    }

    /// Number of mutating calls made so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvTransport for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StateError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.pairs.get(key).map(|(value, modify_index)| KvPair {
            key: key.to_string(),
            value: value.clone(),
            modify_index: *modify_index,
        }))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.count_write();
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!("injected put failure for {}", key)));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.index += 1;
        let index = inner.index;
        inner.pairs.insert(key.to_string(), (value.to_vec(), index));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.count_write();
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!("injected delete failure for {}", key)));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.pairs.remove(key);
        Ok(())
    }

    async fn txn_put(
        &self,
        key: &str,
        value: &[u8],
        verb: KvVerb,
    ) -> Result<TxnOutcome, StateError> {
        self.count_write();
        let mut inner = self.inner.lock().unwrap();
        if let KvVerb::Cas(expected) = verb {
            let current = inner.pairs.get(key).map(|(_, index)| *index).unwrap_or(0);
            if current != expected {
                return Ok(TxnOutcome::RolledBack {
                    errors: vec![format!(
                        "op 0: failed to set key {:?}, index is stale ({} != {})",
                        key, current, expected
                    )],
                });
            }
        }
        inner.index += 1;
        let index = inner.index;
        inner.pairs.insert(key.to_string(), (value.to_vec(), index));
        Ok(TxnOutcome::Committed {
            modify_index: index,
        })
    }

    async fn lock(&self, key: &str, _wait: Duration) -> Result<Option<SessionLock>, StateError> {
        self.count_write();
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains_key(key) {
            return Ok(None);
        }
        inner.next_session += 1;
        let session = format!("session-{}", inner.next_session);
        let (tx, rx) = oneshot::channel();
        inner.locks.insert(key.to_string(), (session.clone(), tx));
        Ok(Some(SessionLock::new(key, session, rx)))
    }

    async fn unlock(&self, lock: SessionLock) -> Result<(), StateError> {
        self.count_write();
        if self.fail_unlocks.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!(
                "injected unlock failure for {}",
                lock.key()
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.locks.get(lock.key()) {
            Some((session, _)) if session == lock.session() => {
                inner.locks.remove(lock.key());
                Ok(())
            }
            _ => Err(StateError::Transport(format!(
                "session {} does not hold {}",
                lock.session(),
                lock.key()
            ))),
        }
    }
}
