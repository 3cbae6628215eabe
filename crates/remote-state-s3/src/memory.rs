//! In-memory object store with S3 conditional-write semantics, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remote_state_core::StateError;

use crate::transport::{ObjectTransport, PutCondition, PutOutcome, StoredObject};

#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    next_etag: AtomicUsize,
    fail_deletes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryObjects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).map(|(body, _)| body.clone())
    }

    /// Remove an object behind the backend's back.
    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of mutating calls made so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectTransport for MemoryObjects {
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>, StateError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects.get(key).map(|(body, etag)| StoredObject {
            body: body.clone(),
            etag: Some(etag.clone()),
        }))
    }

    async fn put_object(
        &self,
        key: &str,
        body: &[u8],
        condition: PutCondition,
    ) -> Result<PutOutcome, StateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock().unwrap();
        let current = objects.get(key).map(|(_, etag)| etag.as_str());
        let allowed = match &condition {
            PutCondition::None => true,
            PutCondition::IfAbsent => current.is_none(),
            PutCondition::IfMatch(expected) => current == Some(expected.as_str()),
        };
        if !allowed {
            return Ok(PutOutcome::PreconditionFailed);
        }

        let etag = format!("\"{}\"", self.next_etag.fetch_add(1, Ordering::SeqCst) + 1);
        objects.insert(key.to_string(), (body.to_vec(), etag.clone()));
        Ok(PutOutcome::Written { etag: Some(etag) })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StateError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!("injected delete failure for {}", key)));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
