//! In-memory blob store with Azure's lease semantics, for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use remote_state_core::StateError;

use crate::transport::{BlobProperties, BlobTransport, LeaseOutcome, Metadata};

#[derive(Debug, Default, Clone)]
struct Blob {
    data: Vec<u8>,
    metadata: Metadata,
    lease: Option<String>,
}

#[derive(Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Blob>>,
    snapshots: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    fail_metadata: AtomicBool,
    fail_release: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBlobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raw(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(name).map(|b| b.data.clone())
    }

    pub fn metadata(&self, name: &str) -> Metadata {
        self.blobs
            .lock()
            .unwrap()
            .get(name)
            .map(|b| b.metadata.clone())
            .unwrap_or_default()
    }

    pub fn lease(&self, name: &str) -> Option<String> {
        self.blobs.lock().unwrap().get(name).and_then(|b| b.lease.clone())
    }

    /// Snapshot contents of a blob, oldest first.
    pub fn snapshots(&self, name: &str) -> Vec<Vec<u8>> {
        self.snapshots
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Break the lease, as an operator would from the portal.
    pub fn break_lease(&self, name: &str) {
        if let Some(blob) = self.blobs.lock().unwrap().get_mut(name) {
            blob.lease = None;
        }
    }

    pub fn set_fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Number of mutating calls made so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn count_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reads need a matching lease only when one is given.
fn check_read(blob: &Blob, name: &str, lease: Option<&str>) -> Result<(), StateError> {
    match lease {
        Some(id) if blob.lease.as_deref() != Some(id) => Err(StateError::Conflict(format!(
            "lease {} does not match the lease on {}",
            id, name
        ))),
        _ => Ok(()),
    }
}

/// Writes to a leased blob need its lease.
fn check_write(blob: &Blob, name: &str, lease: Option<&str>) -> Result<(), StateError> {
    match (&blob.lease, lease) {
        (Some(held), Some(given)) if held == given => Ok(()),
        (Some(_), _) => Err(StateError::Conflict(format!(
            "blob {} is leased and the request does not carry the lease",
            name
        ))),
        (None, Some(given)) => Err(StateError::Conflict(format!(
            "lease {} is not active on {}",
            given, name
        ))),
        (None, None) => Ok(()),
    }
}

#[async_trait]
impl BlobTransport for MemoryBlobs {
    async fn get_blob(&self, name: &str, lease: Option<&str>) -> Result<Option<Vec<u8>>, StateError> {
        let blobs = self.blobs.lock().unwrap();
        let Some(blob) = blobs.get(name) else {
            return Ok(None);
        };
        check_read(blob, name, lease)?;
        Ok(Some(blob.data.clone()))
    }

    async fn get_properties(
        &self,
        name: &str,
        lease: Option<&str>,
    ) -> Result<Option<BlobProperties>, StateError> {
        let blobs = self.blobs.lock().unwrap();
        let Some(blob) = blobs.get(name) else {
            return Ok(None);
        };
        check_read(blob, name, lease)?;
        Ok(Some(BlobProperties {
            metadata: blob.metadata.clone(),
            leased: blob.lease.is_some(),
        }))
    }

    async fn put_blob(
        &self,
        name: &str,
        data: &[u8],
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError> {
        self.count_write();
        let mut blobs = self.blobs.lock().unwrap();
        let existing = blobs.get(name).cloned().unwrap_or_default();
        check_write(&existing, name, lease)?;
        blobs.insert(
            name.to_string(),
            Blob {
                data: data.to_vec(),
                metadata: metadata.clone(),
                lease: existing.lease,
            },
        );
        Ok(())
    }

    async fn snapshot_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError> {
        self.count_write();
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        check_read(blob, name, lease)?;
        self.snapshots
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(blob.data.clone());
        Ok(())
    }

    async fn delete_blob(&self, name: &str, lease: Option<&str>) -> Result<(), StateError> {
        self.count_write();
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(blob) = blobs.get(name) {
            check_write(blob, name, lease)?;
            blobs.remove(name);
            self.snapshots.lock().unwrap().remove(name);
        }
        Ok(())
    }

    async fn set_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
        lease: Option<&str>,
    ) -> Result<(), StateError> {
        self.count_write();
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!(
                "injected metadata failure for {}",
                name
            )));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        check_write(blob, name, lease)?;
        blob.metadata = metadata.clone();
        Ok(())
    }

    async fn acquire_lease(&self, name: &str, proposed_id: &str) -> Result<LeaseOutcome, StateError> {
        self.count_write();
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if blob.lease.is_some() {
            return Ok(LeaseOutcome::AlreadyLeased);
        }
        blob.lease = Some(proposed_id.to_string());
        Ok(LeaseOutcome::Acquired(proposed_id.to_string()))
    }

    async fn release_lease(&self, name: &str, lease_id: &str) -> Result<(), StateError> {
        self.count_write();
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(StateError::Transport(format!(
                "injected release failure for {}",
                name
            )));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if blob.lease.as_deref() != Some(lease_id) {
            return Err(StateError::Conflict(format!(
                "lease {} is not active on {}",
                lease_id, name
            )));
        }
        blob.lease = None;
        Ok(())
    }
}
