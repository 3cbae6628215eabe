use std::sync::Arc;

use async_trait::async_trait;
use remote_state_core::{
    ErrorList, LockError, LockErrorKind, LockInfo, Locker, Payload, StateError, StateStore,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::transport::{BlobProperties, BlobTransport, LeaseOutcome, Metadata};

/// Blob metadata key holding the base64 JSON lock info. Must be lowercase.
pub const LOCK_INFO_META_KEY: &str = "statelockinfo";

/// Lease id of the lock this client holds.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseId(String);

/// Remote state stored in a single blob, locked with a blob lease.
///
/// While locked, every request carries the lease, so writes from other
/// clients are rejected by the storage service.
pub struct AzureState {
    blobs: Arc<dyn BlobTransport>,
    name: String,
    snapshot: bool,
    lease: Mutex<Option<LeaseId>>,
}

impl AzureState {
    pub fn new(
        blobs: Arc<dyn BlobTransport>,
        container: &str,
        key: &str,
    ) -> Result<Self, StateError> {
        let container = container.trim_matches('/');
        let key = key.trim_matches('/');
        if container.is_empty() || key.is_empty() {
            return Err(StateError::InvalidArgument(
                "Azure state needs both a container and a key".to_string(),
            ));
        }

        Ok(Self {
            blobs,
            name: format!("{}/{}", container, key),
            snapshot: false,
            lease: Mutex::new(None),
        })
    }

    /// Snapshot the existing blob before each overwrite.
    pub fn snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// `<container>/<key>`, also stamped as the lock path.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lease_ref(lease: &Option<LeaseId>) -> Option<&str> {
        lease.as_ref().map(|l| l.0.as_str())
    }

    fn stored_lock_info(props: &BlobProperties) -> Result<Option<LockInfo>, StateError> {
        match props.metadata.get(LOCK_INFO_META_KEY) {
            Some(raw) if !raw.is_empty() => LockInfo::from_base64(raw).map(Some),
            _ => Ok(None),
        }
    }

    /// Lock error for contention, with the holder's metadata if readable.
    async fn held_by_other(&self) -> LockError {
        let info = match self.blobs.get_properties(&self.name, None).await {
            Ok(Some(props)) => Self::stored_lock_info(&props),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        match info {
            Ok(info) => LockError::held_by_other(info),
            Err(e) => {
                warn!("Failed to read lock info for {}: {}", self.name, e);
                LockError::held_by_other(None).with_err(e)
            }
        }
    }

    /// Write (or with `None`, remove) the lock info entry, keeping all other
    /// metadata.
    async fn write_lock_info(&self, info: Option<&LockInfo>, lease: &str) -> Result<(), StateError> {
        let mut metadata = match self.blobs.get_properties(&self.name, Some(lease)).await? {
            Some(props) => props.metadata,
            None => return Err(StateError::NotFound(self.name.clone())),
        };
        match info {
            Some(info) => {
                metadata.insert(LOCK_INFO_META_KEY.to_string(), info.to_base64()?);
            }
            None => {
                metadata.remove(LOCK_INFO_META_KEY);
            }
        }
        self.blobs.set_metadata(&self.name, &metadata, Some(lease)).await
    }

    /// Clear the lock info and release the lease, attempting both.
    async fn release(&self, lease: &str) -> Result<(), StateError> {
        let mut errors = ErrorList::new();

        if let Err(e) = self.write_lock_info(None, lease).await {
            warn!("Failed to clear lock info on {}: {}", self.name, e);
            errors.push(e);
        }
        if let Err(e) = self.blobs.release_lease(&self.name, lease).await {
            warn!("Failed to release lease on {}: {}", self.name, e);
            errors.push(e);
        }
        errors.into_result()
    }

    /// After losing the lease, drop our lock info if nobody has leased the
    /// blob since. Another holder's entry is left alone.
    async fn clear_stale_lock_info(&self, lease: &str) -> Result<(), StateError> {
        let Some(props) = self.blobs.get_properties(&self.name, None).await? else {
            return Ok(());
        };
        if props.leased {
            return Ok(());
        }
        let ours = Self::stored_lock_info(&props)
            .ok()
            .flatten()
            .is_some_and(|info| info.id == lease);
        if !ours {
            return Ok(());
        }

        let mut metadata = props.metadata;
        metadata.remove(LOCK_INFO_META_KEY);
        self.blobs.set_metadata(&self.name, &metadata, None).await
    }

    /// Whether `lease` still guards the blob under our lock info.
    async fn still_held(&self, lease: &str) -> Result<bool, StateError> {
        let props = match self.blobs.get_properties(&self.name, Some(lease)).await {
            Ok(Some(props)) => props,
            Ok(None) => return Ok(false),
            Err(StateError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !props.leased {
            return Ok(false);
        }
        let owner = Self::stored_lock_info(&props)?;
        Ok(owner.is_some_and(|info| info.id == lease))
    }
}

#[async_trait]
impl StateStore for AzureState {
    fn backend_name(&self) -> &'static str {
        "azure"
    }

    #[instrument(skip(self), level = "debug", fields(name = %self.name))]
    async fn get(&self) -> Result<Option<Payload>, StateError> {
        let lease = self.lease.lock().await;
        let Some(data) = self.blobs.get_blob(&self.name, Self::lease_ref(&lease)).await? else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }

        let payload = Payload::from_stored(data)?;
        debug!("Loaded state from {} ({} bytes)", self.name, payload.data.len());
        Ok(Some(payload))
    }

    #[instrument(skip(self, data), level = "debug", fields(name = %self.name, data_len = data.len()))]
    async fn put(&self, data: &[u8]) -> Result<(), StateError> {
        let lease = self.lease.lock().await;
        let lease = Self::lease_ref(&lease);

        // keep the lock info written next to the state
        let metadata = match self.blobs.get_properties(&self.name, lease).await? {
            Some(props) => {
                if self.snapshot {
                    self.blobs.snapshot_blob(&self.name, lease).await?;
                    debug!("Snapshotted {} before overwriting it", self.name);
                }
                props.metadata
            }
            None => Metadata::new(),
        };

        self.blobs.put_blob(&self.name, data, &metadata, lease).await?;
        debug!("Saved state to {} ({} bytes)", self.name, data.len());
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(name = %self.name))]
    async fn delete(&self) -> Result<(), StateError> {
        let lease = self.lease.lock().await;
        self.blobs
            .delete_blob(&self.name, Self::lease_ref(&lease))
            .await?;
        debug!("Deleted state {}", self.name);
        Ok(())
    }
}

#[async_trait]
impl Locker for AzureState {
    #[instrument(skip(self, info), level = "debug", fields(name = %self.name, who = %info.who))]
    async fn lock(&self, mut info: LockInfo) -> Result<String, StateError> {
        let mut lease = self.lease.lock().await;
        if lease.is_some() {
            return Err(LockError::already_held(&self.name).into());
        }

        info.stamp(&self.name);
        info.ensure_id();

        match self.blobs.get_properties(&self.name, None).await {
            Ok(Some(props)) if props.leased => {
                debug!("Blob {} is already leased", self.name);
                return Err(self.held_by_other().await.into());
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                // a lease needs a blob to hang on
                self.blobs
                    .put_blob(&self.name, &[], &Metadata::new(), None)
                    .await
                    .map_err(LockError::backend)?;
            }
            Err(e) => return Err(LockError::backend(e).into()),
        }

        let lease_id = match self.blobs.acquire_lease(&self.name, &info.id).await {
            Ok(LeaseOutcome::Acquired(id)) => id,
            Ok(LeaseOutcome::AlreadyLeased) => return Err(self.held_by_other().await.into()),
            Err(e) => return Err(LockError::backend(e).into()),
        };
        info.id = lease_id.clone();

        if let Err(e) = self.write_lock_info(Some(&info), &lease_id).await {
            let mut err = LockError::backend(e);
            if let Err(release_err) = self.blobs.release_lease(&self.name, &lease_id).await {
                err.push_err(release_err);
            }
            return Err(err.into());
        }

        *lease = Some(LeaseId(lease_id.clone()));
        debug!("Acquired lease {} on {} for {}", lease_id, self.name, info.who);
        Ok(lease_id)
    }

    #[instrument(skip(self), level = "debug", fields(name = %self.name))]
    async fn unlock(&self, id: &str) -> Result<(), StateError> {
        let mut guard = self.lease.lock().await;

        let Some(LeaseId(held)) = guard.as_ref() else {
            debug!("Unlock of {} without a held lease (no-op)", self.name);
            return Ok(());
        };

        if !id.is_empty() && id != held.as_str() {
            return Err(LockError::new(LockErrorKind::IdMismatch)
                .with_err(StateError::InvalidArgument(format!(
                    "lock id {:?} does not match held lease {:?}",
                    id, held
                )))
                .into());
        }

        let Some(LeaseId(lease)) = guard.take() else {
            return Ok(());
        };

        match self.still_held(&lease).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Lease {} on {} was lost", lease, self.name);
                let mut errors = ErrorList::new();
                errors.push(LockError::lost(&self.name).into());
                errors.check(self.clear_stale_lock_info(&lease).await);
                return errors.into_result();
            }
            Err(e) => {
                // state unknown: still try to clean up
                let mut errors = ErrorList::new();
                errors.push(e);
                errors.check(self.release(&lease).await);
                return errors.into_result();
            }
        }

        self.release(&lease).await?;
        debug!("Released lease {} on {}", lease, self.name);
        Ok(())
    }
}
