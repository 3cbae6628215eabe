use std::sync::Arc;

use async_trait::async_trait;
use remote_state_core::{
    compress, LockError, LockErrorKind, LockInfo, Locker, Payload, StateError, StateStore,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::transport::{ObjectTransport, PutCondition, PutOutcome};

/// Suffix of the object holding the lock record.
pub const LOCK_SUFFIX: &str = ".lock";

#[derive(Debug, Clone)]
pub struct S3StateOptions {
    /// Object key of the state.
    pub key: String,
    /// Gzip state before writing it.
    pub gzip: bool,
}

impl S3StateOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            gzip: false,
        }
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }
}

/// What this client last saw of the state object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ETag {
    /// Nothing read or written yet: writes are unconditional.
    #[default]
    Unobserved,
    /// The object was seen and has since gone: writes may only create it.
    Absent,
    /// Entity tag of the last observed version.
    Version(String),
}

impl ETag {
    fn observed(etag: Option<String>) -> Self {
        etag.map(ETag::Version).unwrap_or_default()
    }

    fn condition(&self) -> PutCondition {
        match self {
            ETag::Unobserved => PutCondition::None,
            ETag::Absent => PutCondition::IfAbsent,
            ETag::Version(etag) => PutCondition::IfMatch(etag.clone()),
        }
    }

    fn gone(&self) -> Self {
        match self {
            ETag::Unobserved => ETag::Unobserved,
            _ => ETag::Absent,
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    etag: ETag,
    lock_id: Option<String>,
}

/// Remote state in one S3 object.
///
/// Writes after a read are conditioned on the observed entity tag. The lock
/// is a separate `<key>.lock` object holding the holder's `LockInfo`, created
/// only if absent.
pub struct S3State {
    objects: Arc<dyn ObjectTransport>,
    key: String,
    lock_key: String,
    gzip: bool,
    state: Mutex<ClientState>,
}

impl S3State {
    pub fn new(objects: Arc<dyn ObjectTransport>, options: S3StateOptions) -> Result<Self, StateError> {
        let key = options.key.trim_start_matches('/').to_string();
        if key.is_empty() || key.ends_with('/') {
            return Err(StateError::InvalidArgument(format!(
                "S3 state key {:?} must name an object",
                options.key
            )));
        }

        Ok(Self {
            objects,
            lock_key: format!("{}{}", key, LOCK_SUFFIX),
            key,
            gzip: options.gzip,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn read_lock_record(&self) -> Result<Option<LockInfo>, StateError> {
        match self.objects.get_object(&self.lock_key).await? {
            Some(object) => LockInfo::unmarshal(&object.body).map(Some),
            None => Ok(None),
        }
    }

    async fn held_by_other(&self) -> LockError {
        match self.read_lock_record().await {
            Ok(info) => LockError::held_by_other(info),
            Err(e) => {
                warn!("Failed to read lock record {}: {}", self.lock_key, e);
                LockError::held_by_other(None).with_err(e)
            }
        }
    }
}

#[async_trait]
impl StateStore for S3State {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), level = "debug", fields(key = %self.key))]
    async fn get(&self) -> Result<Option<Payload>, StateError> {
        let mut state = self.state.lock().await;

        let Some(object) = self.objects.get_object(&self.key).await? else {
            state.etag = state.etag.gone();
            return Ok(None);
        };

        if object.body.is_empty() {
            state.etag = ETag::observed(object.etag);
            return Ok(None);
        }

        // an undecodable body leaves the token where it was
        let payload = Payload::from_stored(object.body)?;
        state.etag = ETag::observed(object.etag);
        debug!("Loaded state from {} ({} bytes)", self.key, payload.data.len());
        Ok(Some(payload))
    }

    #[instrument(skip(self, data), level = "debug", fields(key = %self.key, data_len = data.len()))]
    async fn put(&self, data: &[u8]) -> Result<(), StateError> {
        let mut state = self.state.lock().await;

        let body = if self.gzip {
            compress(data)?
        } else {
            data.to_vec()
        };

        match self.objects.put_object(&self.key, &body, state.etag.condition()).await? {
            PutOutcome::Written { etag } => {
                state.etag = ETag::observed(etag);
                debug!("Saved state to {} ({} bytes)", self.key, body.len());
                Ok(())
            }
            PutOutcome::PreconditionFailed => Err(StateError::Conflict(format!(
                "S3 object {} changed since it was read",
                self.key
            ))),
        }
    }

    #[instrument(skip(self), level = "debug", fields(key = %self.key))]
    async fn delete(&self) -> Result<(), StateError> {
        let mut state = self.state.lock().await;
        self.objects.delete_object(&self.key).await?;
        state.etag = ETag::Absent;
        debug!("Deleted state {}", self.key);
        Ok(())
    }
}

#[async_trait]
impl Locker for S3State {
    #[instrument(skip(self, info), level = "debug", fields(key = %self.key, who = %info.who))]
    async fn lock(&self, mut info: LockInfo) -> Result<String, StateError> {
        let mut state = self.state.lock().await;
        if state.lock_id.is_some() {
            return Err(LockError::already_held(&self.key).into());
        }

        info.ensure_id();
        info.stamp(&self.key);
        let record = info.marshal()?;

        match self
            .objects
            .put_object(&self.lock_key, &record, PutCondition::IfAbsent)
            .await
        {
            Ok(PutOutcome::Written { .. }) => {
                state.lock_id = Some(info.id.clone());
                debug!("Acquired lock {} on {} for {}", info.id, self.key, info.who);
                Ok(info.id)
            }
            Ok(PutOutcome::PreconditionFailed) => {
                debug!("Lock record {} already exists", self.lock_key);
                Err(self.held_by_other().await.into())
            }
            Err(e) => Err(LockError::backend(e).into()),
        }
    }

    #[instrument(skip(self), level = "debug", fields(key = %self.key))]
    async fn unlock(&self, id: &str) -> Result<(), StateError> {
        let mut state = self.state.lock().await;

        let Some(held) = state.lock_id.as_deref() else {
            debug!("Unlock of {} without a held lock (no-op)", self.key);
            return Ok(());
        };

        if !id.is_empty() && id != held {
            return Err(LockError::new(LockErrorKind::IdMismatch)
                .with_err(StateError::InvalidArgument(format!(
                    "lock id {:?} does not match held lock {:?}",
                    id, held
                )))
                .into());
        }

        let Some(held) = state.lock_id.take() else {
            return Ok(());
        };

        match self.read_lock_record().await {
            Ok(Some(record)) if record.id == held => {}
            Ok(Some(record)) => {
                warn!("Lock {} on {} was taken over by {}", held, self.key, record.who);
                return Err(LockError::lost(&self.key).with_info(record).into());
            }
            Ok(None) => {
                warn!("Lock record {} disappeared", self.lock_key);
                return Err(LockError::lost(&self.key).into());
            }
            Err(e) => return Err(LockError::backend(e).into()),
        }

        self.objects
            .delete_object(&self.lock_key)
            .await
            .map_err(LockError::backend)?;
        debug!("Released lock {} on {}", held, self.key);
        Ok(())
    }
}
