use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remote_state_core::{
    compress, ErrorList, LockError, LockErrorKind, LockInfo, Locker, Payload, StateError,
    StateStore,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::transport::{KvTransport, KvVerb, SessionLock, TxnOutcome};

/// Suffix of the key holding the session lock.
pub const LOCK_SUFFIX: &str = "/.lock";
/// Suffix of the key holding the JSON lock metadata.
pub const LOCK_INFO_SUFFIX: &str = "/.lockinfo";
/// How long a lock attempt waits for the current holder to let go.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(1);

/// Settings for one Consul state path.
#[derive(Debug, Clone)]
pub struct ConsulStateOptions {
    /// KV path of the state.
    pub path: String,
    /// Gzip state before writing it.
    pub gzip: bool,
    /// Bound on the wait during lock acquisition.
    pub lock_wait: Duration,
}

impl ConsulStateOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            gzip: false,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }
}

/// What this client last saw of the state key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ModifyIndex {
    /// Nothing read or written yet: writes are unconditional.
    #[default]
    Unobserved,
    /// The key was seen and has since gone: writes may only create it.
    Absent,
    /// Index of the last observed write.
    At(u64),
}

impl ModifyIndex {
    fn verb(self) -> KvVerb {
        match self {
            ModifyIndex::Unobserved => KvVerb::Set,
            // Consul treats a CAS at index 0 as create-if-absent
            ModifyIndex::Absent => KvVerb::Cas(0),
            ModifyIndex::At(index) => KvVerb::Cas(index),
        }
    }

    fn gone(self) -> Self {
        match self {
            ModifyIndex::Unobserved => ModifyIndex::Unobserved,
            _ => ModifyIndex::Absent,
        }
    }
}

#[derive(Debug)]
struct HeldLock {
    id: String,
    session: SessionLock,
}

#[derive(Debug, Default)]
struct ClientState {
    /// Once observed, writes are compare-and-swap against this. This
    /// matters even while locked: a lock that was lost and re-acquired must
    /// not hide a write made in between.
    modify_index: ModifyIndex,
    lock: Option<HeldLock>,
}

/// Remote state stored under a single Consul KV path.
///
/// Key layout:
/// ```text
/// {path}            # state (optionally gzipped)
/// {path}/.lock      # session lock
/// {path}/.lockinfo  # JSON LockInfo of the holder
/// ```
pub struct ConsulState {
    kv: Arc<dyn KvTransport>,
    path: String,
    gzip: bool,
    lock_wait: Duration,
    state: Mutex<ClientState>,
}

impl ConsulState {
    pub fn new(kv: Arc<dyn KvTransport>, options: ConsulStateOptions) -> Result<Self, StateError> {
        let path = options.path.trim_matches('/').to_string();
        if path.is_empty() {
            return Err(StateError::InvalidArgument(
                "Consul state path must not be empty".to_string(),
            ));
        }

        Ok(Self {
            kv,
            path,
            gzip: options.gzip,
            lock_wait: options.lock_wait,
            state: Mutex::new(ClientState::default()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock_key(&self) -> String {
        format!("{}{}", self.path, LOCK_SUFFIX)
    }

    fn lock_info_key(&self) -> String {
        format!("{}{}", self.path, LOCK_INFO_SUFFIX)
    }

    async fn put_lock_info(&self, info: &LockInfo) -> Result<(), StateError> {
        self.kv.put(&self.lock_info_key(), &info.marshal()?).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>, StateError> {
        match self.kv.get(&self.lock_info_key()).await? {
            Some(pair) => LockInfo::unmarshal(&pair.value).map(Some),
            None => Ok(None),
        }
    }

    /// Lock error for contention, with the holder's metadata if readable.
    async fn held_by_other(&self) -> LockError {
        match self.get_lock_info().await {
            Ok(info) => LockError::held_by_other(info),
            Err(e) => {
                warn!("Failed to read lock info for {}: {}", self.path, e);
                LockError::held_by_other(None).with_err(e)
            }
        }
    }

    /// Give up the held lock, if any. Local lock state is cleared whatever
    /// the outcome.
    async fn release(&self, state: &mut ClientState) -> Result<(), StateError> {
        let Some(mut held) = state.lock.take() else {
            return Ok(());
        };

        let mut errors = ErrorList::new();

        if held.session.is_lost() {
            warn!("Consul lock on {} was lost", self.path);
            errors.push(LockError::lost(&self.path).into());
            drop(held.session);

            // Someone else may hold the lock by now; only clear our own record.
            match self.get_lock_info().await {
                Ok(Some(info)) if info.id == held.id => {
                    errors.check(self.kv.delete(&self.lock_info_key()).await);
                }
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
            return errors.into_result();
        }

        if let Err(e) = self.kv.unlock(held.session).await {
            warn!("Failed to release Consul lock on {}: {}", self.path, e);
            errors.push(e);
        }

        if let Err(e) = self.kv.delete(&self.lock_info_key()).await {
            warn!("Failed to delete lock info for {}: {}", self.path, e);
            errors.push(e);
        }

        if errors.is_empty() {
            debug!("Released lock {} on {}", held.id, self.path);
        }
        errors.into_result()
    }
}

#[async_trait]
impl StateStore for ConsulState {
    fn backend_name(&self) -> &'static str {
        "consul"
    }

    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    async fn get(&self) -> Result<Option<Payload>, StateError> {
        let mut state = self.state.lock().await;

        let Some(pair) = self.kv.get(&self.path).await? else {
            state.modify_index = state.modify_index.gone();
            return Ok(None);
        };

        if pair.value.is_empty() {
            state.modify_index = ModifyIndex::At(pair.modify_index);
            return Ok(None);
        }

        // an undecodable body leaves the token where it was
        let payload = Payload::from_stored(pair.value)?;
        state.modify_index = ModifyIndex::At(pair.modify_index);
        debug!(
            "Loaded state from {} at index {} ({} bytes)",
            self.path,
            pair.modify_index,
            payload.data.len()
        );
        Ok(Some(payload))
    }

    #[instrument(skip(self, data), level = "debug", fields(path = %self.path, data_len = data.len()))]
    async fn put(&self, data: &[u8]) -> Result<(), StateError> {
        let mut state = self.state.lock().await;

        let value = if self.gzip {
            compress(data)?
        } else {
            data.to_vec()
        };

        // Without an observed index we are creating the state or purposely
        // overwriting it.
        let verb = state.modify_index.verb();

        match self.kv.txn_put(&self.path, &value, verb).await? {
            TxnOutcome::Committed { modify_index } => {
                state.modify_index = ModifyIndex::At(modify_index);
                debug!(
                    "Saved state to {} at index {} ({} bytes)",
                    self.path,
                    modify_index,
                    value.len()
                );
                Ok(())
            }
            TxnOutcome::RolledBack { errors } => match verb {
                KvVerb::Cas(index) => Err(StateError::Conflict(format!(
                    "Consul CAS on {} at index {} failed with transaction errors: {}",
                    self.path,
                    index,
                    errors.join("; ")
                ))),
                KvVerb::Set => Err(StateError::Transport(format!(
                    "Consul write to {} was rolled back: {}",
                    self.path,
                    errors.join("; ")
                ))),
            },
        }
    }

    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    async fn delete(&self) -> Result<(), StateError> {
        let mut state = self.state.lock().await;
        self.kv.delete(&self.path).await?;
        state.modify_index = ModifyIndex::Absent;
        debug!("Deleted state {}", self.path);
        Ok(())
    }
}

#[async_trait]
impl Locker for ConsulState {
    #[instrument(skip(self, info), level = "debug", fields(path = %self.path, who = %info.who))]
    async fn lock(&self, mut info: LockInfo) -> Result<String, StateError> {
        let mut state = self.state.lock().await;

        if let Some(held) = state.lock.as_mut() {
            if held.session.is_lost() {
                return Err(LockError::lost(&self.path).into());
            }
            return Err(LockError::already_held(&self.path).into());
        }

        info.ensure_id();

        let session = match self.kv.lock(&self.lock_key(), self.lock_wait).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("Lock on {} is held by another client", self.path);
                return Err(self.held_by_other().await.into());
            }
            Err(e) => return Err(LockError::backend(e).into()),
        };

        state.lock = Some(HeldLock {
            id: info.id.clone(),
            session,
        });

        info.stamp(&self.path);
        if let Err(e) = self.put_lock_info(&info).await {
            let mut err = LockError::backend(e);
            if let Err(unlock_err) = self.release(&mut state).await {
                err.push_err(unlock_err);
            }
            return Err(err.into());
        }

        debug!("Acquired lock {} on {} for {}", info.id, self.path, info.who);
        Ok(info.id)
    }

    #[instrument(skip(self), level = "debug", fields(path = %self.path))]
    async fn unlock(&self, id: &str) -> Result<(), StateError> {
        let mut state = self.state.lock().await;

        let Some(held) = state.lock.as_ref() else {
            debug!("Unlock of {} without a held lock (no-op)", self.path);
            return Ok(());
        };

        // The lock belongs to the session, so an empty id is accepted.
        if !id.is_empty() && id != held.id {
            return Err(LockError::new(LockErrorKind::IdMismatch)
                .with_err(StateError::InvalidArgument(format!(
                    "lock id {:?} does not match held lock {:?}",
                    id, held.id
                )))
                .into());
        }

        self.release(&mut state).await
    }
}
