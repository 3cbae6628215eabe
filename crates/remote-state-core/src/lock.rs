use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::store::StateStore;

/// Metadata recorded alongside a lock: who took it, why, when and where.
///
/// Serialized as JSON with the field names other tooling expects
/// (`ID`, `Operation`, `Info`, `Who`, `Version`, `Created`, `Path`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock ID. Generated at acquisition when left empty.
    #[serde(rename = "ID", default)]
    pub id: String,
    /// Operation that took the lock (e.g. "apply").
    #[serde(rename = "Operation", default)]
    pub operation: String,
    /// Free-form extra data supplied by the caller.
    #[serde(rename = "Info", default)]
    pub info: String,
    /// `user@host` of the lock holder.
    #[serde(rename = "Who", default)]
    pub who: String,
    /// Version of the tool holding the lock.
    #[serde(rename = "Version", default)]
    pub version: String,
    /// When the lock was taken (UTC).
    #[serde(rename = "Created", default = "Utc::now")]
    pub created: DateTime<Utc>,
    /// Canonical address of the locked state, stamped by the backend.
    #[serde(rename = "Path", default)]
    pub path: String,
}

impl LockInfo {
    /// Create lock metadata for the current user and host with a fresh ID.
    pub fn new() -> Self {
        Self {
            id: new_lock_id(),
            operation: String::new(),
            info: String::new(),
            who: current_who(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now().trunc_subsecs(6),
            path: String::new(),
        }
    }

    /// Fill in a random ID if none was supplied, returning the ID.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = new_lock_id();
        }
        &self.id
    }

    /// Record where and when the lock is being taken.
    pub fn stamp(&mut self, path: &str) {
        self.path = path.to_string();
        self.created = Utc::now().trunc_subsecs(6);
    }

    pub fn marshal(&self) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec(self).map_err(|e| {
            StateError::Serialization(format!("Failed to serialize lock info: {}", e))
        })
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, StateError> {
        serde_json::from_slice(data)
            .map_err(|e| StateError::Serialization(format!("Failed to parse lock info: {}", e)))
    }

    /// Base64 of the JSON form, for side channels that only hold strings.
    pub fn to_base64(&self) -> Result<String, StateError> {
        Ok(BASE64.encode(self.marshal()?))
    }

    pub fn from_base64(raw: &str) -> Result<Self, StateError> {
        let data = BASE64.decode(raw.trim()).map_err(|e| {
            StateError::Serialization(format!("Failed to decode lock info: {}", e))
        })?;
        Self::unmarshal(&data)
    }
}

impl Default for LockInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  ID:        {}", self.id)?;
        writeln!(f, "  Path:      {}", self.path)?;
        writeln!(f, "  Operation: {}", self.operation)?;
        writeln!(f, "  Who:       {}", self.who)?;
        writeln!(f, "  Version:   {}", self.version)?;
        writeln!(f, "  Created:   {}", self.created)?;
        write!(f, "  Info:      {}", self.info)
    }
}

fn new_lock_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn current_who() -> String {
    let user = ["USER", "USERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string());
    let host = ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

/// Mutual exclusion on top of a [`StateStore`].
///
/// Only backends that can actually exclude other writers implement this, so
/// callers learn from the type whether locking is available.
///
/// Lock state is per instance: two instances on the same path behave like two
/// independent clients.
#[async_trait]
pub trait Locker: StateStore {
    /// Acquire the lock, persisting `info` next to the state.
    ///
    /// Waits at most a short, bounded time. Fails with a `LockError` when the
    /// lock is already held by this instance, held by someone else (with the
    /// holder's metadata attached when it can be read), or was lost.
    ///
    /// # Returns
    /// The ID to pass to [`Locker::unlock`].
    async fn lock(&self, info: LockInfo) -> Result<String, StateError>;

    /// Release the lock.
    ///
    /// Succeeds without contacting the backend when nothing is held. Local
    /// lock state is always cleared; every failed release step is reported.
    async fn unlock(&self, id: &str) -> Result<(), StateError>;
}
