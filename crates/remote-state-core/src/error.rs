use std::fmt;

use thiserror::Error;

use crate::lock::LockInfo;

/// Errors that can occur in the remote state layer.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("state was modified concurrently: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Lock(Box<LockError>),

    #[error("{}", format_errors(.0))]
    Multiple(Vec<StateError>),
}

impl StateError {
    /// True when a conditional write was rejected.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict(_))
    }

    /// The lock error carried by this error, if any.
    ///
    /// Looks through aggregated errors so a lock failure reported together
    /// with a cleanup failure is still found.
    pub fn as_lock_error(&self) -> Option<&LockError> {
        match self {
            StateError::Lock(err) => Some(err),
            StateError::Multiple(errors) => errors.iter().find_map(|e| e.as_lock_error()),
            _ => None,
        }
    }

    /// Metadata of the party holding the lock, when the failure carries it.
    pub fn holder(&self) -> Option<&LockInfo> {
        self.as_lock_error().and_then(|e| e.info.as_ref())
    }
}

impl From<LockError> for StateError {
    fn from(err: LockError) -> Self {
        StateError::Lock(Box::new(err))
    }
}

fn format_errors(errors: &[StateError]) -> String {
    let points: Vec<String> = errors.iter().map(|e| format!("\t* {}", e)).collect();
    format!("{} errors occurred:\n{}", errors.len(), points.join("\n"))
}

/// Accumulates failures from multi-step operations.
///
/// Steps that must all be attempted push their errors here instead of
/// returning early; `into_result` then yields nothing, the lone error, or a
/// `StateError::Multiple` holding all of them.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<StateError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: StateError) {
        match err {
            StateError::Multiple(nested) => self.errors.extend(nested),
            other => self.errors.push(other),
        }
    }

    /// Record the error of a step, if it failed.
    pub fn check<T>(&mut self, result: Result<T, StateError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> Result<(), StateError> {
        match self.into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn into_error(mut self) -> Option<StateError> {
        match self.errors.len() {
            0 => None,
            1 => self.errors.pop(),
            _ => Some(StateError::Multiple(self.errors)),
        }
    }
}

/// Why a lock operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// Another party holds the lock.
    HeldByOther,
    /// This client already holds the lock; `lock` was called twice.
    AlreadyHeldLocally,
    /// A lock acquired earlier is no longer valid.
    Lost,
    /// The lock id passed to `unlock` is not the one held.
    IdMismatch,
    /// The backend failed while acquiring or releasing.
    Backend,
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LockErrorKind::HeldByOther => "state is locked by another client",
            LockErrorKind::AlreadyHeldLocally => "state is already locked by this client",
            LockErrorKind::Lost => "state lock was lost",
            LockErrorKind::IdMismatch => "lock id does not match the held lock",
            LockErrorKind::Backend => "error acquiring the state lock",
        };
        f.write_str(msg)
    }
}

/// A failed lock operation.
///
/// When contention is the cause, `info` holds the metadata of the current
/// holder as read back from the backend. If that read failed too, its error
/// is kept in `err` next to any primary failure.
#[derive(Debug)]
pub struct LockError {
    pub kind: LockErrorKind,
    pub err: Option<Box<StateError>>,
    pub info: Option<LockInfo>,
}

impl LockError {
    pub fn new(kind: LockErrorKind) -> Self {
        Self {
            kind,
            err: None,
            info: None,
        }
    }

    pub fn held_by_other(info: Option<LockInfo>) -> Self {
        Self {
            info,
            ..Self::new(LockErrorKind::HeldByOther)
        }
    }

    pub fn already_held(path: &str) -> Self {
        Self::new(LockErrorKind::AlreadyHeldLocally)
            .with_err(StateError::InvalidArgument(format!("state {:?} already locked", path)))
    }

    pub fn lost(path: &str) -> Self {
        Self::new(LockErrorKind::Lost).with_err(StateError::Transport(format!(
            "lock on {:?} is no longer held",
            path
        )))
    }

    pub fn backend(err: StateError) -> Self {
        Self::new(LockErrorKind::Backend).with_err(err)
    }

    pub fn with_err(mut self, err: StateError) -> Self {
        self.err = Some(Box::new(err));
        self
    }

    /// Attach another failure, keeping any already recorded.
    pub fn push_err(&mut self, err: StateError) {
        let mut errors = ErrorList::new();
        if let Some(existing) = self.err.take() {
            errors.push(*existing);
        }
        errors.push(err);
        self.err = errors.into_error().map(Box::new);
    }

    pub fn with_info(mut self, info: LockInfo) -> Self {
        self.info = Some(info);
        self
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(err) = &self.err {
            write!(f, ": {}", err)?;
        }
        if let Some(info) = &self.info {
            write!(f, "\n\nLock Info:\n{}", info)?;
        }
        Ok(())
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.err
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
