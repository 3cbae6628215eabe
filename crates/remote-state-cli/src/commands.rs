use std::path::Path;

use anyhow::{bail, Context, Result};
use remote_state_core::{LockInfo, StateError, StateStore};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::backend::Backend;

pub async fn pull(backend: &Backend, out: Option<&Path>) -> Result<()> {
    let Some(payload) = backend.store().get().await.context("Failed to read remote state")? else {
        info!("No remote state found");
        return Ok(());
    };
    info!("Pulled {} bytes (md5 {})", payload.data.len(), payload.md5_hex());

    match out {
        Some(path) => tokio::fs::write(path, &payload.data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&payload.data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

/// Upload `file`. With a locking backend and `lock` set, the write happens
/// under the lock and the lock is released whatever the outcome.
pub async fn push(backend: &Backend, file: &Path, lock: bool) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let store = backend.store();

    let Some(locker) = backend.locker().filter(|_| lock) else {
        if lock {
            warn!("The {} backend does not support locking", store.backend_name());
        }
        write_state(store, &data).await?;
        info!("Pushed {} bytes", data.len());
        return Ok(());
    };

    let mut lock_info = LockInfo::new();
    lock_info.operation = "push".to_string();
    let id = locker
        .lock(lock_info)
        .await
        .context("Failed to lock remote state")?;
    info!("Acquired lock {}", id);

    let written = write_state(store, &data).await;
    let unlocked = locker.unlock(&id).await;

    written.context("Failed to write remote state")?;
    unlocked.with_context(|| format!("Failed to unlock remote state (lock id {})", id))?;
    info!("Pushed {} bytes", data.len());
    Ok(())
}

/// Read before writing, so backends with a version token write against the
/// current version.
async fn write_state(store: &dyn StateStore, data: &[u8]) -> Result<(), StateError> {
    store.get().await?;
    store.put(data).await
}

pub async fn delete(backend: &Backend) -> Result<()> {
    backend
        .store()
        .delete()
        .await
        .context("Failed to delete remote state")?;
    info!("Deleted remote state");
    Ok(())
}

pub async fn lock_probe(backend: &Backend) -> Result<()> {
    let Some(locker) = backend.locker() else {
        bail!(
            "The {} backend does not support locking",
            backend.store().backend_name()
        );
    };

    let mut lock_info = LockInfo::new();
    lock_info.operation = "lock-probe".to_string();

    match locker.lock(lock_info).await {
        Ok(id) => {
            locker
                .unlock(&id)
                .await
                .with_context(|| format!("Failed to release probe lock {}", id))?;
            println!("Lock is free (probe lock id {})", id);
            Ok(())
        }
        Err(e) => match e.holder() {
            Some(holder) => {
                println!("State is locked:\n{}", holder);
                Ok(())
            }
            None => Err(e).context("Failed to probe the lock"),
        },
    }
}
