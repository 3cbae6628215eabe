//! Backend-agnostic checks every [`StateStore`] and [`Locker`] must pass.
//!
//! These are meant to be called from backend tests. They panic with a
//! descriptive message on the first violated expectation.

use crate::error::{LockErrorKind, StateError};
use crate::lock::{LockInfo, Locker};
use crate::payload::checksum;
use crate::store::StateStore;

/// State bytes used by the checks.
pub fn sample_state() -> Vec<u8> {
    br#"{
  "version": 4,
  "serial": 1,
  "lineage": "5f6a2c1e-0b0d-4f5e-9a55-7f0e5d2c1b3a",
  "outputs": {},
  "resources": []
}
"#
    .to_vec()
}

/// Round trip, delete, and idempotent delete.
pub async fn test_client<S: StateStore + ?Sized>(client: &S) {
    let data = sample_state();

    client.put(&data).await.expect("put");

    let payload = client
        .get()
        .await
        .expect("get")
        .expect("state missing after put");
    assert_eq!(payload.data, data, "get returned different bytes than put");
    assert_eq!(payload.md5, checksum(&data), "checksum is not the digest of the data");

    client.delete().await.expect("delete");

    let gone = client.get().await.expect("get after delete");
    assert!(gone.is_none(), "state still present after delete: {:?}", gone);

    client.delete().await.expect("delete of absent state");
}

/// Mutual exclusion between two clients on the same path.
///
/// Uses two instances because backends tie lock state to the client.
pub async fn test_remote_locks<L: Locker + ?Sized>(a: &L, b: &L) {
    let mut info_a = LockInfo::new();
    info_a.operation = "test".into();
    info_a.who = "clientA".into();

    let mut info_b = LockInfo::new();
    info_b.operation = "test".into();
    info_b.who = "clientB".into();

    // unlock without ever locking is safe
    a.unlock("").await.expect("unlock from client A before any lock");

    let id_a = a.lock(info_a.clone()).await.expect("unable to get initial lock");

    let again = a.lock(info_a.clone()).await;
    assert_eq!(
        lock_kind(&again),
        Some(LockErrorKind::AlreadyHeldLocally),
        "second lock from the same client: {:?}",
        again
    );

    match b.lock(info_b.clone()).await {
        Ok(_) => {
            let _ = a.unlock(&id_a).await;
            panic!("client B obtained lock while held by client A");
        }
        Err(err) => {
            let lock_err = err
                .as_lock_error()
                .unwrap_or_else(|| panic!("expected a lock error, got {:?}", err));
            assert_eq!(lock_err.kind, LockErrorKind::HeldByOther, "{}", err);
            let holder = lock_err
                .info
                .as_ref()
                .unwrap_or_else(|| panic!("lock error without holder info: {}", err));
            assert_eq!(holder.who, "clientA");
        }
    }

    a.unlock(&id_a).await.expect("error unlocking client A");

    let id_b = b
        .lock(info_b)
        .await
        .expect("unable to obtain lock from client B");

    b.unlock(&id_b).await.expect("error unlocking client B");

    // unlock should be repeatable
    a.unlock(&id_a)
        .await
        .expect("unlock from client A when state was not locked");
    b.unlock(&id_b).await.expect("repeated unlock from client B");
}

/// A write based on a stale read is rejected and does not advance the
/// writer's version token.
///
/// Only meaningful for backends with version tokens.
pub async fn test_stale_write_rejected<S: StateStore + ?Sized>(a: &S, b: &S) {
    a.put(b"v1").await.expect("initial put");
    a.get().await.expect("get from A");
    b.get().await.expect("get from B");

    b.put(b"v2").await.expect("put from B");

    let err = a.put(b"v3").await.expect_err("stale put from A succeeded");
    assert!(err.is_conflict(), "expected conflict, got {:?}", err);

    // the failed write must not have refreshed A's token
    let err = a.put(b"v3").await.expect_err("second stale put from A succeeded");
    assert!(err.is_conflict(), "expected conflict, got {:?}", err);

    let current = a.get().await.expect("re-read").expect("state missing");
    assert_eq!(current.data, b"v2");

    a.put(b"v3").await.expect("put after re-read");
    let current = b.get().await.expect("get from B").expect("state missing");
    assert_eq!(current.data, b"v3");
}

fn lock_kind<T>(result: &Result<T, StateError>) -> Option<LockErrorKind> {
    result
        .as_ref()
        .err()
        .and_then(|e| e.as_lock_error())
        .map(|e| e.kind)
}
