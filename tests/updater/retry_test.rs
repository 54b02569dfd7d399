//! Tests for `update_with_retry`: conflict refresh, re-apply, and exhaustion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use automount_guard::store::memory::InMemoryStore;
use automount_guard::store::{
    Namespace, Resource, ResourceApi, ResourceKey, ResourceKind, ResourceVersion, ServiceAccount,
    StoreError,
};
use automount_guard::updater::{update_with_retry, Backoff, UpdateError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn backoff(steps: u32) -> Backoff {
    Backoff {
        steps,
        ..Backoff::default()
    }
}

fn disable(account: &mut ServiceAccount) {
    account.automount_token = Some(false);
}

/// Always conflicts on write; refresh fails with a transport error.
struct BrokenRefresh {
    updates: AtomicU32,
}

#[async_trait]
impl ResourceApi<ServiceAccount> for BrokenRefresh {
    async fn get(&self, _key: &ResourceKey) -> Result<ServiceAccount, StoreError> {
        Err(StoreError::Other("connection reset".to_owned()))
    }

    async fn update(&self, resource: &ServiceAccount) -> Result<ServiceAccount, StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Conflict {
            kind: ResourceKind::ServiceAccount,
            key: resource.key(),
            stale: "1".to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Success paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_write_succeeds_without_refresh() {
    let store = InMemoryStore::new();
    let account = store
        .insert_service_account(ServiceAccount::new("kube-system", "default"))
        .await;

    let written = update_with_retry(&store, account, disable, &backoff(4))
        .await
        .expect("update should succeed");

    assert_eq!(written.automount_token, Some(false));
    let stats = store.stats().await.service_accounts;
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.gets, 0);
}

#[tokio::test(start_paused = true)]
async fn k_conflicts_cost_k_refreshes_and_k_plus_one_writes() {
    let store = InMemoryStore::new();
    let account = store
        .insert_service_account(ServiceAccount::new("kube-system", "default"))
        .await;
    store
        .inject_conflicts(ResourceKind::ServiceAccount, account.key(), 3)
        .await;

    let mutations = AtomicU32::new(0);
    let written = update_with_retry(
        &store,
        account,
        |sa: &mut ServiceAccount| {
            mutations.fetch_add(1, Ordering::SeqCst);
            sa.automount_token = Some(false);
        },
        &backoff(5),
    )
    .await
    .expect("fourth write should succeed");

    let stats = store.stats().await.service_accounts;
    assert_eq!(stats.gets, 3, "one refresh per conflict");
    assert_eq!(stats.updates, 4, "conflicts plus the final write");
    assert_eq!(stats.conflicts, 3);
    assert_eq!(mutations.load(Ordering::SeqCst), 4, "mutation re-applied after each refresh");

    let stored = store
        .peek_service_account("kube-system", "default")
        .await
        .expect("account exists");
    assert_eq!(stored, written);
    assert_eq!(stored.automount_token, Some(false));
}

#[tokio::test(start_paused = true)]
async fn refreshed_state_from_concurrent_writer_is_kept() {
    let store = InMemoryStore::new();
    let stale = store.insert_namespace(Namespace::new("kube-public")).await;

    // Another client annotates the namespace after we read it.
    assert!(
        store
            .modify_namespace("kube-public", |ns| {
                ns.annotations
                    .insert("owner".to_owned(), "someone-else".to_owned());
            })
            .await
    );

    let written = update_with_retry(
        &store,
        stale,
        |ns: &mut Namespace| {
            ns.annotations
                .insert("service-account.rke2.io".to_owned(), "resolved".to_owned());
        },
        &backoff(4),
    )
    .await
    .expect("retry should succeed after refresh");

    assert_eq!(
        written.annotations.get("owner").map(String::as_str),
        Some("someone-else")
    );
    assert!(written.has_annotation("service-account.rke2.io"));

    let stats = store.stats().await.namespaces;
    assert_eq!(stats.gets, 1);
    assert_eq!(stats.updates, 2);
}

#[tokio::test(start_paused = true)]
async fn retries_sleep_between_attempts() {
    let store = InMemoryStore::new();
    let account = store
        .insert_service_account(ServiceAccount::new("default", "default"))
        .await;
    store
        .inject_conflicts(ResourceKind::ServiceAccount, account.key(), 2)
        .await;

    let started = tokio::time::Instant::now();
    update_with_retry(&store, account, disable, &backoff(4))
        .await
        .expect("third write should succeed");

    // 10ms + 50ms before jitter.
    assert!(started.elapsed() >= Duration::from_millis(60));
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn permanent_conflict_exhausts_attempts() {
    let store = InMemoryStore::new();
    let account = store
        .insert_service_account(ServiceAccount::new("kube-system", "default"))
        .await;
    store
        .inject_conflicts(ResourceKind::ServiceAccount, account.key(), u32::MAX)
        .await;

    let err = update_with_retry(&store, account, disable, &backoff(3))
        .await
        .expect_err("all attempts conflict");

    match err {
        UpdateError::RetryExhausted {
            kind,
            attempts,
            last,
            ..
        } => {
            assert_eq!(kind, ResourceKind::ServiceAccount);
            assert_eq!(attempts, 3);
            assert!(last.is_conflict());
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }

    let stats = store.stats().await.service_accounts;
    assert_eq!(stats.updates, 3);
    assert_eq!(stats.gets, 2, "no refresh after the final attempt");

    // Nothing keeps running in the background.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.stats().await.service_accounts, stats);
}

#[tokio::test(start_paused = true)]
async fn non_conflict_error_is_not_retried() {
    let store = InMemoryStore::new();
    let mut ghost = ServiceAccount::new("kube-system", "default");
    ghost.version = Some(ResourceVersion::new("7"));

    let err = update_with_retry(&store, ghost, disable, &backoff(4))
        .await
        .expect_err("missing resource");

    assert!(matches!(err, UpdateError::Store(ref e) if e.is_not_found()));
    let stats = store.stats().await.service_accounts;
    assert_eq!(stats.updates, 1);
    assert_eq!(stats.gets, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_ends_the_loop() {
    let api = BrokenRefresh {
        updates: AtomicU32::new(0),
    };
    let mut account = ServiceAccount::new("kube-system", "default");
    account.version = Some(ResourceVersion::new("1"));

    let err = update_with_retry(&api, account, disable, &backoff(4))
        .await
        .expect_err("refresh fails");

    assert!(matches!(err, UpdateError::Store(StoreError::Other(_))));
    assert_eq!(api.updates.load(Ordering::SeqCst), 1);
}
