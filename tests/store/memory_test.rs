//! Tests for `InMemoryStore`: compare-and-swap semantics and call accounting.

use automount_guard::store::memory::InMemoryStore;
use automount_guard::store::{
    Namespace, Resource, ResourceApi, ResourceKey, ServiceAccount, StoreConnector, StoreError,
};

#[tokio::test]
async fn stale_write_is_rejected() {
    let store = InMemoryStore::new();
    let stale = store.insert_namespace(Namespace::new("kube-system")).await;
    let fresh = ResourceApi::<Namespace>::update(&store, &stale)
        .await
        .expect("first write");

    let err = ResourceApi::<Namespace>::update(&store, &stale)
        .await
        .expect_err("second write is stale");
    assert!(err.is_conflict());
    assert!(matches!(err, StoreError::Conflict { ref stale, .. } if !stale.is_empty()));

    ResourceApi::<Namespace>::update(&store, &fresh)
        .await
        .expect("fresh copy is accepted");
}

#[tokio::test]
async fn unversioned_write_conflicts() {
    let store = InMemoryStore::new();
    store.insert_namespace(Namespace::new("default")).await;

    let err = ResourceApi::<Namespace>::update(&store, &Namespace::new("default"))
        .await
        .expect_err("never read from the store");
    assert!(err.is_conflict());
}

#[tokio::test]
async fn get_missing_is_not_found() {
    let store = InMemoryStore::new();
    let err = ResourceApi::<ServiceAccount>::get(
        &store,
        &ResourceKey::namespaced("kube-system", "default"),
    )
    .await
    .expect_err("empty store");

    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "serviceaccount kube-system/default not found");
    assert_eq!(store.stats().await.service_accounts.gets, 1);
}

#[tokio::test]
async fn kinds_are_stored_separately() {
    let store = InMemoryStore::new();
    store.insert_namespace(Namespace::new("default")).await;

    let err = ResourceApi::<ServiceAccount>::get(
        &store,
        &ResourceKey::namespaced("default", "default"),
    )
    .await
    .expect_err("only the namespace exists");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn peek_and_seed_are_not_counted() {
    let store = InMemoryStore::new();
    store.insert_namespace(Namespace::new("default")).await;
    store.peek_namespace("default").await;
    store.peek_service_account("default", "default").await;

    assert_eq!(store.stats().await, Default::default());
}

#[tokio::test]
async fn external_modification_bumps_version() {
    let store = InMemoryStore::new();
    let before = store
        .insert_service_account(ServiceAccount::new("kube-public", "default"))
        .await;

    assert!(
        store
            .modify_service_account("kube-public", "default", |sa| {
                sa.automount_token = Some(true);
            })
            .await
    );
    assert!(!store.modify_namespace("missing", |_| {}).await);

    let after = store
        .peek_service_account("kube-public", "default")
        .await
        .expect("exists");
    assert_ne!(after.version(), before.version());
    assert_eq!(after.automount_token, Some(true));
}

#[tokio::test]
async fn connector_shares_state() {
    let store = InMemoryStore::new();
    store.insert_namespace(Namespace::new("kube-system")).await;

    let connected = store.connect().await.expect("in-memory connect");
    let ns = ResourceApi::<Namespace>::get(connected.as_ref(), &ResourceKey::cluster("kube-system"))
        .await
        .expect("visible through the connector");

    assert_eq!(ns.key(), ResourceKey::cluster("kube-system"));
    assert_eq!(store.stats().await.namespaces.gets, 1);
}
