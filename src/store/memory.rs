//! In-memory versioned store.
//!
//! Every successful write bumps a store-wide counter and stamps it on the
//! written object, so versions are monotonically increasing. Writes carrying
//! any other version are rejected with [`StoreError::Conflict`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ClusterStore, Namespace, Resource, ResourceApi, ResourceKey, ResourceKind, ResourceVersion,
    ServiceAccount, StoreConnector, StoreError,
};

/// Call counts for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `get` calls, including ones that returned `NotFound`.
    pub gets: u32,
    /// `update` calls, including rejected ones.
    pub updates: u32,
    /// `update` calls rejected with a version conflict.
    pub conflicts: u32,
}

/// Per-kind call accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Namespace calls.
    pub namespaces: CallCounts,
    /// Service account calls.
    pub service_accounts: CallCounts,
}

impl StoreStats {
    /// Total updates across all kinds.
    pub fn total_updates(&self) -> u32 {
        self.namespaces
            .updates
            .saturating_add(self.service_accounts.updates)
    }

    fn counts_mut(&mut self, kind: ResourceKind) -> &mut CallCounts {
        match kind {
            ResourceKind::Namespace => &mut self.namespaces,
            ResourceKind::ServiceAccount => &mut self.service_accounts,
        }
    }
}

#[derive(Default)]
struct Inner {
    namespaces: BTreeMap<ResourceKey, Namespace>,
    service_accounts: BTreeMap<ResourceKey, ServiceAccount>,
    last_version: u64,
    stats: StoreStats,
    forced_conflicts: HashMap<(ResourceKind, ResourceKey), u32>,
}

impl Inner {
    fn next_version(&mut self) -> ResourceVersion {
        self.last_version = self.last_version.saturating_add(1);
        ResourceVersion::new(self.last_version.to_string())
    }

    /// Consume one injected conflict for `key`, if any remain.
    fn take_forced_conflict(&mut self, kind: ResourceKind, key: &ResourceKey) -> bool {
        match self.forced_conflicts.get_mut(&(kind, key.clone())) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

/// Resource kinds the in-memory store can hold.
trait Stored: Resource {
    fn table(inner: &mut Inner) -> &mut BTreeMap<ResourceKey, Self>;
    fn set_version(&mut self, version: ResourceVersion);
}

impl Stored for Namespace {
    fn table(inner: &mut Inner) -> &mut BTreeMap<ResourceKey, Self> {
        &mut inner.namespaces
    }

    fn set_version(&mut self, version: ResourceVersion) {
        self.version = Some(version);
    }
}

impl Stored for ServiceAccount {
    fn table(inner: &mut Inner) -> &mut BTreeMap<ResourceKey, Self> {
        &mut inner.service_accounts
    }

    fn set_version(&mut self, version: ResourceVersion) {
        self.version = Some(version);
    }
}

/// Compare-and-swap store held in process memory.
///
/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a namespace, assigning it a fresh version. Not counted in stats.
    pub async fn insert_namespace(&self, namespace: Namespace) -> Namespace {
        self.insert(namespace).await
    }

    /// Seed a service account, assigning it a fresh version. Not counted in stats.
    pub async fn insert_service_account(&self, account: ServiceAccount) -> ServiceAccount {
        self.insert(account).await
    }

    /// Read a namespace without touching the call counters.
    pub async fn peek_namespace(&self, name: &str) -> Option<Namespace> {
        let inner = self.inner.lock().await;
        inner.namespaces.get(&ResourceKey::cluster(name)).cloned()
    }

    /// Read a service account without touching the call counters.
    pub async fn peek_service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        let inner = self.inner.lock().await;
        inner
            .service_accounts
            .get(&ResourceKey::namespaced(namespace, name))
            .cloned()
    }

    /// Apply `change` as a concurrent writer would, bumping the version.
    ///
    /// Returns `false` if the namespace does not exist.
    pub async fn modify_namespace(&self, name: &str, change: impl FnOnce(&mut Namespace)) -> bool {
        self.modify::<Namespace>(&ResourceKey::cluster(name), change)
            .await
    }

    /// Apply `change` as a concurrent writer would, bumping the version.
    ///
    /// Returns `false` if the service account does not exist.
    pub async fn modify_service_account(
        &self,
        namespace: &str,
        name: &str,
        change: impl FnOnce(&mut ServiceAccount),
    ) -> bool {
        self.modify::<ServiceAccount>(&ResourceKey::namespaced(namespace, name), change)
            .await
    }

    /// Make the next `count` updates of `key` fail with a conflict, bumping
    /// the stored version each time as if another writer got there first.
    pub async fn inject_conflicts(&self, kind: ResourceKind, key: ResourceKey, count: u32) {
        let mut inner = self.inner.lock().await;
        inner.forced_conflicts.insert((kind, key), count);
    }

    /// Snapshot of the call counters.
    pub async fn stats(&self) -> StoreStats {
        self.inner.lock().await.stats
    }

    /// Zero the call counters.
    pub async fn reset_stats(&self) {
        self.inner.lock().await.stats = StoreStats::default();
    }

    async fn insert<R: Stored>(&self, mut resource: R) -> R {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        resource.set_version(version);
        R::table(&mut inner).insert(resource.key(), resource.clone());
        resource
    }

    async fn modify<R: Stored>(&self, key: &ResourceKey, change: impl FnOnce(&mut R)) -> bool {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        match R::table(&mut inner).get_mut(key) {
            Some(stored) => {
                change(stored);
                stored.set_version(version);
                true
            }
            None => false,
        }
    }

    async fn get_stored<R: Stored>(&self, key: &ResourceKey) -> Result<R, StoreError> {
        let mut inner = self.inner.lock().await;
        let counts = inner.stats.counts_mut(R::KIND);
        counts.gets = counts.gets.saturating_add(1);
        R::table(&mut inner)
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                key: key.clone(),
            })
    }

    async fn update_stored<R: Stored>(&self, resource: &R) -> Result<R, StoreError> {
        let key = resource.key();
        let mut inner = self.inner.lock().await;
        let counts = inner.stats.counts_mut(R::KIND);
        counts.updates = counts.updates.saturating_add(1);

        let current = R::table(&mut inner)
            .get(&key)
            .and_then(|stored| stored.version().cloned())
            .ok_or_else(|| StoreError::NotFound {
                kind: R::KIND,
                key: key.clone(),
            })?;

        let stale = resource.version() != Some(&current);
        if stale || inner.take_forced_conflict(R::KIND, &key) {
            if !stale {
                // Injected conflict: another writer moved the object on.
                let bumped = inner.next_version();
                if let Some(stored) = R::table(&mut inner).get_mut(&key) {
                    stored.set_version(bumped);
                }
            }
            let counts = inner.stats.counts_mut(R::KIND);
            counts.conflicts = counts.conflicts.saturating_add(1);
            return Err(StoreError::Conflict {
                kind: R::KIND,
                key,
                stale: resource
                    .version()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            });
        }

        let mut written = resource.clone();
        written.set_version(inner.next_version());
        R::table(&mut inner).insert(key, written.clone());
        Ok(written)
    }
}

#[async_trait]
impl ResourceApi<Namespace> for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<Namespace, StoreError> {
        self.get_stored(key).await
    }

    async fn update(&self, resource: &Namespace) -> Result<Namespace, StoreError> {
        self.update_stored(resource).await
    }
}

#[async_trait]
impl ResourceApi<ServiceAccount> for InMemoryStore {
    async fn get(&self, key: &ResourceKey) -> Result<ServiceAccount, StoreError> {
        self.get_stored(key).await
    }

    async fn update(&self, resource: &ServiceAccount) -> Result<ServiceAccount, StoreError> {
        self.update_stored(resource).await
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(&self) -> Result<Arc<dyn ClusterStore>, StoreError> {
        Ok(Arc::new(self.clone()))
    }
}
