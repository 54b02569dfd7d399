//! Versioned resource store abstraction.
//!
//! The store is the only shared mutable state this crate touches. Every
//! resource carries an opaque [`ResourceVersion`] assigned by the store; an
//! update whose version no longer matches the stored revision is rejected
//! with [`StoreError::Conflict`].
//!
//! Two implementations:
//! - [`memory::InMemoryStore`]: compare-and-swap map with call counters
//! - [`apiserver::KubeStore`]: Kubernetes API server via `kube`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub mod apiserver;
pub mod memory;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque revision token owned by the store.
///
/// Callers hold copies only to prove freshness on update; they never
/// construct or increment one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Wrap a store-issued version string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw version string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind discriminator used in logs, errors, and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Cluster-scoped namespace object.
    Namespace,
    /// Namespaced service account.
    ServiceAccount,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace => f.write_str("namespace"),
            Self::ServiceAccount => f.write_str("serviceaccount"),
        }
    }
}

/// Address of a resource within the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Owning namespace, `None` for cluster-scoped kinds.
    pub namespace: Option<String>,
    /// Resource name.
    pub name: String,
}

impl ResourceKey {
    /// Key for a cluster-scoped resource.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Common surface of every resource kind the store serves.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind of this resource.
    const KIND: ResourceKind;

    /// Address used to re-fetch this resource.
    fn key(&self) -> ResourceKey;

    /// Version the in-memory copy was read at, if it was ever stored.
    fn version(&self) -> Option<&ResourceVersion>;
}

/// A namespace and its annotation set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// Unique namespace name.
    pub name: String,
    /// Annotations; always present, possibly empty.
    pub annotations: BTreeMap<String, String>,
    /// Revision this copy was read at.
    pub version: Option<ResourceVersion>,
}

impl Namespace {
    /// A namespace with no annotations that has not been stored yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: BTreeMap::new(),
            version: None,
        }
    }

    /// Whether `key` is present, regardless of its value.
    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations.contains_key(key)
    }
}

impl Resource for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;

    fn key(&self) -> ResourceKey {
        ResourceKey::cluster(&self.name)
    }

    fn version(&self) -> Option<&ResourceVersion> {
        self.version.as_ref()
    }
}

/// A service account and the token automount flag this crate manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    /// Owning namespace.
    pub namespace: String,
    /// Service account name.
    pub name: String,
    /// `None` means the field is unset and the cluster default (mount) applies.
    pub automount_token: Option<bool>,
    /// Revision this copy was read at.
    pub version: Option<ResourceVersion>,
}

impl ServiceAccount {
    /// A service account with the automount flag unset.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            automount_token: None,
            version: None,
        }
    }
}

impl Resource for ServiceAccount {
    const KIND: ResourceKind = ResourceKind::ServiceAccount;

    fn key(&self) -> ResourceKey {
        ResourceKey::namespaced(&self.namespace, &self.name)
    }

    fn version(&self) -> Option<&ResourceVersion> {
        self.version.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed resource does not exist.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource address.
        key: ResourceKey,
    },
    /// The write was based on a stale revision.
    #[error("{kind} {key} was modified concurrently (stale version {stale})")]
    Conflict {
        /// Resource kind.
        kind: ResourceKind,
        /// Resource address.
        key: ResourceKey,
        /// Version the rejected write was based on.
        stale: String,
    },
    /// Transport, authorization, or any other failure.
    #[error("store request failed: {0}")]
    Other(String),
}

impl StoreError {
    /// Returns `true` for the stale-version signal.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` when the addressed resource is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Get/Update for one resource kind.
#[async_trait]
pub trait ResourceApi<R: Resource>: Send + Sync {
    /// Fetch the latest revision of the resource at `key`.
    async fn get(&self, key: &ResourceKey) -> Result<R, StoreError>;

    /// Write `resource`, returning the stored copy with its new version.
    ///
    /// Fails with [`StoreError::Conflict`] when `resource.version()` is not
    /// the current revision.
    async fn update(&self, resource: &R) -> Result<R, StoreError>;
}

/// A store serving every kind the hardening sweep touches.
pub trait ClusterStore: ResourceApi<Namespace> + ResourceApi<ServiceAccount> {}

impl<T> ClusterStore for T where T: ResourceApi<Namespace> + ResourceApi<ServiceAccount> {}

/// Builds a store client once the control plane is reachable.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Construct a connected store.
    async fn connect(&self) -> Result<Arc<dyn ClusterStore>, StoreError>;
}
