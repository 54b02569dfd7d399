//! Per-namespace service account hardening.
//!
//! A namespace moves `Unchecked -> Hardening -> Hardened`, or straight to
//! `Hardened` when it already carries the marker annotation. Hardening is two
//! independent retried updates: the service account first, then the marker
//! on the namespace. They are not atomic together. A crash between them
//! leaves the account locked down without a marker, and the next run locks
//! it down again before writing the marker.

use tracing::info;

use crate::config::HardeningConfig;
use crate::store::{ClusterStore, Namespace, ResourceApi, ResourceKey, ServiceAccount, StoreError};
use crate::updater::{update_with_retry, Backoff, UpdateError};

/// Result of hardening one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardenOutcome {
    /// The marker was already present; nothing was written.
    AlreadyHardened,
    /// The service account and the namespace marker were both written.
    Hardened,
}

/// Failures while hardening one namespace. All of them are fatal to the sweep.
#[derive(Debug, thiserror::Error)]
pub enum HardenError {
    /// The namespace has no service account to harden.
    #[error("service-account: {namespace} has no {name} service account")]
    MissingServiceAccount {
        /// Namespace being hardened.
        namespace: String,
        /// Expected service account name.
        name: String,
    },
    /// Fetching the service account failed for a reason other than absence.
    #[error("service-account: get {namespace}/{name}: {source}")]
    Lookup {
        /// Namespace being hardened.
        namespace: String,
        /// Service account name.
        name: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
    /// The service account update gave up.
    #[error("service-account: update service account in {namespace}: {source}")]
    ServiceAccountUpdate {
        /// Namespace being hardened.
        namespace: String,
        /// Underlying update failure.
        #[source]
        source: UpdateError,
    },
    /// The marker annotation update gave up.
    #[error("service-account: annotate namespace {namespace}: {source}")]
    NamespaceUpdate {
        /// Namespace being hardened.
        namespace: String,
        /// Underlying update failure.
        #[source]
        source: UpdateError,
    },
}

/// Locks down a namespace's service account and records that it did so.
#[derive(Debug, Clone)]
pub struct Hardener {
    service_account: String,
    annotation_key: String,
    annotation_value: String,
    backoff: Backoff,
}

impl Hardener {
    /// Build a hardener from config and a conflict retry policy.
    pub fn new(config: &HardeningConfig, backoff: Backoff) -> Self {
        Self {
            service_account: config.service_account.clone(),
            annotation_key: config.annotation_key.clone(),
            annotation_value: config.annotation_value.clone(),
            backoff,
        }
    }

    /// Marker annotation key.
    pub fn annotation_key(&self) -> &str {
        &self.annotation_key
    }

    /// Whether `namespace` still lacks the marker.
    pub fn needs_hardening(&self, namespace: &Namespace) -> bool {
        !namespace.has_annotation(&self.annotation_key)
    }

    /// Harden one namespace.
    ///
    /// Performs no store calls when the marker is already present.
    ///
    /// # Errors
    ///
    /// Returns a [`HardenError`] when the service account is missing or either
    /// update fails. The caller should treat every error as fatal.
    pub async fn harden<S>(
        &self,
        store: &S,
        namespace: Namespace,
    ) -> Result<HardenOutcome, HardenError>
    where
        S: ClusterStore + ?Sized,
    {
        if !self.needs_hardening(&namespace) {
            info!(namespace = %namespace.name, "service account already hardened");
            return Ok(HardenOutcome::AlreadyHardened);
        }

        let ns_name = namespace.name.clone();
        let key = ResourceKey::namespaced(&ns_name, &self.service_account);
        let account = ResourceApi::<ServiceAccount>::get(store, &key)
            .await
            .map_err(|source| match source {
                StoreError::NotFound { .. } => HardenError::MissingServiceAccount {
                    namespace: ns_name.clone(),
                    name: self.service_account.clone(),
                },
                source => HardenError::Lookup {
                    namespace: ns_name.clone(),
                    name: self.service_account.clone(),
                    source,
                },
            })?;

        info!(namespace = %ns_name, service_account = %self.service_account, "updating service account");
        update_with_retry(store, account, disable_automount, &self.backoff)
            .await
            .map_err(|source| HardenError::ServiceAccountUpdate {
                namespace: ns_name.clone(),
                source,
            })?;

        update_with_retry(
            store,
            namespace,
            |ns: &mut Namespace| {
                ns.annotations
                    .insert(self.annotation_key.clone(), self.annotation_value.clone());
            },
            &self.backoff,
        )
        .await
        .map_err(|source| HardenError::NamespaceUpdate {
            namespace: ns_name.clone(),
            source,
        })?;

        info!(namespace = %ns_name, annotation = %self.annotation_key, "namespace marked as hardened");
        Ok(HardenOutcome::Hardened)
    }
}

/// Explicitly disable token automounting; an unset flag means "mount".
fn disable_automount(account: &mut ServiceAccount) {
    account.automount_token = Some(false);
}
