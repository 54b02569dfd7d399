//! Kubernetes API server backed store.
//!
//! Updates are JSON merge patches that carry `metadata.resourceVersion`. The
//! API server treats that field as a precondition and answers a stale write
//! with 409, which maps to [`StoreError::Conflict`]. Merge patches touch only
//! the fields this crate owns, so other fields written by other clients are
//! left alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

use super::{
    ClusterStore, Namespace, Resource, ResourceApi, ResourceKey, ResourceKind, ResourceVersion,
    ServiceAccount, StoreConnector, StoreError,
};
use crate::runner::ReadinessProbe;

/// Field manager recorded on every patch.
const FIELD_MANAGER: &str = "automount-guard";

/// Store backed by a live cluster.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_owned()),
            ..PatchParams::default()
        }
    }
}

/// Translate a client error into the store taxonomy.
fn map_error(kind: ResourceKind, key: &ResourceKey, stale: Option<&str>, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound {
            kind,
            key: key.clone(),
        },
        kube::Error::Api(resp) if resp.code == 409 => StoreError::Conflict {
            kind,
            key: key.clone(),
            stale: stale.unwrap_or_default().to_owned(),
        },
        other => StoreError::Other(other.to_string()),
    }
}

fn version_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<ResourceVersion> {
    meta.resource_version.clone().map(ResourceVersion::new)
}

fn namespace_from(raw: corev1::Namespace) -> Namespace {
    Namespace {
        version: version_of(&raw.metadata),
        name: raw.metadata.name.unwrap_or_default(),
        annotations: raw.metadata.annotations.unwrap_or_default(),
    }
}

fn service_account_from(raw: corev1::ServiceAccount) -> ServiceAccount {
    ServiceAccount {
        version: version_of(&raw.metadata),
        namespace: raw.metadata.namespace.unwrap_or_default(),
        name: raw.metadata.name.unwrap_or_default(),
        automount_token: raw.automount_service_account_token,
    }
}

/// Require a version so the patch is conditional rather than a blind write.
fn require_version<R: Resource>(resource: &R) -> Result<String, StoreError> {
    resource
        .version()
        .map(|v| v.as_str().to_owned())
        .ok_or_else(|| {
            StoreError::Other(format!(
                "{} {} has no resource version; refusing unconditional write",
                R::KIND,
                resource.key()
            ))
        })
}

#[async_trait]
impl ResourceApi<Namespace> for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<Namespace, StoreError> {
        let api: Api<corev1::Namespace> = Api::all(self.client.clone());
        let raw = api
            .get(&key.name)
            .await
            .map_err(|e| map_error(ResourceKind::Namespace, key, None, e))?;
        Ok(namespace_from(raw))
    }

    async fn update(&self, resource: &Namespace) -> Result<Namespace, StoreError> {
        let key = resource.key();
        let version = require_version(resource)?;
        let body = serde_json::json!({
            "metadata": {
                "resourceVersion": version,
                "annotations": resource.annotations,
            }
        });
        debug!(namespace = %key, version = %version, "patching namespace");

        let api: Api<corev1::Namespace> = Api::all(self.client.clone());
        let raw = api
            .patch(&key.name, &Self::patch_params(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_error(ResourceKind::Namespace, &key, Some(version.as_str()), e))?;
        Ok(namespace_from(raw))
    }
}

#[async_trait]
impl ResourceApi<ServiceAccount> for KubeStore {
    async fn get(&self, key: &ResourceKey) -> Result<ServiceAccount, StoreError> {
        let namespace = key.namespace.as_deref().unwrap_or_default();
        let api: Api<corev1::ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let raw = api
            .get(&key.name)
            .await
            .map_err(|e| map_error(ResourceKind::ServiceAccount, key, None, e))?;
        Ok(service_account_from(raw))
    }

    async fn update(&self, resource: &ServiceAccount) -> Result<ServiceAccount, StoreError> {
        let key = resource.key();
        let version = require_version(resource)?;
        let body = serde_json::json!({
            "metadata": { "resourceVersion": version },
            "automountServiceAccountToken": resource.automount_token,
        });
        debug!(service_account = %key, version = %version, "patching service account");

        let api: Api<corev1::ServiceAccount> =
            Api::namespaced(self.client.clone(), &resource.namespace);
        let raw = api
            .patch(&resource.name, &Self::patch_params(), &Patch::Merge(&body))
            .await
            .map_err(|e| map_error(ResourceKind::ServiceAccount, &key, Some(version.as_str()), e))?;
        Ok(service_account_from(raw))
    }
}

/// Builds [`KubeStore`] clients from an admin kubeconfig.
#[derive(Debug, Clone)]
pub struct KubeConnector {
    kubeconfig: PathBuf,
}

impl KubeConnector {
    /// Connector for the kubeconfig at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: path.into(),
        }
    }

    /// Path of the kubeconfig this connector reads.
    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    async fn client(&self) -> Result<Client, StoreError> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig).map_err(|e| {
            StoreError::Other(format!(
                "failed to read kubeconfig {}: {e}",
                self.kubeconfig.display()
            ))
        })?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| StoreError::Other(format!("invalid kubeconfig: {e}")))?;
        Client::try_from(config).map_err(|e| StoreError::Other(e.to_string()))
    }
}

#[async_trait]
impl StoreConnector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterStore>, StoreError> {
        let client = self.client().await?;
        Ok(Arc::new(KubeStore::new(client)))
    }
}

#[async_trait]
impl ReadinessProbe for KubeConnector {
    async fn probe(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        let info = client
            .apiserver_version()
            .await
            .map_err(|e| StoreError::Other(e.to_string()))?;
        debug!(version = %info.git_version, "api server answered");
        Ok(())
    }
}
