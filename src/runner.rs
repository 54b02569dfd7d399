//! Readiness-gated background sweep.
//!
//! [`HardeningRunner::start`] returns as soon as the sweep is spawned. The
//! spawned task waits for the one-shot [`ReadinessSignal`], connects to the
//! store, then hardens each configured namespace in order. The first error
//! ends the sweep; the caller decides whether that ends the process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GuardConfig;
use crate::hardener::{HardenError, HardenOutcome, Hardener};
use crate::store::{ClusterStore, Namespace, ResourceApi, ResourceKey, StoreConnector, StoreError};
use crate::updater::Backoff;

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Create a connected trigger/signal pair.
pub fn readiness_channel() -> (ReadinessTrigger, ReadinessSignal) {
    let (tx, rx) = watch::channel(false);
    (ReadinessTrigger { tx }, ReadinessSignal { rx })
}

/// Firing half of the readiness gate.
///
/// Dropping it without calling [`fire`](Self::fire) releases waiters with
/// [`FatalError::SignalDropped`].
#[derive(Debug)]
pub struct ReadinessTrigger {
    tx: watch::Sender<bool>,
}

impl ReadinessTrigger {
    /// Open the gate. Later waiters pass immediately.
    pub fn fire(self) {
        self.tx.send_replace(true);
    }
}

/// Waiting half of the readiness gate.
#[derive(Debug)]
pub struct ReadinessSignal {
    rx: watch::Receiver<bool>,
}

impl ReadinessSignal {
    /// A signal that has already fired.
    pub fn ready() -> Self {
        let (trigger, signal) = readiness_channel();
        trigger.fire();
        signal
    }

    /// Suspend until the gate opens.
    ///
    /// # Errors
    ///
    /// [`FatalError::SignalDropped`] if the trigger was dropped unfired.
    pub async fn wait(mut self) -> Result<(), FatalError> {
        self.rx
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| FatalError::SignalDropped)
    }
}

/// A cheap liveness check against the control plane.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Succeeds once the API server answers.
    async fn probe(&self) -> Result<(), StoreError>;
}

/// Poll `probe` every `interval` until it succeeds, then fire `trigger`.
///
/// Returns `false` and drops the trigger unfired if `timeout` elapses first.
pub async fn wait_for_apiserver<P>(
    probe: &P,
    trigger: ReadinessTrigger,
    interval: Duration,
    timeout: Duration,
) -> bool
where
    P: ReadinessProbe + ?Sized,
{
    let poll = async {
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            match probe.probe().await {
                Ok(()) => return attempts,
                Err(e) => {
                    debug!(error = %e, attempts, "api server not ready yet");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(attempts) => {
            info!(attempts, "api server ready");
            trigger.fire();
            true
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "gave up waiting for api server");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Conditions that end the sweep. The process boundary decides whether to exit.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// The runner cannot be built from the given configuration.
    #[error("service-account: invalid configuration: {0}")]
    InvalidConfig(String),
    /// The readiness trigger went away without firing.
    #[error("service-account: readiness signal dropped before the api server became ready")]
    SignalDropped,
    /// The store client could not be built.
    #[error("service-account: new k8s client: {0}")]
    Connect(#[source] StoreError),
    /// A configured namespace could not be fetched.
    #[error("service-account: get namespace {namespace}: {source}")]
    NamespaceLookup {
        /// Namespace name.
        namespace: String,
        /// Underlying store failure.
        #[source]
        source: StoreError,
    },
    /// Hardening a namespace failed.
    #[error(transparent)]
    Harden(#[from] HardenError),
    /// The background task panicked or was aborted.
    #[error("service-account: background task ended abnormally: {0}")]
    Aborted(String),
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// When the readiness gate opened.
    pub started_at: DateTime<Utc>,
    /// When the last namespace finished.
    pub finished_at: DateTime<Utc>,
    /// Per-namespace outcome, in sweep order.
    pub outcomes: Vec<(String, HardenOutcome)>,
}

impl RunSummary {
    /// Namespaces that were written during this run.
    pub fn hardened(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == HardenOutcome::Hardened)
            .map(|(name, _)| name.as_str())
    }
}

/// Marker state of one namespace, as reported by a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceStatus {
    /// Namespace name.
    pub namespace: String,
    /// Whether the marker annotation is present.
    pub hardened: bool,
}

/// Handle to a spawned sweep.
#[derive(Debug)]
pub struct RunHandle {
    task: JoinHandle<Result<RunSummary, FatalError>>,
}

impl RunHandle {
    /// Wait for the sweep to finish.
    ///
    /// # Errors
    ///
    /// The sweep's [`FatalError`], or [`FatalError::Aborted`] if the task
    /// panicked.
    pub async fn wait(self) -> Result<RunSummary, FatalError> {
        self.task
            .await
            .map_err(|e| FatalError::Aborted(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Hardens a fixed, ordered list of namespaces once the control plane is up.
pub struct HardeningRunner {
    namespaces: Vec<String>,
    hardener: Hardener,
    connector: Arc<dyn StoreConnector>,
}

impl HardeningRunner {
    /// Build a runner. The namespace list defaults to
    /// `kube-system`, `kube-public`, `default`.
    ///
    /// # Errors
    ///
    /// [`FatalError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &GuardConfig, connector: Arc<dyn StoreConnector>) -> Result<Self, FatalError> {
        config
            .validate()
            .map_err(|e| FatalError::InvalidConfig(format!("{e:#}")))?;
        Ok(Self {
            namespaces: config.hardening.namespaces.clone(),
            hardener: Hardener::new(&config.hardening, Backoff::from(&config.backoff)),
            connector,
        })
    }

    /// Namespaces in sweep order.
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Spawn the sweep and return immediately.
    ///
    /// Must be called from within a Tokio runtime. The task has no
    /// cancellation path; it runs until every namespace is hardened or the
    /// first fatal error.
    pub fn start(self, ready: ReadinessSignal) -> RunHandle {
        let task = tokio::spawn(async move { self.run(ready).await });
        RunHandle { task }
    }

    /// Wait for readiness and sweep every namespace in order.
    ///
    /// # Errors
    ///
    /// The first [`FatalError`] encountered; it has already been logged.
    pub async fn run(&self, ready: ReadinessSignal) -> Result<RunSummary, FatalError> {
        let result = self.sweep(ready).await;
        if let Err(e) = &result {
            error!(error = %e, "default service account hardening failed");
        }
        result
    }

    /// Report which namespaces still need hardening, without writing.
    ///
    /// # Errors
    ///
    /// A [`FatalError`] if readiness, connection, or a namespace lookup fails.
    pub async fn check(&self, ready: ReadinessSignal) -> Result<Vec<NamespaceStatus>, FatalError> {
        ready.wait().await?;
        let store = self.connector.connect().await.map_err(FatalError::Connect)?;

        let mut statuses = Vec::with_capacity(self.namespaces.len());
        for name in &self.namespaces {
            let namespace = fetch_namespace(store.as_ref(), name).await?;
            statuses.push(NamespaceStatus {
                namespace: name.clone(),
                hardened: !self.hardener.needs_hardening(&namespace),
            });
        }
        Ok(statuses)
    }

    async fn sweep(&self, ready: ReadinessSignal) -> Result<RunSummary, FatalError> {
        ready.wait().await?;
        let started_at = Utc::now();
        info!(namespaces = ?self.namespaces, "updating default service accounts");

        let store = self.connector.connect().await.map_err(FatalError::Connect)?;

        let mut outcomes = Vec::with_capacity(self.namespaces.len());
        for name in &self.namespaces {
            let namespace = fetch_namespace(store.as_ref(), name).await?;
            let outcome = self.hardener.harden(store.as_ref(), namespace).await?;
            outcomes.push((name.clone(), outcome));
        }

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        };
        info!(
            hardened = summary.hardened().count(),
            total = summary.outcomes.len(),
            "updating service accounts complete"
        );
        Ok(summary)
    }
}

async fn fetch_namespace(store: &dyn ClusterStore, name: &str) -> Result<Namespace, FatalError> {
    ResourceApi::<Namespace>::get(store, &ResourceKey::cluster(name))
        .await
        .map_err(|source| FatalError::NamespaceLookup {
            namespace: name.to_owned(),
            source,
        })
}
