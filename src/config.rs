//! Configuration loading for the hardening sweep.
//!
//! Loads `automount-guard.toml` with per-section defaults. All sections use
//! `#[serde(default)]` so a minimal or empty config file is valid.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rancher/rke2/automount-guard.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuardConfig {
    /// Which namespaces to harden and how to mark them.
    #[serde(default)]
    pub hardening: HardeningConfig,

    /// Conflict retry policy.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// API server connection and readiness polling.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Namespaces to sweep and the marker written to each.
#[derive(Debug, Clone, Deserialize)]
pub struct HardeningConfig {
    /// Namespaces to harden, in order.
    #[serde(default = "default_namespaces")]
    pub namespaces: Vec<String>,

    /// Name of the per-namespace service account to lock down.
    #[serde(default = "default_service_account")]
    pub service_account: String,

    /// Namespace annotation whose presence means "already hardened".
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,

    /// Value written under `annotation_key`.
    #[serde(default = "default_annotation_value")]
    pub annotation_value: String,
}

impl Default for HardeningConfig {
    fn default() -> Self {
        Self {
            namespaces: default_namespaces(),
            service_account: default_service_account(),
            annotation_key: default_annotation_key(),
            annotation_value: default_annotation_value(),
        }
    }
}

/// Exponential backoff between conflicting writes.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Growth factor per retry.
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Random extra wait as a fraction of each delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Maximum write attempts per resource.
    #[serde(default = "default_steps")]
    pub steps: u32,

    /// Ceiling for a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
            steps: default_steps(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// API server access.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Admin kubeconfig used to reach the API server.
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,

    /// Seconds between readiness probes.
    #[serde(default = "default_ready_poll_interval_secs")]
    pub ready_poll_interval_secs: u64,

    /// Seconds to wait for the API server before giving up.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubeconfig: default_kubeconfig(),
            ready_poll_interval_secs: default_ready_poll_interval_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rotated JSON logs. Console only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl GuardConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that configuration values are within sane bounds.
    pub fn validate(&self) -> anyhow::Result<()> {
        let hardening = &self.hardening;
        anyhow::ensure!(
            !hardening.namespaces.is_empty(),
            "hardening.namespaces must not be empty"
        );
        anyhow::ensure!(
            hardening.namespaces.iter().all(|ns| !ns.trim().is_empty()),
            "hardening.namespaces must not contain blank names"
        );
        {
            let mut seen = HashSet::new();
            let duplicate = hardening.namespaces.iter().find(|ns| !seen.insert(*ns));
            anyhow::ensure!(
                duplicate.is_none(),
                "hardening.namespaces lists {:?} more than once",
                duplicate.map(String::as_str).unwrap_or_default()
            );
        }
        anyhow::ensure!(
            !hardening.service_account.trim().is_empty(),
            "hardening.service_account must not be empty"
        );
        anyhow::ensure!(
            !hardening.annotation_key.trim().is_empty(),
            "hardening.annotation_key must not be empty"
        );

        let backoff = &self.backoff;
        anyhow::ensure!(backoff.steps >= 1, "backoff.steps must be >= 1");
        anyhow::ensure!(
            backoff.factor.is_finite() && backoff.factor >= 1.0,
            "backoff.factor must be >= 1.0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&backoff.jitter),
            "backoff.jitter must be in [0.0, 1.0]"
        );
        anyhow::ensure!(
            backoff.max_delay_ms >= backoff.initial_delay_ms,
            "backoff.max_delay_ms must be >= backoff.initial_delay_ms"
        );

        anyhow::ensure!(
            self.cluster.ready_poll_interval_secs >= 1,
            "cluster.ready_poll_interval_secs must be >= 1"
        );
        Ok(())
    }
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path) -> anyhow::Result<GuardConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    GuardConfig::from_toml(&contents)
        .with_context(|| format!("invalid config at {}", path.display()))
}

// Default value functions for serde.

fn default_namespaces() -> Vec<String> {
    ["kube-system", "kube-public", "default"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_service_account() -> String {
    "default".to_owned()
}

fn default_annotation_key() -> String {
    "service-account.rke2.io".to_owned()
}

fn default_annotation_value() -> String {
    "resolved".to_owned()
}

fn default_initial_delay_ms() -> u64 {
    10
}

fn default_factor() -> f64 {
    5.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_steps() -> u32 {
    4
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/etc/rancher/rke2/rke2.yaml")
}

fn default_ready_poll_interval_secs() -> u64 {
    2
}

fn default_ready_timeout_secs() -> u64 {
    300
}
