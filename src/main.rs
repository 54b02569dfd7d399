//! Automount guard CLI entry point.
//!
//! Provides `run`, `check`, and `validate` subcommands for hardening the
//! configured namespaces, reporting which still need it, or checking the
//! config file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use automount_guard::config::{load_config, GuardConfig, DEFAULT_CONFIG_PATH};
use automount_guard::runner::{readiness_channel, wait_for_apiserver, HardeningRunner, ReadinessSignal};
use automount_guard::store::apiserver::KubeConnector;

/// Automount guard: lock down default service accounts in system namespaces.
#[derive(Parser)]
#[command(name = "automount-guard", version, about)]
struct Cli {
    /// Path to the TOML config file. Defaults apply when the file is absent.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Wait for the API server, then harden every configured namespace.
    Run,
    /// Wait for the API server and report which namespaces need hardening.
    Check,
    /// Load and validate the config, then print the resolved namespaces.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(cli.config)?;

    match cli.command {
        Command::Run => handle_run(config).await,
        Command::Check => handle_check(config).await,
        Command::Validate => handle_validate(&config),
    }
}

/// Load the explicit config path, or the default path if it exists.
fn resolve_config(explicit: Option<PathBuf>) -> anyhow::Result<GuardConfig> {
    match explicit {
        Some(path) => load_config(&path),
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_config(&default_path)
            } else {
                Ok(GuardConfig::default())
            }
        }
    }
}

/// Start readiness polling in the background and return the gate.
fn spawn_readiness(config: &GuardConfig, connector: Arc<KubeConnector>) -> ReadinessSignal {
    let (trigger, signal) = readiness_channel();
    let interval = Duration::from_secs(config.cluster.ready_poll_interval_secs);
    let timeout = Duration::from_secs(config.cluster.ready_timeout_secs);
    tokio::spawn(async move {
        wait_for_apiserver(connector.as_ref(), trigger, interval, timeout).await;
    });
    signal
}

/// Harden every configured namespace, exiting non-zero on the first fatal error.
async fn handle_run(config: GuardConfig) -> anyhow::Result<()> {
    let _logging_guard = automount_guard::logging::init(&config.logging)?;

    let connector = Arc::new(KubeConnector::new(&config.cluster.kubeconfig));
    info!(kubeconfig = %connector.kubeconfig().display(), "waiting for api server");

    let runner = HardeningRunner::new(&config, connector.clone())
        .context("failed to build hardening runner")?;
    let ready = spawn_readiness(&config, connector);

    let summary = runner
        .start(ready)
        .wait()
        .await
        .context("default service account hardening failed")?;

    let elapsed = summary.finished_at.signed_duration_since(summary.started_at);
    info!(
        hardened = ?summary.hardened().collect::<Vec<_>>(),
        elapsed_ms = elapsed.num_milliseconds(),
        "default service accounts hardened"
    );
    Ok(())
}

/// Print the marker state of each configured namespace.
async fn handle_check(config: GuardConfig) -> anyhow::Result<()> {
    automount_guard::logging::init_cli();

    let connector = Arc::new(KubeConnector::new(&config.cluster.kubeconfig));
    let runner = HardeningRunner::new(&config, connector.clone())
        .context("failed to build hardening runner")?;
    let ready = spawn_readiness(&config, connector);

    let statuses = runner.check(ready).await.context("check failed")?;
    for status in statuses {
        let state = if status.hardened {
            "hardened"
        } else {
            "needs hardening"
        };
        println!("{}: {state}", status.namespace);
    }
    Ok(())
}

/// Print the namespaces the resolved config would sweep.
fn handle_validate(config: &GuardConfig) -> anyhow::Result<()> {
    config.validate().context("config is invalid")?;
    println!("config ok");
    for namespace in &config.hardening.namespaces {
        println!("{namespace}");
    }
    Ok(())
}
