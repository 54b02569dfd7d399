//! Tests for the one-shot readiness gate and API server polling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use automount_guard::runner::{
    readiness_channel, wait_for_apiserver, FatalError, ReadinessProbe, ReadinessSignal,
};
use automount_guard::store::StoreError;

/// Fails the first `failures` probes, then succeeds.
struct FlakyProbe {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyProbe {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ReadinessProbe for FlakyProbe {
    async fn probe(&self) -> Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(StoreError::Other("connection refused".to_owned()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn prefired_signal_passes_immediately() {
    ReadinessSignal::ready()
        .wait()
        .await
        .expect("already fired");
}

#[tokio::test]
async fn signal_fired_before_wait_is_remembered() {
    let (trigger, signal) = readiness_channel();
    trigger.fire();
    signal.wait().await.expect("fired earlier");
}

#[tokio::test]
async fn waiter_is_released_by_fire() {
    let (trigger, signal) = readiness_channel();
    let waiter = tokio::spawn(signal.wait());

    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    trigger.fire();
    waiter
        .await
        .expect("task should not panic")
        .expect("signal fired");
}

#[tokio::test]
async fn dropped_trigger_releases_waiter_with_error() {
    let (trigger, signal) = readiness_channel();
    drop(trigger);

    let err = signal.wait().await.expect_err("never fired");
    assert!(matches!(err, FatalError::SignalDropped));
}

#[tokio::test(start_paused = true)]
async fn polling_fires_once_probe_succeeds() {
    let probe = FlakyProbe::new(2);
    let (trigger, signal) = readiness_channel();

    let ready = wait_for_apiserver(
        &probe,
        trigger,
        Duration::from_secs(2),
        Duration::from_secs(60),
    )
    .await;

    assert!(ready);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    signal.wait().await.expect("trigger fired");
}

#[tokio::test(start_paused = true)]
async fn polling_timeout_drops_trigger() {
    let probe = FlakyProbe::new(u32::MAX);
    let (trigger, signal) = readiness_channel();

    let ready = wait_for_apiserver(
        &probe,
        trigger,
        Duration::from_secs(1),
        Duration::from_secs(10),
    )
    .await;

    assert!(!ready);
    let err = signal.wait().await.expect_err("trigger dropped");
    assert!(matches!(err, FatalError::SignalDropped));
}
