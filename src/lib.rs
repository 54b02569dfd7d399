//! Automount guard: disable service-account token automounting in system
//! namespaces once the control plane is ready.
//!
//! The sweep waits for a readiness signal, then for each configured namespace
//! sets `automountServiceAccountToken: false` on its default service account
//! and stamps the namespace with a marker annotation so later runs skip it.
//! Every write is an optimistic-concurrency update: stale writes are refreshed
//! and retried under a bounded backoff.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod store;
pub mod updater;

pub mod hardener;
pub mod runner;
