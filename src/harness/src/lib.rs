//! Readiness detection and connection retry for services started on demand.
//!
//! A [`ManagedService`] is launched through a [`ServiceLauncher`], its output
//! is tailed by one [`LogWatcher`] per stream, and the first occurrence of the
//! configured marker flips its [`ReadinessSignal`]. The [`Orchestrator`] then
//! polls a [`Bootstrapper`] with [`retry`] until the dependent connection is
//! live, runs a single [`SmokeAction`] and always tears the services down.

pub mod bootstrap;
pub mod error;
pub mod log_watcher;
pub mod orchestrator;
pub mod readiness;
pub mod retry;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bootstrap::{BootstrapError, Bootstrapper, MarkerOnly, ServiceTarget, readiness_gated};
pub use error::HarnessError;
pub use log_watcher::{LogWatcher, LogWatcherHandle, MarkerMatcher, MarkerScan, WatchOutcome};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SmokeAction, Stage};
pub use readiness::{ReadinessSignal, ReadinessState};
pub use retry::{PolicyError, ProbeResult, RetryError, RetryPolicy, retry, retry_notify};
pub use service::{LogStream, ManagedService, ServiceDefinition, ServiceLauncher, ServiceProcess};
