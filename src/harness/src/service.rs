//! Launching external services and owning them for the length of a run.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;

use crate::bootstrap::ServiceTarget;
use crate::error::HarnessError;
use crate::log_watcher::{LogWatcher, LogWatcherHandle, MarkerScan};
use crate::readiness::ReadinessSignal;

/// A live, unbounded output stream of a running service.
pub type LogStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Everything needed to start one service and recognise when it is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Name used in logs and errors.
    pub name: String,
    pub image: String,
    pub tag: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Container ports to publish on the host.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Log line fragment that proves the service finished initialising.
    pub ready_marker: String,
    /// Environment variable that receives the internal address of the
    /// service this one depends on.
    #[serde(default)]
    pub upstream_address_env: Option<String>,
}

impl ServiceDefinition {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        tag: impl Into<String>,
        ready_marker: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            tag: tag.into(),
            hostname: None,
            env: BTreeMap::new(),
            ports: Vec::new(),
            ready_marker: ready_marker.into(),
            upstream_address_env: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn with_upstream_address_env(mut self, key: impl Into<String>) -> Self {
        self.upstream_address_env = Some(key.into());
        self
    }

    /// The definition to launch once the upstream service is reachable at
    /// `address`.
    pub fn for_upstream(&self, address: &str) -> Self {
        let mut definition = self.clone();
        if let Some(key) = &self.upstream_address_env {
            definition.env.insert(key.clone(), address.to_string());
        }
        definition
    }

    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.name.trim().is_empty() {
            return Err(HarnessError::Config("service name must not be empty".to_string()));
        }
        if self.image.trim().is_empty() || self.tag.trim().is_empty() {
            return Err(HarnessError::Config(format!(
                "{}: image and tag must not be empty",
                self.name
            )));
        }
        if self.ready_marker.is_empty() {
            return Err(HarnessError::Config(format!(
                "{}: ready_marker must not be empty",
                self.name
            )));
        }
        Ok(())
    }
}

/// A running external process, such as a container.
#[async_trait]
pub trait ServiceProcess: Send + Sync {
    fn id(&self) -> &str;

    /// Follows every output stream of the process from its start.
    fn log_streams(&self) -> Vec<LogStream>;

    /// Resolves host, published ports and internal address.
    async fn target(&self) -> Result<ServiceTarget, HarnessError>;

    /// Stops and removes the process.
    async fn stop(self: Box<Self>) -> Result<(), HarnessError>;
}

/// Starts services from their definitions.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn launch(&self, definition: &ServiceDefinition) -> Result<Box<dyn ServiceProcess>, HarnessError>;
}

/// A started service together with its log watchers and readiness signal.
///
/// Dropping it aborts the watchers and drops the process handle; call
/// [`ManagedService::shutdown`] for an orderly stop.
pub struct ManagedService {
    definition: ServiceDefinition,
    process: Box<dyn ServiceProcess>,
    signal: ReadinessSignal,
    watchers: Vec<LogWatcherHandle>,
    target: ServiceTarget,
}

impl std::fmt::Debug for ManagedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedService")
            .field("name", &self.definition.name)
            .field("id", &self.process.id())
            .field("state", &self.signal.state())
            .field("target", &self.target)
            .finish()
    }
}

impl ManagedService {
    /// Launches `definition` and starts tailing its output for the marker.
    pub async fn start(
        launcher: &dyn ServiceLauncher,
        definition: ServiceDefinition,
        scan: MarkerScan,
    ) -> Result<Self, HarnessError> {
        definition.validate()?;

        let process = launcher.launch(&definition).await?;
        tracing::info!(
            service = %definition.name,
            id = process.id(),
            image = %definition.image_ref(),
            "service started"
        );

        let signal = ReadinessSignal::new();
        signal.begin_waiting();

        let watchers = process
            .log_streams()
            .into_iter()
            .map(|stream| {
                let name = definition.name.clone();
                LogWatcher::new(&definition.name, &definition.ready_marker, scan, signal.clone())
                    .spawn(stream, move || tracing::info!(service = %name, "{name} ready!"))
            })
            .collect::<Vec<_>>();

        let target = match process.target().await {
            Ok(target) => target,
            Err(e) => {
                drop(watchers);
                if let Err(stop_err) = process.stop().await {
                    tracing::warn!(service = %definition.name, "Failed to stop after endpoint error: {stop_err}");
                }
                return Err(e);
            }
        };

        Ok(Self {
            definition,
            process,
            signal,
            watchers,
            target,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    pub fn readiness(&self) -> &ReadinessSignal {
        &self.signal
    }

    pub fn target(&self) -> &ServiceTarget {
        &self.target
    }

    /// Aborts the log watchers, then stops the process.
    pub async fn shutdown(self) -> Result<(), HarnessError> {
        let Self {
            definition,
            process,
            watchers,
            ..
        } = self;

        for watcher in &watchers {
            watcher.abort();
        }
        drop(watchers);

        tracing::info!(service = %definition.name, id = process.id(), "stopping service");
        process.stop().await
    }
}
