//! Services started as Docker containers through testcontainers.

use std::borrow::Cow;
use std::collections::BTreeMap;

use async_trait::async_trait;
use harness::{HarnessError, LogStream, ServiceDefinition, ServiceLauncher, ServiceProcess, ServiceTarget};
use testcontainers_modules::testcontainers::{
    ContainerAsync, Image, ImageExt,
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
};

/// Container image built from a [`ServiceDefinition`].
///
/// Carries no wait conditions: readiness is decided by the log watchers
/// and bootstrappers, not by the container runtime.
#[derive(Debug, Clone)]
pub struct ServiceImage {
    name: String,
    tag: String,
    env_vars: BTreeMap<String, String>,
    ports: Vec<ContainerPort>,
}

impl From<&ServiceDefinition> for ServiceImage {
    fn from(definition: &ServiceDefinition) -> Self {
        Self {
            name: definition.image.clone(),
            tag: definition.tag.clone(),
            env_vars: definition.env.clone(),
            ports: definition.ports.iter().copied().map(ContainerPort::Tcp).collect(),
        }
    }
}

impl Image for ServiceImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        Vec::new()
    }

    fn env_vars(&self) -> impl IntoIterator<Item = (impl Into<Cow<'_, str>>, impl Into<Cow<'_, str>>)> {
        self.env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &self.ports
    }
}

/// Launches services on the local Docker daemon.
#[derive(Debug, Clone, Default)]
pub struct DockerLauncher;

#[async_trait]
impl ServiceLauncher for DockerLauncher {
    async fn launch(&self, definition: &ServiceDefinition) -> Result<Box<dyn ServiceProcess>, HarnessError> {
        let image = ServiceImage::from(definition);
        let request = match &definition.hostname {
            Some(hostname) => image.with_hostname(hostname.clone()),
            None => image.into(),
        };

        let container = request.start().await.map_err(|e| HarnessError::Start {
            service: definition.name.clone(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(ContainerProcess {
            name: definition.name.clone(),
            ports: definition.ports.clone(),
            container,
        }))
    }
}

pub struct ContainerProcess {
    name: String,
    ports: Vec<u16>,
    container: ContainerAsync<ServiceImage>,
}

impl ContainerProcess {
    fn endpoint_error(&self, reason: impl ToString) -> HarnessError {
        HarnessError::Endpoint {
            service: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ServiceProcess for ContainerProcess {
    fn id(&self) -> &str {
        self.container.id()
    }

    fn log_streams(&self) -> Vec<LogStream> {
        vec![self.container.stdout(true), self.container.stderr(true)]
    }

    async fn target(&self) -> Result<ServiceTarget, HarnessError> {
        let host = self.container.get_host().await.map_err(|e| self.endpoint_error(e))?;
        let mut target = ServiceTarget::new(&self.name, host.to_string());

        for port in &self.ports {
            let host_port = self
                .container
                .get_host_port_ipv4(*port)
                .await
                .map_err(|e| self.endpoint_error(format!("port {port}: {e}")))?;
            target = target.with_port(*port, host_port);
        }

        let bridge_ip = self
            .container
            .get_bridge_ip_address()
            .await
            .map_err(|e| self.endpoint_error(e))?;
        Ok(target.with_internal_address(bridge_ip.to_string()))
    }

    async fn stop(self: Box<Self>) -> Result<(), HarnessError> {
        let name = self.name.clone();
        self.container.rm().await.map_err(|e| HarnessError::Teardown {
            service: name,
            reason: e.to_string(),
        })
    }
}
