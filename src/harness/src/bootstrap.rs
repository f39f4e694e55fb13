//! The contract for establishing a session with a started service.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::readiness::ReadinessSignal;
use crate::retry::ProbeResult;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("{service} has not logged its readiness marker yet")]
    NotReady { service: String },
    #[error("Connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("Invalid connection parameters: {0}")]
    InvalidTarget(String),
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),
    #[error("Unexpected response from {address}: {reason}")]
    Protocol { address: String, reason: String },
}

/// Where a started service can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub service: String,
    /// Host on which mapped ports are published.
    pub host: String,
    /// Container port to published host port.
    pub ports: BTreeMap<u16, u16>,
    /// Address under which sibling services reach this one.
    pub internal_address: Option<String>,
}

impl ServiceTarget {
    pub fn new(service: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            host: host.into(),
            ports: BTreeMap::new(),
            internal_address: None,
        }
    }

    pub fn with_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, host_port);
        self
    }

    pub fn with_internal_address(mut self, address: impl Into<String>) -> Self {
        self.internal_address = Some(address.into());
        self
    }

    pub fn host_port(&self, container_port: u16) -> Result<u16, BootstrapError> {
        self.ports.get(&container_port).copied().ok_or_else(|| {
            BootstrapError::InvalidTarget(format!(
                "{} does not publish port {container_port}",
                self.service
            ))
        })
    }

    /// `host:port` for the published counterpart of `container_port`.
    /// IPv6 hosts are bracketed.
    pub fn host_port_address(&self, container_port: u16) -> Result<String, BootstrapError> {
        let port = self.host_port(container_port)?;
        if self.host.contains(':') && !self.host.starts_with('[') {
            Ok(format!("[{}]:{port}", self.host))
        } else {
            Ok(format!("{}:{port}", self.host))
        }
    }
}

/// Performs the side-effecting part of a single readiness attempt.
///
/// Implementations classify transient conditions (refused, not ready yet) as
/// [`ProbeResult::Retryable`] and conditions retrying cannot fix (malformed
/// address, rejected credentials) as [`ProbeResult::Fatal`].
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    type Connection: Send;

    async fn connect(&self, target: &ServiceTarget) -> ProbeResult<Self::Connection, BootstrapError>;
}

/// Treats the readiness marker alone as proof of readiness.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerOnly;

#[async_trait]
impl Bootstrapper for MarkerOnly {
    type Connection = ();

    async fn connect(&self, _target: &ServiceTarget) -> ProbeResult<(), BootstrapError> {
        ProbeResult::Success(())
    }
}

/// One probe attempt that only reaches `bootstrapper` once `signal` is ready.
pub async fn readiness_gated<B>(
    signal: &ReadinessSignal,
    bootstrapper: &B,
    target: &ServiceTarget,
) -> ProbeResult<B::Connection, BootstrapError>
where
    B: Bootstrapper + ?Sized,
{
    if !signal.is_ready() {
        return ProbeResult::Retryable(BootstrapError::NotReady {
            service: target.service.clone(),
        });
    }
    bootstrapper.connect(target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnBootstrapper;

    fn target() -> ServiceTarget {
        ServiceTarget::new("cassandra", "127.0.0.1")
            .with_port(9042, 32768)
            .with_internal_address("172.17.0.2")
    }

    #[test]
    fn test_host_port_lookup() {
        let target = target();
        assert_eq!(target.host_port(9042), Ok(32768));
        assert_eq!(target.host_port_address(9042).unwrap(), "127.0.0.1:32768");
        assert!(matches!(
            target.host_port(8090),
            Err(BootstrapError::InvalidTarget(msg)) if msg.contains("8090")
        ));
    }

    #[test]
    fn test_ipv6_host_is_bracketed() {
        let bare = ServiceTarget::new("cassandra", "::1").with_port(9042, 32768);
        assert_eq!(bare.host_port_address(9042).unwrap(), "[::1]:32768");
        assert!(bare.host_port_address(9042).unwrap().parse::<std::net::SocketAddr>().is_ok());

        let bracketed = ServiceTarget::new("cassandra", "[::1]").with_port(9042, 32768);
        assert_eq!(bracketed.host_port_address(9042).unwrap(), "[::1]:32768");
    }

    #[tokio::test]
    async fn test_gate_skips_bootstrapper_until_ready() {
        let signal = ReadinessSignal::new();
        signal.begin_waiting();
        let bootstrapper = FnBootstrapper::new(|_| ProbeResult::Success("session"));

        let result = readiness_gated(&signal, &bootstrapper, &target()).await;
        assert_eq!(
            result,
            ProbeResult::Retryable(BootstrapError::NotReady {
                service: "cassandra".to_string()
            })
        );
        assert_eq!(bootstrapper.calls(), 0);

        signal.mark_ready();
        let result = readiness_gated(&signal, &bootstrapper, &target()).await;
        assert_eq!(result, ProbeResult::Success("session"));
        assert_eq!(bootstrapper.calls(), 1);
    }

    #[tokio::test]
    async fn test_marker_only_succeeds_immediately() {
        assert!(MarkerOnly.connect(&target()).await.is_success());
    }
}
