//! Dialling, readiness checking and authenticating against the gateway.

use std::time::Duration;

use async_trait::async_trait;
use harness::{BootstrapError, Bootstrapper, ProbeResult, ServiceTarget};
use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::auth::{Credentials, TableAuthProvider, TokenInterceptor};
use crate::client::StargateSession;
use crate::proto::Query;
use crate::proto::stargate_client::StargateClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectSettings {
    /// Container port of the gRPC API.
    pub grpc_port: u16,
    /// Container port of the REST auth API.
    pub auth_port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Time allowed for the gRPC server to answer its first call.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            grpc_port: 8090,
            auth_port: 8081,
            connect_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Produces an authenticated [`StargateSession`] for a started gateway.
///
/// One call is one attempt: dial, wait for the server to answer a call,
/// fetch a token, attach it. Refused or slow endpoints are retryable;
/// malformed addresses and rejected credentials are fatal.
#[derive(Debug, Clone, Default)]
pub struct StargateConnector {
    settings: ConnectSettings,
    credentials: Credentials,
}

impl StargateConnector {
    pub fn new(settings: ConnectSettings, credentials: Credentials) -> Self {
        Self { settings, credentials }
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint, BootstrapError> {
        Endpoint::from_shared(format!("http://{address}"))
            .map(|endpoint| {
                endpoint
                    .connect_timeout(self.settings.connect_timeout)
                    .timeout(self.settings.request_timeout)
            })
            .map_err(|e| BootstrapError::InvalidTarget(format!("{address}: {e}")))
    }
}

/// Statement sent without a token to prove the server answers.
const READY_CHECK_CQL: &str = "SELECT key FROM system.local";

/// Codes tonic produces locally when a call never reached the server.
fn answered_by_server(status: &Status) -> bool {
    !matches!(
        status.code(),
        Code::Unavailable | Code::Unknown | Code::Cancelled | Code::DeadlineExceeded
    )
}

/// Sends one unauthenticated call over `channel`. Any status the server
/// answers with, `Unauthenticated` included, means it is serving.
async fn wait_server_ready(channel: Channel, address: &str, limit: Duration) -> Result<(), BootstrapError> {
    let mut client = StargateClient::new(channel);
    let query = Query {
        cql: READY_CHECK_CQL.to_string(),
        values: None,
        parameters: None,
    };
    let not_ready = |reason: String| BootstrapError::Connect {
        address: address.to_string(),
        reason,
    };
    match tokio::time::timeout(limit, client.execute_query(query)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(status)) if answered_by_server(&status) => {
            tracing::trace!(address, code = ?status.code(), "gRPC server answered ready check");
            Ok(())
        }
        Ok(Err(status)) => Err(not_ready(format!("server not ready: {status}"))),
        Err(_) => Err(not_ready(format!("server not ready: no answer within {limit:?}"))),
    }
}

macro_rules! fatal_on_err {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ProbeResult::Fatal(e.into()),
        }
    };
}

#[async_trait]
impl Bootstrapper for StargateConnector {
    type Connection = StargateSession;

    async fn connect(&self, target: &ServiceTarget) -> ProbeResult<StargateSession, BootstrapError> {
        let grpc_address = fatal_on_err!(target.host_port_address(self.settings.grpc_port));
        let auth_address = fatal_on_err!(target.host_port_address(self.settings.auth_port));
        let endpoint = fatal_on_err!(self.endpoint(&grpc_address));

        tracing::debug!(service = %target.service, address = %grpc_address, "dialling gRPC endpoint");
        let channel = match tokio::time::timeout(self.settings.connect_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return ProbeResult::Retryable(BootstrapError::Connect {
                    address: grpc_address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return ProbeResult::Retryable(BootstrapError::Connect {
                    address: grpc_address,
                    reason: format!("server not ready: no connection within {:?}", self.settings.connect_timeout),
                });
            }
        };

        if let Err(e) = wait_server_ready(channel.clone(), &grpc_address, self.settings.ready_timeout).await {
            return ProbeResult::Retryable(e);
        }

        let auth = fatal_on_err!(TableAuthProvider::for_address(
            &auth_address,
            self.credentials.clone(),
            self.settings.request_timeout,
        ));
        let token = match auth.fetch_token().await {
            Ok(token) => token,
            Err(e) if e.is_retryable() => return ProbeResult::Retryable(e.into()),
            Err(e) => return ProbeResult::Fatal(e.into()),
        };

        let interceptor = match TokenInterceptor::new(&token) {
            Ok(interceptor) => interceptor,
            Err(e) => {
                return ProbeResult::Fatal(BootstrapError::Protocol {
                    address: auth.url().to_string(),
                    reason: format!("token is not valid metadata: {e}"),
                });
            }
        };

        tracing::info!(service = %target.service, address = %grpc_address, "gRPC session established");
        ProbeResult::Success(StargateSession::new(channel, interceptor, grpc_address))
    }
}
