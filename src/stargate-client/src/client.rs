use std::fmt;

use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;

use crate::auth::TokenInterceptor;
use crate::proto::stargate_client::StargateClient;
use crate::proto::{Query, ResultSet, response};

pub type AuthenticatedClient = StargateClient<InterceptedService<Channel, TokenInterceptor>>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("ExecuteQuery failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("Response to {0:?} carried no result set")]
    MissingResultSet(String),
}

/// An authenticated session against the gateway's gRPC endpoint.
#[derive(Clone)]
pub struct StargateSession {
    client: AuthenticatedClient,
    endpoint: String,
}

impl fmt::Debug for StargateSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StargateSession")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl StargateSession {
    pub fn new(channel: Channel, interceptor: TokenInterceptor, endpoint: impl Into<String>) -> Self {
        Self {
            client: StargateClient::with_interceptor(channel, interceptor),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Runs `cql` without bound values and with default parameters.
    pub async fn execute_query(&mut self, cql: &str) -> Result<ResultSet, QueryError> {
        self.execute(Query {
            cql: cql.to_string(),
            values: None,
            parameters: None,
        })
        .await
    }

    pub async fn execute(&mut self, query: Query) -> Result<ResultSet, QueryError> {
        tracing::debug!(endpoint = %self.endpoint, cql = %query.cql, "executing query");
        let cql = query.cql.clone();
        let response = self.client.execute_query(query).await?.into_inner();

        for warning in &response.warnings {
            tracing::warn!(endpoint = %self.endpoint, cql = %cql, "query warning: {warning}");
        }

        match response.result {
            Some(response::Result::ResultSet(result_set)) => Ok(result_set),
            None => Err(QueryError::MissingResultSet(cql)),
        }
    }
}
