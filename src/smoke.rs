//! The smoke check: Cassandra, then Stargate, then one query.

use anyhow::Context;
use async_trait::async_trait;
use harness::{HarnessError, Orchestrator, ServiceLauncher, SmokeAction};
use stargate_client::proto::ResultSet;
use stargate_client::{ResultTable, StargateConnector, StargateSession};

use crate::config::{ConfigError, SmokeConfig};
use crate::containers::DockerLauncher;
use crate::cql::CqlOptionsProbe;

/// Anything that can run a single CQL statement and return its rows.
#[async_trait]
pub trait CqlExecutor: Send {
    async fn execute_cql(&mut self, cql: &str) -> anyhow::Result<ResultSet>;
}

#[async_trait]
impl CqlExecutor for StargateSession {
    async fn execute_cql(&mut self, cql: &str) -> anyhow::Result<ResultSet> {
        let endpoint = self.endpoint().to_string();
        self.execute_query(cql)
            .await
            .with_context(|| format!("executing {cql:?} via {endpoint}"))
    }
}

/// Runs one query and requires at least one row back.
#[derive(Debug, Clone)]
pub struct SystemLocalQuery {
    cql: String,
}

impl SystemLocalQuery {
    pub fn new(cql: impl Into<String>) -> Self {
        Self { cql: cql.into() }
    }

    pub fn cql(&self) -> &str {
        &self.cql
    }
}

impl Default for SystemLocalQuery {
    fn default() -> Self {
        Self::new("SELECT * FROM system.local")
    }
}

#[async_trait]
impl<C: CqlExecutor> SmokeAction<C> for SystemLocalQuery {
    type Output = ResultSet;

    async fn run(&self, connection: &mut C) -> anyhow::Result<ResultSet> {
        let result_set = connection.execute_cql(&self.cql).await?;
        tracing::info!(
            columns = result_set.columns.len(),
            rows = result_set.rows.len(),
            "query returned"
        );
        for row in ResultTable(&result_set).rows() {
            tracing::info!(target: "result_set", "{row}");
        }
        Ok(result_set)
    }

    fn verify(&self, output: &ResultSet) -> anyhow::Result<()> {
        if output.rows.is_empty() {
            anyhow::bail!("{:?} returned an empty result set", self.cql);
        }
        if output.rows.iter().all(|row| row.values.is_empty()) {
            anyhow::bail!("{:?} returned rows without values", self.cql);
        }
        Ok(())
    }
}

/// Runs the smoke check against the local Docker daemon.
pub async fn run_smoke(config: &SmokeConfig) -> Result<ResultSet, HarnessError> {
    run_with_launcher(DockerLauncher, config).await
}

pub async fn run_with_launcher<L: ServiceLauncher>(
    launcher: L,
    config: &SmokeConfig,
) -> Result<ResultSet, HarnessError> {
    config.validate().map_err(|e| match e {
        ConfigError::Invalid(reason) => HarnessError::Config(reason),
        other => HarnessError::Config(other.to_string()),
    })?;

    let orchestrator = Orchestrator::new(launcher, config.orchestrator_config());
    let probe = CqlOptionsProbe::new(config.cql_probe.clone());
    let connector = StargateConnector::new(config.connect.clone(), config.credentials.clone());
    let action = SystemLocalQuery::new(&config.query);

    orchestrator
        .run(&config.upstream, &config.downstream, &probe, &connector, &action)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use stargate_client::proto::{ColumnSpec, Row, Value, value};

    struct CannedSession(Option<ResultSet>);

    #[async_trait]
    impl CqlExecutor for CannedSession {
        async fn execute_cql(&mut self, cql: &str) -> anyhow::Result<ResultSet> {
            self.0
                .take()
                .with_context(|| format!("no canned result left for {cql:?}"))
        }
    }

    fn one_row() -> ResultSet {
        ResultSet {
            columns: vec![ColumnSpec { name: "key".into() }],
            rows: vec![Row {
                values: vec![Value {
                    inner: Some(value::Inner::String("local".into())),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_run_returns_result_set() {
        let action = SystemLocalQuery::default();
        let mut session = CannedSession(Some(one_row()));

        let result = action.run(&mut session).await.unwrap();
        assert_eq!(result, one_row());
        assert!(SmokeAction::<CannedSession>::verify(&action, &result).is_ok());
    }

    #[tokio::test]
    async fn test_run_propagates_query_failure() {
        let action = SystemLocalQuery::default();
        let mut session = CannedSession(None);

        let err = action.run(&mut session).await.unwrap_err();
        assert!(err.to_string().contains("system.local"));
    }

    #[test]
    fn test_verify_rejects_empty_result() {
        let action = SystemLocalQuery::default();
        let empty = ResultSet::default();
        let err = SmokeAction::<CannedSession>::verify(&action, &empty).unwrap_err();
        assert!(err.to_string().contains("empty result set"));
    }
}
