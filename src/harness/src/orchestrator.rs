//! Linear start / wait / connect / act sequence with guaranteed teardown.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::bootstrap::{Bootstrapper, MarkerOnly, readiness_gated};
use crate::error::HarnessError;
use crate::log_watcher::MarkerScan;
use crate::retry::{RetryPolicy, retry_notify};
use crate::service::{ManagedService, ServiceDefinition, ServiceLauncher};

/// Steps of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Init,
    StartUpstream,
    WaitReadyUpstream,
    StartDownstream,
    WaitReadyDownstream,
    WaitConnectDownstream,
    RunAction,
    AssertAction,
    Teardown,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::StartUpstream => "start-upstream",
            Stage::WaitReadyUpstream => "wait-ready-upstream",
            Stage::StartDownstream => "start-downstream",
            Stage::WaitReadyDownstream => "wait-ready-downstream",
            Stage::WaitConnectDownstream => "wait-connect-downstream",
            Stage::RunAction => "run-action",
            Stage::AssertAction => "assert-action",
            Stage::Teardown => "teardown",
        };
        write!(f, "{s}")
    }
}

/// The single operation executed against the fully started system.
#[async_trait]
pub trait SmokeAction<C: Send>: Send + Sync {
    type Output: Send;

    async fn run(&self, connection: &mut C) -> anyhow::Result<Self::Output>;

    /// Checks the output of [`SmokeAction::run`].
    fn verify(&self, _output: &Self::Output) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Budget for each service to log its readiness marker and, for the
    /// upstream service, accept a session.
    pub readiness: RetryPolicy,
    /// Budget and backoff for dialling the downstream service.
    pub connect: RetryPolicy,
    pub marker_scan: MarkerScan,
    /// Upper bound for the whole run, teardown excluded.
    pub deadline: Option<Duration>,
}

/// Runs an upstream service, a downstream service that depends on it, and
/// one action against the downstream service.
pub struct Orchestrator<L> {
    launcher: L,
    config: OrchestratorConfig,
}

impl<L: ServiceLauncher> Orchestrator<L> {
    pub fn new(launcher: L, config: OrchestratorConfig) -> Self {
        Self { launcher, config }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Executes every stage and tears down whatever was started, on success
    /// and on every failure path, before returning.
    pub async fn run<U, D, A>(
        &self,
        upstream: &ServiceDefinition,
        downstream: &ServiceDefinition,
        upstream_probe: &U,
        downstream_connector: &D,
        action: &A,
    ) -> Result<A::Output, HarnessError>
    where
        U: Bootstrapper,
        D: Bootstrapper,
        A: SmokeAction<D::Connection>,
    {
        tracing::info!(stage = %Stage::Init, upstream = %upstream.name, downstream = %downstream.name, "starting run");

        let mut started = Vec::with_capacity(2);
        let stages = self.run_stages(
            upstream,
            downstream,
            upstream_probe,
            downstream_connector,
            action,
            &mut started,
        );

        let outcome = match self.config.deadline {
            Some(limit) => match tokio::time::timeout(limit, stages).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(deadline = ?limit, "run exceeded its deadline");
                    Err(HarnessError::Deadline(limit))
                }
            },
            None => stages.await,
        };

        let teardown = Self::teardown(started).await;
        match (outcome, teardown) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }

    async fn run_stages<U, D, A>(
        &self,
        upstream: &ServiceDefinition,
        downstream: &ServiceDefinition,
        upstream_probe: &U,
        downstream_connector: &D,
        action: &A,
        started: &mut Vec<ManagedService>,
    ) -> Result<A::Output, HarnessError>
    where
        U: Bootstrapper,
        D: Bootstrapper,
        A: SmokeAction<D::Connection>,
    {
        let upstream_service = self.start(Stage::StartUpstream, upstream.clone(), started).await?;
        self.wait_until(Stage::WaitReadyUpstream, upstream_service, upstream_probe, &self.config.readiness)
            .await?;

        let upstream_address = upstream_service
            .target()
            .internal_address
            .clone()
            .ok_or_else(|| HarnessError::Endpoint {
                service: upstream.name.clone(),
                reason: "no internal address to hand to dependent services".to_string(),
            })?;

        let downstream_definition = downstream.for_upstream(&upstream_address);
        let downstream_service = self
            .start(Stage::StartDownstream, downstream_definition, started)
            .await?;

        self.wait_until(Stage::WaitReadyDownstream, downstream_service, &MarkerOnly, &self.config.readiness)
            .await?;
        let mut connection = self
            .wait_until(
                Stage::WaitConnectDownstream,
                downstream_service,
                downstream_connector,
                &self.config.connect,
            )
            .await?;

        tracing::info!(stage = %Stage::RunAction, service = %downstream.name, "running action");
        let output = action.run(&mut connection).await.map_err(HarnessError::Action)?;

        tracing::info!(stage = %Stage::AssertAction, service = %downstream.name, "verifying action result");
        action.verify(&output).map_err(HarnessError::Verification)?;

        Ok(output)
    }

    async fn start<'a>(
        &self,
        stage: Stage,
        definition: ServiceDefinition,
        started: &'a mut Vec<ManagedService>,
    ) -> Result<&'a ManagedService, HarnessError> {
        tracing::info!(%stage, service = %definition.name, image = %definition.image_ref(), "starting service");
        let service = ManagedService::start(&self.launcher, definition, self.config.marker_scan).await?;
        started.push(service);
        started.last().ok_or_else(|| HarnessError::Config("no started service to wait for".to_string()))
    }

    async fn wait_until<B: Bootstrapper>(
        &self,
        stage: Stage,
        service: &ManagedService,
        bootstrapper: &B,
        policy: &RetryPolicy,
    ) -> Result<B::Connection, HarnessError> {
        tracing::info!(%stage, service = service.name(), "waiting for service");

        let connection = retry_notify(
            policy,
            |attempt| {
                tracing::debug!(%stage, service = service.name(), attempt, "probing");
                readiness_gated(service.readiness(), bootstrapper, service.target())
            },
            |err, delay| {
                tracing::debug!(%stage, service = service.name(), delay_ms = delay.as_millis() as u64, "not ready: {err}");
            },
        )
        .await
        .map_err(|source| HarnessError::NotReady {
            service: service.name().to_string(),
            stage,
            source,
        })?;

        tracing::info!(%stage, service = service.name(), "service ready");
        Ok(connection)
    }

    /// Stops services in reverse start order. Every service is stopped even
    /// if an earlier stop fails; the first failure is returned.
    async fn teardown(started: Vec<ManagedService>) -> Result<(), HarnessError> {
        let mut first_error = None;
        for service in started.into_iter().rev() {
            let name = service.name().to_string();
            tracing::info!(stage = %Stage::Teardown, service = %name, "tearing down");
            if let Err(e) = service.shutdown().await {
                tracing::warn!(stage = %Stage::Teardown, service = %name, "teardown failed: {e}");
                first_error.get_or_insert(HarnessError::Teardown {
                    service: name,
                    reason: e.to_string(),
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapError;
    use crate::retry::{ProbeResult, RetryError};
    use crate::testing::{FnBootstrapper, InMemoryLauncher, ServiceScript};

    struct Echo;

    #[async_trait]
    impl SmokeAction<String> for Echo {
        type Output = String;

        async fn run(&self, connection: &mut String) -> anyhow::Result<String> {
            Ok(format!("echo via {connection}"))
        }
    }

    fn definitions() -> (ServiceDefinition, ServiceDefinition) {
        let upstream = ServiceDefinition::new("db", "mock-db", "1", "ready-A").with_port(9042);
        let downstream = ServiceDefinition::new("gateway", "mock-gateway", "1", "ready-B")
            .with_port(8090)
            .with_upstream_address_env("SEED");
        (upstream, downstream)
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            readiness: RetryPolicy::attempts(50, Duration::from_millis(10)),
            connect: RetryPolicy::attempts(5, Duration::from_millis(10)),
            marker_scan: MarkerScan::SlidingWindow,
            deadline: Some(Duration::from_secs(5)),
        }
    }

    #[test]
    fn test_stage_order_and_names() {
        assert!(Stage::StartUpstream < Stage::WaitReadyUpstream);
        assert!(Stage::AssertAction < Stage::Teardown);
        assert_eq!(Stage::WaitConnectDownstream.to_string(), "wait-connect-downstream");
    }

    #[tokio::test]
    async fn test_fatal_connect_short_circuits_and_tears_down() {
        let launcher = InMemoryLauncher::new();
        launcher.script("db", ServiceScript::new(["ready-A"]));
        launcher.script("gateway", ServiceScript::new(["ready-B"]));
        let (upstream, downstream) = definitions();

        let connector = FnBootstrapper::new(|_| {
            ProbeResult::<String, _>::Fatal(BootstrapError::Unauthorized("bad credentials".into()))
        });

        let orchestrator = Orchestrator::new(launcher.clone(), config());
        let err = orchestrator
            .run(&upstream, &downstream, &MarkerOnly, &connector, &Echo)
            .await
            .unwrap_err();

        match err {
            HarnessError::NotReady {
                stage,
                source: RetryError::Fatal { attempts, .. },
                ..
            } => {
                assert_eq!(stage, Stage::WaitConnectDownstream);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.calls(), 1);
        assert!(launcher.is_stopped("db"));
        assert!(launcher.is_stopped("gateway"));
    }

    #[tokio::test]
    async fn test_teardown_runs_in_reverse_start_order() {
        let launcher = InMemoryLauncher::new();
        launcher.script("db", ServiceScript::new(["ready-A"]));
        launcher.script("gateway", ServiceScript::new(["ready-B"]));
        let (upstream, downstream) = definitions();
        let connector = FnBootstrapper::new(|target| ProbeResult::Success(target.service.clone()));

        let output = Orchestrator::new(launcher.clone(), config())
            .run(&upstream, &downstream, &MarkerOnly, &connector, &Echo)
            .await
            .unwrap();

        assert_eq!(output, "echo via gateway");
        assert_eq!(launcher.stop_order(), vec!["gateway".to_string(), "db".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_aborts_run_and_tears_down() {
        let launcher = InMemoryLauncher::new();
        launcher.script("db", ServiceScript::new(["still booting"]));
        let (upstream, downstream) = definitions();
        let connector = FnBootstrapper::new(|_| ProbeResult::Success(String::new()));

        let config = OrchestratorConfig {
            readiness: RetryPolicy::attempts(u32::MAX, Duration::from_millis(10)),
            deadline: Some(Duration::from_millis(100)),
            ..config()
        };
        let err = Orchestrator::new(launcher.clone(), config)
            .run(&upstream, &downstream, &MarkerOnly, &connector, &Echo)
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Deadline(_)));
        assert!(launcher.is_stopped("db"));
        assert_eq!(launcher.launched().len(), 1);
    }
}
