use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use harness::{MarkerScan, OrchestratorConfig, RetryPolicy, ServiceDefinition};
use serde::{Deserialize, Serialize};
use stargate_client::{ConnectSettings, Credentials};

pub const CONFIG_FILE: &str = "stargate-smoke.toml";
pub const ENV_PREFIX: &str = "STARGATE_SMOKE__";

pub const CASSANDRA_NATIVE_PORT: u16 = 9042;
pub const STARGATE_GRPC_PORT: u16 = 8090;
pub const STARGATE_AUTH_PORT: u16 = 8081;

const CLUSTER_NAME: &str = "c3-cluster";

/// Settings of the native-protocol probe against the database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CqlProbeConfig {
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Time allowed for the OPTIONS round trip once connected.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for CqlProbeConfig {
    fn default() -> Self {
        Self {
            port: CASSANDRA_NATIVE_PORT,
            connect_timeout: Duration::from_secs(2),
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmokeConfig {
    /// The database, started first.
    pub upstream: ServiceDefinition,
    /// The gateway, started once the database accepts sessions.
    pub downstream: ServiceDefinition,
    /// Budget for each service to log its marker and, for the database,
    /// answer the native-protocol probe.
    pub readiness: RetryPolicy,
    /// Budget and backoff for establishing the gateway session.
    pub connect_backoff: RetryPolicy,
    pub cql_probe: CqlProbeConfig,
    pub connect: ConnectSettings,
    pub credentials: Credentials,
    /// Statement executed against the gateway.
    pub query: String,
    pub marker_scan: MarkerScan,
    /// Upper bound for the whole run, teardown excluded.
    #[serde(with = "humantime_serde")]
    pub deadline: Option<Duration>,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            upstream: cassandra(),
            downstream: stargate(),
            readiness: RetryPolicy::default()
                .with_backoff(Duration::from_secs(1), 1.0, Duration::from_secs(1))
                .with_max_elapsed(Duration::from_secs(300)),
            connect_backoff: RetryPolicy::default()
                .with_backoff(Duration::from_secs(1), 1.6, Duration::from_secs(20))
                .with_jitter(0.2)
                .with_max_elapsed(Duration::from_secs(120)),
            cql_probe: CqlProbeConfig::default(),
            connect: ConnectSettings {
                grpc_port: STARGATE_GRPC_PORT,
                auth_port: STARGATE_AUTH_PORT,
                ..ConnectSettings::default()
            },
            credentials: Credentials::default(),
            query: "SELECT * FROM system.local".to_string(),
            marker_scan: MarkerScan::SlidingWindow,
            deadline: Some(Duration::from_secs(900)),
        }
    }
}

fn cassandra() -> ServiceDefinition {
    ServiceDefinition::new("cassandra", "cassandra", "3.11.13", "Created default superuser role")
        .with_hostname("backend-1")
        .with_env("HEAP_NEWSIZE", "128M")
        .with_env("MAX_HEAP_SIZE", "1024M")
        .with_env("CASSANDRA_SEEDS", "backend-1")
        .with_env("CASSANDRA_CLUSTER_NAME", CLUSTER_NAME)
        .with_port(CASSANDRA_NATIVE_PORT)
}

fn stargate() -> ServiceDefinition {
    ServiceDefinition::new(
        "stargate",
        "stargateio/stargate-3_11",
        "v1.0.77",
        "Finished starting bundles.",
    )
    .with_hostname("stargate")
    .with_env("JAVA_OPTS", "-Xmx2G")
    .with_env("CLUSTER_NAME", CLUSTER_NAME)
    .with_env("CLUSTER_VERSION", "3.11")
    .with_env("RACK_NAME", "rack1")
    .with_env("DATACENTER_NAME", "datacenter1")
    .with_env("ENABLE_AUTH", "true")
    .with_port(STARGATE_GRPC_PORT)
    .with_port(STARGATE_AUTH_PORT)
    .with_upstream_address_env("SEED")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl SmokeConfig {
    /// Defaults, then `stargate-smoke.toml` in the working directory, then
    /// `STARGATE_SMOKE__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(CONFIG_FILE)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: SmokeConfig = Self::figment(path.as_ref()).extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SmokeConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream
            .validate()
            .and_then(|()| self.downstream.validate())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        self.readiness
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("readiness: {e}")))?;
        self.connect_backoff
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("connect_backoff: {e}")))?;

        if self.downstream.upstream_address_env.is_none() {
            return Err(ConfigError::Invalid(format!(
                "{}: upstream_address_env must name the variable that receives the {} address",
                self.downstream.name, self.upstream.name
            )));
        }
        if !self.upstream.ports.contains(&self.cql_probe.port) {
            return Err(ConfigError::Invalid(format!(
                "{} does not publish the probe port {}",
                self.upstream.name, self.cql_probe.port
            )));
        }
        for port in [self.connect.grpc_port, self.connect.auth_port] {
            if !self.downstream.ports.contains(&port) {
                return Err(ConfigError::Invalid(format!(
                    "{} does not publish port {port}",
                    self.downstream.name
                )));
            }
        }
        if self.query.trim().is_empty() {
            return Err(ConfigError::Invalid("query must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            readiness: self.readiness.clone(),
            connect: self.connect_backoff.clone(),
            marker_scan: self.marker_scan,
            deadline: self.deadline,
        }
    }
}
