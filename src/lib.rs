//! Starts Cassandra and a Stargate gateway in front of it, waits for both to
//! become usable, and runs a single query through the gateway's gRPC API.

pub mod config;
pub mod containers;
pub mod cql;
pub mod smoke;

pub use config::{ConfigError, CqlProbeConfig, SmokeConfig};
pub use containers::{ContainerProcess, DockerLauncher, ServiceImage};
pub use cql::CqlOptionsProbe;
pub use smoke::{CqlExecutor, SystemLocalQuery, run_smoke, run_with_launcher};
