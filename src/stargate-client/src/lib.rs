//! Authenticated gRPC access to a Stargate data gateway.

#[allow(clippy::all, dead_code)]
pub mod proto {
    tonic::include_proto!("stargate");
}

pub mod auth;
pub mod bootstrap;
pub mod client;
pub mod render;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, AuthToken, Credentials, TOKEN_HEADER, TableAuthProvider, TokenInterceptor};
pub use bootstrap::{ConnectSettings, StargateConnector};
pub use client::{QueryError, StargateSession};
pub use render::{ResultTable, format_value};
