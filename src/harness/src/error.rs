use std::time::Duration;

use crate::bootstrap::BootstrapError;
use crate::orchestrator::Stage;
use crate::retry::RetryError;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to start {service}: {reason}")]
    Start { service: String, reason: String },
    #[error("Failed to resolve endpoints of {service}: {reason}")]
    Endpoint { service: String, reason: String },
    #[error("{service} was not ready by the end of {stage}")]
    NotReady {
        service: String,
        stage: Stage,
        #[source]
        source: RetryError<BootstrapError>,
    },
    #[error("Action failed: {0:#}")]
    Action(anyhow::Error),
    #[error("Action result rejected: {0:#}")]
    Verification(anyhow::Error),
    #[error("Run did not finish within {0:?}")]
    Deadline(Duration),
    #[error("Failed to tear down {service}: {reason}")]
    Teardown { service: String, reason: String },
}

impl HarnessError {
    /// Stage in which the run failed, when it is known from the error alone.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            HarnessError::NotReady { stage, .. } => Some(*stage),
            HarnessError::Action(_) => Some(Stage::RunAction),
            HarnessError::Verification(_) => Some(Stage::AssertAction),
            HarnessError::Teardown { .. } => Some(Stage::Teardown),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_display_names_service_and_stage() {
        let err = HarnessError::NotReady {
            service: "stargate".to_string(),
            stage: Stage::WaitConnectDownstream,
            source: RetryError::Fatal {
                attempts: 1,
                error: BootstrapError::Unauthorized("bad password".to_string()),
            },
        };

        let msg = err.to_string();
        assert!(msg.contains("stargate"));
        assert!(msg.contains("wait-connect-downstream"));
        assert!(!msg.contains("bad password"));
        let cause = std::error::Error::source(&err).map(ToString::to_string).unwrap_or_default();
        assert!(cause.contains("bad password"), "{cause}");
        assert_eq!(err.stage(), Some(Stage::WaitConnectDownstream));
    }

    #[test]
    fn test_action_error_keeps_context_chain() {
        let err = HarnessError::Action(
            anyhow::anyhow!("connection reset").context("ExecuteQuery failed"),
        );
        assert_eq!(
            err.to_string(),
            "Action failed: ExecuteQuery failed: connection reset"
        );
        assert_eq!(err.stage(), Some(Stage::RunAction));
    }
}
