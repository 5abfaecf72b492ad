// Error taxonomy shared by the collector, evaluator, webhook gateway and deployer.

use std::time::Duration;

/// Failure of a single call against the container runtime or a local command.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("unit {0} not found")]
    NotFound(String),
    #[error("{operation} timed out after {}s", .limit.as_secs())]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
    #[error("runtime API error: {0}")]
    Api(String),
    #[error("`{command}` exited with {}: {stderr}", exit_label(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "signal".to_string(),
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

/// Core error taxonomy. `kind()` is the stable tag written into persisted failure reasons.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    TransientRuntime(#[from] RuntimeError),
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    Authentication(&'static str),
    #[error("{0}")]
    StateConflict(String),
    #[error("{0}")]
    IrrecoverableDeployment(String),
    #[error("{0}")]
    Malformed(String),
    #[error("storage: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::TransientRuntime(_) => "transient_runtime",
            CoreError::Configuration(_) => "configuration",
            CoreError::Authentication(_) => "authentication",
            CoreError::StateConflict(_) => "state_conflict",
            CoreError::IrrecoverableDeployment(_) => "irrecoverable_deployment",
            CoreError::Malformed(_) => "malformed",
            CoreError::Storage(_) => "storage",
        }
    }

    /// Only runtime hiccups are worth another attempt; everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientRuntime(_))
    }
}
