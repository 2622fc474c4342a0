//! Error types for the replacer

use thiserror::Error;

/// Replacer result type
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while replacing a cluster host
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// ECS SDK error
    #[error("ECS error: {0}")]
    Ecs(#[from] aws_sdk_ecs::Error),

    /// Auto Scaling SDK error
    #[error("Auto Scaling error: {0}")]
    AutoScaling(#[from] aws_sdk_autoscaling::Error),

    /// Generic AWS service error
    #[error("AWS service error: {0}")]
    AwsService(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// More than one ACTIVE container instance in the cluster
    #[error("Found {count} active container instances; only single-instance clusters are supported")]
    MultipleInstancesUnsupported { count: usize },

    /// No ACTIVE container instance in the cluster
    #[error("No active container instances found in cluster {cluster}")]
    NoInstancesFound { cluster: String },

    /// Host is not a member of any auto scaling group
    #[error("Instance {host} is not part of an auto scaling group")]
    NotInAutoScalingGroup { host: String },

    /// Capacity request with sizes out of order
    #[error("Invalid capacity: min={min}, desired={desired}, max={max}")]
    InvalidCapacity { min: u32, desired: u32, max: u32 },

    /// Container instance status string we do not understand
    #[error("Unknown container instance status: {0}")]
    UnknownInstanceStatus(String),

    /// Remote response missing a field we rely on
    #[error("Response missing field: {0}")]
    MissingField(&'static str),

    /// Bounded wait ran out of attempts
    #[error("Gave up waiting for {condition} after {attempts} attempts")]
    WaitExhausted { condition: String, attempts: u32 },

    /// Confirmation input closed before an answer was given
    #[error("Confirmation input closed before an answer was given")]
    ConfirmationClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Convert from ECS SDK error
    pub fn from_ecs<E>(err: E) -> Self
    where
        aws_sdk_ecs::Error: From<E>,
    {
        Self::Ecs(aws_sdk_ecs::Error::from(err))
    }

    /// Convert from Auto Scaling SDK error
    pub fn from_autoscaling<E>(err: E) -> Self
    where
        aws_sdk_autoscaling::Error: From<E>,
    {
        Self::AutoScaling(aws_sdk_autoscaling::Error::from(err))
    }

    /// Convert from generic AWS SDK error
    pub fn from_aws<E>(err: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::AwsService(err.to_string())
    }

    /// Whether this error is a safety precondition that stops the run before any mutation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::MultipleInstancesUnsupported { .. }
                | Self::NoInstancesFound { .. }
                | Self::NotInAutoScalingGroup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(OrchestratorError::MultipleInstancesUnsupported { count: 2 }.is_precondition());
        assert!(
            OrchestratorError::NoInstancesFound {
                cluster: "c1".to_string()
            }
            .is_precondition()
        );
        assert!(!OrchestratorError::ConfirmationClosed.is_precondition());
        assert!(!OrchestratorError::from_aws("AccessDenied").is_precondition());
    }

    #[test]
    fn test_error_messages() {
        let err = OrchestratorError::InvalidCapacity {
            min: 3,
            desired: 2,
            max: 2,
        };
        assert_eq!(err.to_string(), "Invalid capacity: min=3, desired=2, max=2");

        let err = OrchestratorError::WaitExhausted {
            condition: "replacement instance ACTIVE".to_string(),
            attempts: 5,
        };
        assert!(err.to_string().contains("after 5 attempts"));
    }
}
