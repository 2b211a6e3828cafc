use thiserror::Error;

/// Main error type for the supervisor core
#[derive(Error, Debug)]
pub enum WardenError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Registration / dependency graph errors
    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("Unknown worker: {0}")]
    WorkerNotFound(String),

    #[error("Worker {worker_id} depends on unregistered worker {dependency}")]
    UnknownDependency { worker_id: String, dependency: String },

    #[error("Cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("Dependency failure: critical worker {worker_id} failed to start")]
    DependencyFailure { worker_id: String },

    // Lifecycle errors
    #[error("Worker already running: {0}")]
    AlreadyRunning(String),

    #[error("Worker not running: {0}")]
    NotRunning(String),

    #[error("Invalid state transition for {worker_id}: from {from} to {to}")]
    InvalidStateTransition {
        worker_id: String,
        from: String,
        to: String,
    },

    #[error("Worker startup timed out after {elapsed_ms}ms: {worker_id}")]
    StartupTimeout { worker_id: String, elapsed_ms: u64 },

    #[error("Worker operation failed: {worker_id} - {reason}")]
    WorkerFailure { worker_id: String, reason: String },

    // Safety errors
    #[error("Kill switch active ({phase}): {reason}")]
    KillSwitchActive { phase: String, reason: String },

    #[error("Kill switch transition rejected: {0}")]
    InvalidKillSwitchTransition(String),

    #[error("Operator approval required: {0}")]
    ApprovalRequired(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checkpoint not found for state type: {0}")]
    CheckpointNotFound(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for WardenError
pub type Result<T> = std::result::Result<T, WardenError>;

/// Coarse error taxonomy used for retry and escalation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/API timeouts, rate limits, 5xx: retried with backoff
    Transient,
    /// Filesystem, disk-full, permission: fatal to the operation only
    Resource,
    /// Malformed or missing configuration: fatal at load time
    Configuration,
    /// Trigger breach, freeze, kill switch: routed through the kill switch
    Safety,
    /// Caller asked for something the current state forbids
    Conflict,
    /// Unknown worker or checkpoint
    NotFound,
    /// Invalid input, 4xx, auth
    Validation,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Resource => write!(f, "resource"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Safety => write!(f, "safety"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl WardenError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WardenError::Config(_) | WardenError::InvalidConfig(_) => ErrorKind::Configuration,

            WardenError::DuplicateWorker(_)
            | WardenError::CyclicDependency { .. }
            | WardenError::UnknownDependency { .. }
            | WardenError::Validation(_)
            | WardenError::ApprovalRequired(_)
            | WardenError::Json(_) => ErrorKind::Validation,

            WardenError::WorkerNotFound(_) | WardenError::CheckpointNotFound(_) => {
                ErrorKind::NotFound
            }

            WardenError::AlreadyRunning(_)
            | WardenError::NotRunning(_)
            | WardenError::InvalidStateTransition { .. }
            | WardenError::InvalidKillSwitchTransition(_)
            | WardenError::Cancelled => ErrorKind::Conflict,

            WardenError::KillSwitchActive { .. } | WardenError::DependencyFailure { .. } => {
                ErrorKind::Safety
            }

            WardenError::StartupTimeout { .. }
            | WardenError::Timeout(_)
            | WardenError::ConnectionRefused(_)
            | WardenError::RateLimited(_) => ErrorKind::Transient,

            WardenError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorKind::Transient
                } else if let Some(status) = e.status() {
                    if status.is_server_error() || status.as_u16() == 429 {
                        ErrorKind::Transient
                    } else {
                        ErrorKind::Validation
                    }
                } else {
                    ErrorKind::Transient
                }
            }

            WardenError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock => ErrorKind::Transient,
                _ => ErrorKind::Resource,
            },

            WardenError::Storage(_) => ErrorKind::Resource,

            WardenError::WorkerFailure { .. }
            | WardenError::Internal(_)
            | WardenError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(WardenError::Timeout("poll".into()).is_transient());
        assert!(WardenError::ConnectionRefused("127.0.0.1:9000".into()).is_transient());
        assert!(WardenError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!WardenError::Validation("bad".into()).is_transient());
        assert!(!WardenError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .is_transient());
    }

    #[test]
    fn test_cycle_message_lists_path() {
        let err = WardenError::CyclicDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_safety_errors() {
        let err = WardenError::KillSwitchActive {
            phase: "active".into(),
            reason: "loss limit".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Safety);
        assert_eq!(
            WardenError::DependencyFailure { worker_id: "b".into() }.kind(),
            ErrorKind::Safety
        );
    }
}
