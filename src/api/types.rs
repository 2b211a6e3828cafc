use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordination::KillSwitchState;
use crate::domain::WorkerSnapshot;
use crate::error::WardenError;

// ============================================================================
// Error Types
// ============================================================================

/// Stable error codes returned by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BotNotFound,
    BotNotRunning,
    AlreadyRunning,
    KillSwitchActive,
    InvalidParameter,
    InvalidState,
    ApprovalRequired,
    DependencyFailure,
    WorkerFailure,
    StorageError,
    Unauthorized,
    ShuttingDown,
    InternalError,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::BotNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BotNotRunning | ErrorCode::AlreadyRunning | ErrorCode::InvalidState => {
                StatusCode::CONFLICT
            }
            ErrorCode::KillSwitchActive => StatusCode::LOCKED,
            ErrorCode::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorCode::ApprovalRequired => StatusCode::FORBIDDEN,
            ErrorCode::DependencyFailure => StatusCode::FAILED_DEPENDENCY,
            ErrorCode::WorkerFailure => StatusCode::BAD_GATEWAY,
            ErrorCode::StorageError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }
}

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        let code = match &err {
            WardenError::WorkerNotFound(_) => ErrorCode::BotNotFound,
            WardenError::NotRunning(_) => ErrorCode::BotNotRunning,
            WardenError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
            WardenError::KillSwitchActive { .. } => ErrorCode::KillSwitchActive,
            WardenError::ApprovalRequired(_) => ErrorCode::ApprovalRequired,
            WardenError::DependencyFailure { .. } => ErrorCode::DependencyFailure,
            WardenError::InvalidStateTransition { .. }
            | WardenError::InvalidKillSwitchTransition(_)
            | WardenError::Cancelled => ErrorCode::InvalidState,
            WardenError::Validation(_)
            | WardenError::Json(_)
            | WardenError::DuplicateWorker(_)
            | WardenError::UnknownDependency { .. }
            | WardenError::CyclicDependency { .. } => ErrorCode::InvalidParameter,
            WardenError::Storage(_)
            | WardenError::Io(_)
            | WardenError::CheckpointNotFound(_) => ErrorCode::StorageError,
            WardenError::StartupTimeout { .. }
            | WardenError::WorkerFailure { .. }
            | WardenError::Timeout(_)
            | WardenError::ConnectionRefused(_)
            | WardenError::Http(_) => ErrorCode::WorkerFailure,
            _ => ErrorCode::InternalError,
        };
        Self::new(code, err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
    pub timestamp: DateTime<Utc>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
            code: self.code,
            timestamp: Utc::now(),
        };
        (self.code.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============================================================================
// Control Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub bot: String,
    #[serde(default)]
    pub safe_mode: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    /// Worker id, or `all`
    pub bot: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BotRequest {
    pub bot: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatusResponse {
    pub bot: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillSwitchAction {
    Activate,
    Deactivate,
    Override,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchRequest {
    pub action: KillSwitchAction,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub approved_by: Option<String>,
    /// Recorded in the audit log; defaults to `api`
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchResponse {
    pub kill_switch_active: bool,
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct RecoveryRequest {
    pub bot: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResponse {
    pub bot: String,
    pub recovery_started: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSequentialRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub safe_mode: bool,
    /// Only auto-start workers and their dependencies
    #[serde(default)]
    pub auto_start_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSequentialResponse {
    pub bots_started: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopAllRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllResponse {
    pub bots_stopped: Vec<String>,
    pub failures: Vec<StopFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopFailure {
    pub bot: String,
    pub error: String,
}

// ============================================================================
// System Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMetrics {
    pub total: usize,
    pub running: usize,
    pub paused: usize,
    pub errored: usize,
    pub stopped: usize,
    pub coalesced_breaches: u64,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub bots: Vec<WorkerSnapshot>,
    pub kill_switch_active: bool,
    pub kill_switch: KillSwitchState,
    pub metrics: FleetMetrics,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime: i64,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_codes_serialize_screaming_snake() {
        assert_eq!(
            serde_json::to_value(ErrorCode::KillSwitchActive).unwrap(),
            json!("KILL_SWITCH_ACTIVE")
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::BotNotRunning).unwrap(),
            json!("BOT_NOT_RUNNING")
        );
    }

    #[test]
    fn test_warden_errors_map_to_codes() {
        let err: ApiError = WardenError::WorkerNotFound("x".into()).into();
        assert_eq!(err.code, ErrorCode::BotNotFound);
        let err: ApiError = WardenError::DependencyFailure {
            worker_id: "risk".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::DependencyFailure);
        assert_eq!(err.code.status(), StatusCode::FAILED_DEPENDENCY);
    }

    #[test]
    fn test_kill_switch_request_parses_camel_case() {
        let req: KillSwitchRequest = serde_json::from_value(json!({
            "action": "override",
            "reason": "postmortem done",
            "approvedBy": "alice"
        }))
        .unwrap();
        assert_eq!(req.action, KillSwitchAction::Override);
        assert_eq!(req.approved_by.as_deref(), Some("alice"));
    }
}
