use axum::{extract::State, http::HeaderMap, Json};
use tracing::{info, warn};

use crate::api::extract::{ApiJson, OptionalJson};
use crate::api::{auth::ensure_admin_authorized, state::AppState, types::*};
use crate::domain::WorkerStatus;
use crate::error::WardenError;
use crate::supervisor::{RecoverOptions, SequenceOptions, StartOptions, StartSelection};

const API_ACTOR: &str = "api";

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    ensure_admin_authorized(headers, state.admin_fingerprint.as_deref())?;
    state.ensure_accepting()
}

fn reason_or(reason: Option<String>, fallback: &str) -> String {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// POST /start
///
/// Validates synchronously, then starts in the background; poll `/status`
/// for the outcome.
pub async fn start_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<StartRequest>,
) -> ApiResult<BotStatusResponse> {
    authorize(&state, &headers)?;
    let ctx = state.ctx.clone();

    ctx.kill_switch.ensure_start_allowed()?;
    let status = ctx
        .supervisor
        .status_of(&req.bot)
        .await
        .ok_or_else(|| WardenError::WorkerNotFound(req.bot.clone()))?;
    if matches!(
        status,
        WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Paused
    ) {
        return Err(WardenError::AlreadyRunning(req.bot).into());
    }

    let bot = req.bot.clone();
    let options = StartOptions {
        safe_mode: req.safe_mode,
    };
    tokio::spawn(async move {
        if let Err(e) = ctx.supervisor.start(&bot, options).await {
            warn!("Background start of {} failed: {}", bot, e);
        }
    });

    Ok(Json(BotStatusResponse {
        bot: req.bot,
        status: "starting".to_string(),
    }))
}

/// POST /stop -- `bot: "all"` stops the fleet in reverse dependency order
pub async fn stop_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<StopRequest>,
) -> ApiResult<BotStatusResponse> {
    authorize(&state, &headers)?;
    let reason = reason_or(req.reason, "operator stop");

    if req.bot.eq_ignore_ascii_case("all") {
        let report = state.ctx.supervisor.stop_all(&reason).await;
        if let Some((id, err)) = report.failures.into_iter().next() {
            return Err(WardenError::WorkerFailure {
                worker_id: id,
                reason: err,
            }
            .into());
        }
        return Ok(Json(BotStatusResponse {
            bot: "all".to_string(),
            status: "stopped".to_string(),
        }));
    }

    state.ctx.supervisor.stop(&req.bot, &reason).await?;
    Ok(Json(BotStatusResponse {
        bot: req.bot,
        status: "stopped".to_string(),
    }))
}

/// POST /pause
pub async fn pause_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<BotRequest>,
) -> ApiResult<BotStatusResponse> {
    authorize(&state, &headers)?;
    state.ctx.supervisor.pause(&req.bot).await?;
    status_response(&state, req.bot).await
}

/// POST /resume
pub async fn resume_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<BotRequest>,
) -> ApiResult<BotStatusResponse> {
    authorize(&state, &headers)?;
    state.ctx.supervisor.resume(&req.bot).await?;
    status_response(&state, req.bot).await
}

async fn status_response(state: &AppState, bot: String) -> ApiResult<BotStatusResponse> {
    let status = state
        .ctx
        .supervisor
        .status_of(&bot)
        .await
        .ok_or_else(|| WardenError::WorkerNotFound(bot.clone()))?;
    Ok(Json(BotStatusResponse {
        bot,
        status: status.as_str().to_string(),
    }))
}

/// POST /kill-switch
pub async fn kill_switch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<KillSwitchRequest>,
) -> ApiResult<KillSwitchResponse> {
    authorize(&state, &headers)?;
    let actor = req
        .actor
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(API_ACTOR);
    let kill_switch = &state.ctx.kill_switch;

    let (ks, message) = match req.action {
        KillSwitchAction::Activate => (
            kill_switch.activate(&req.reason, actor).await?,
            "kill switch activated; all workers halted",
        ),
        KillSwitchAction::Deactivate => (
            kill_switch.deactivate(&req.reason, actor).await?,
            "kill switch re-armed",
        ),
        KillSwitchAction::Override => (
            kill_switch
                .override_switch(&req.reason, req.approved_by.as_deref(), actor)
                .await?,
            "kill switch overridden; starts allowed",
        ),
    };
    info!("Kill switch {:?} by {}: now {}", req.action, actor, ks.phase);

    Ok(Json(KillSwitchResponse {
        kill_switch_active: ks.phase.blocks_starts(),
        phase: ks.phase.as_str().to_string(),
        message: message.to_string(),
    }))
}

/// POST /recovery -- validation is synchronous, the restore runs in the background
pub async fn recovery_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<RecoveryRequest>,
) -> ApiResult<RecoveryResponse> {
    authorize(&state, &headers)?;
    let ctx = state.ctx.clone();

    ctx.kill_switch.ensure_start_allowed()?;
    let status = ctx
        .supervisor
        .status_of(&req.bot)
        .await
        .ok_or_else(|| WardenError::WorkerNotFound(req.bot.clone()))?;
    let recoverable = matches!(status, WorkerStatus::Stopped | WorkerStatus::Error);
    if !recoverable && !req.force {
        return Err(WardenError::AlreadyRunning(req.bot).into());
    }

    let bot = req.bot.clone();
    let options = RecoverOptions { force: req.force };
    tokio::spawn(async move {
        match ctx.supervisor.recover(&bot, options).await {
            Ok(Some(checkpoint_id)) => {
                info!("Recovered {} from checkpoint {}", bot, checkpoint_id)
            }
            Ok(None) => info!("Recovered {} without a checkpoint", bot),
            Err(e) => warn!("Recovery of {} failed: {}", bot, e),
        }
    });

    Ok(Json(RecoveryResponse {
        bot: req.bot,
        recovery_started: true,
    }))
}

/// POST /start-sequential
pub async fn start_sequential_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    OptionalJson(req): OptionalJson<StartSequentialRequest>,
) -> ApiResult<StartSequentialResponse> {
    authorize(&state, &headers)?;
    let reason = reason_or(req.reason, "operator request");
    info!("Sequential start requested: {}", reason);

    let options = SequenceOptions {
        safe_mode: req.safe_mode,
        selection: if req.auto_start_only {
            StartSelection::AutoStart
        } else {
            StartSelection::All
        },
    };
    let started = state.ctx.supervisor.start_sequential(options).await?;
    Ok(Json(StartSequentialResponse {
        bots_started: started,
    }))
}

/// POST /stop-all
pub async fn stop_all_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    OptionalJson(req): OptionalJson<StopAllRequest>,
) -> ApiResult<StopAllResponse> {
    authorize(&state, &headers)?;
    let reason = reason_or(req.reason, "operator stop-all");
    let report = state.ctx.supervisor.stop_all(&reason).await;
    Ok(Json(StopAllResponse {
        bots_stopped: report.stopped,
        failures: report
            .failures
            .into_iter()
            .map(|(bot, error)| StopFailure { bot, error })
            .collect(),
    }))
}
