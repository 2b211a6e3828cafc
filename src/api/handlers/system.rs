use axum::{
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::fmt::Write;

use crate::api::{state::AppState, types::*};
use crate::coordination::KillSwitchPhase;
use crate::domain::{WorkerSnapshot, WorkerStatus};
use crate::persistence::AuditEntry;
use crate::supervisor::Alert;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1_000;

fn fleet_metrics(state: &AppState, bots: &[WorkerSnapshot]) -> FleetMetrics {
    let count = |status: WorkerStatus| bots.iter().filter(|b| b.status == status).count();
    FleetMetrics {
        total: bots.len(),
        running: count(WorkerStatus::Running),
        paused: count(WorkerStatus::Paused),
        errored: count(WorkerStatus::Error),
        stopped: count(WorkerStatus::Stopped),
        coalesced_breaches: state.ctx.kill_switch.coalesced_breaches(),
        uptime_seconds: state.ctx.uptime_seconds(),
    }
}

/// GET /status
pub async fn status_handler(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let bots = state.ctx.supervisor.snapshot().await;
    let kill_switch = state.ctx.kill_switch.state();
    let metrics = fleet_metrics(&state, &bots);

    Ok(Json(StatusResponse {
        kill_switch_active: kill_switch.phase.blocks_starts(),
        kill_switch,
        metrics,
        bots,
        timestamp: Utc::now(),
    }))
}

/// GET /health -- liveness of the supervisor process itself
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime: state.ctx.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /metrics -- Prometheus text exposition
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let bots = state.ctx.supervisor.snapshot().await;
    let phase = state.ctx.kill_switch.phase();
    let body = render_metrics(&bots, phase, &fleet_metrics(&state, &bots));
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn render_metrics(bots: &[WorkerSnapshot], phase: KillSwitchPhase, fleet: &FleetMetrics) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP botwarden_uptime_seconds Supervisor uptime");
    let _ = writeln!(out, "# TYPE botwarden_uptime_seconds gauge");
    let _ = writeln!(out, "botwarden_uptime_seconds {}", fleet.uptime_seconds);

    let _ = writeln!(out, "# HELP botwarden_kill_switch_active 1 while starts are blocked");
    let _ = writeln!(out, "# TYPE botwarden_kill_switch_active gauge");
    let _ = writeln!(
        out,
        "botwarden_kill_switch_active{{phase=\"{}\"}} {}",
        phase.as_str(),
        u8::from(phase.blocks_starts())
    );

    let _ = writeln!(out, "# HELP botwarden_breaches_coalesced_total Breaches ignored while halted");
    let _ = writeln!(out, "# TYPE botwarden_breaches_coalesced_total counter");
    let _ = writeln!(out, "botwarden_breaches_coalesced_total {}", fleet.coalesced_breaches);

    let _ = writeln!(out, "# HELP botwarden_workers Workers by status");
    let _ = writeln!(out, "# TYPE botwarden_workers gauge");
    for (status, n) in [
        ("running", fleet.running),
        ("paused", fleet.paused),
        ("error", fleet.errored),
        ("stopped", fleet.stopped),
    ] {
        let _ = writeln!(out, "botwarden_workers{{status=\"{}\"}} {}", status, n);
    }

    let _ = writeln!(out, "# HELP botwarden_worker_health Health score 0-100");
    let _ = writeln!(out, "# TYPE botwarden_worker_health gauge");
    for bot in bots {
        let _ = writeln!(out, "botwarden_worker_health{{worker=\"{}\"}} {}", bot.id, bot.health);
    }

    let _ = writeln!(out, "# HELP botwarden_worker_restarts_total Restarts per worker");
    let _ = writeln!(out, "# TYPE botwarden_worker_restarts_total counter");
    for bot in bots {
        let _ = writeln!(
            out,
            "botwarden_worker_restarts_total{{worker=\"{}\"}} {}",
            bot.id, bot.restart_count
        );
    }

    let _ = writeln!(out, "# HELP botwarden_worker_errors_total Errors per worker");
    let _ = writeln!(out, "# TYPE botwarden_worker_errors_total counter");
    for bot in bots {
        let _ = writeln!(
            out,
            "botwarden_worker_errors_total{{worker=\"{}\"}} {}",
            bot.id, bot.error_count
        );
    }

    out
}

/// GET /audit?limit=
pub async fn audit_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let entries = state.ctx.audit.recent(limit).await?;
    Ok(Json(entries))
}

/// GET /alerts?limit=
pub async fn alerts_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Alert>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Json(state.ctx.alerts.recent(limit).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_metrics_labels_workers() {
        let bot = WorkerSnapshot {
            id: "trader".to_string(),
            status: WorkerStatus::Running,
            health: 87,
            classification: Default::default(),
            error_count: 2,
            restart_count: 1,
            last_heartbeat_at: None,
            started_at: None,
            safe_mode: false,
            critical: true,
            depends_on: Vec::new(),
            last_error: None,
        };
        let fleet = FleetMetrics {
            total: 1,
            running: 1,
            paused: 0,
            errored: 0,
            stopped: 0,
            coalesced_breaches: 3,
            uptime_seconds: 42,
        };

        let text = render_metrics(&[bot], KillSwitchPhase::Cooldown, &fleet);
        assert!(text.contains("botwarden_kill_switch_active{phase=\"COOLDOWN\"} 1"));
        assert!(text.contains("botwarden_worker_health{worker=\"trader\"} 87"));
        assert!(text.contains("botwarden_worker_restarts_total{worker=\"trader\"} 1"));
        assert!(text.contains("botwarden_breaches_coalesced_total 3"));
        assert!(text.contains("botwarden_workers{status=\"running\"} 1"));
    }
}
