//! Kill switch trigger conditions
//!
//! Each trigger is a pure predicate over a worker's [`MetricsWindow`]. The
//! window is fed by health samples and is the only input a predicate sees.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::domain::HealthSample;

/// What to do when a trigger fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerAction {
    /// Activate the kill switch and stop the whole fleet
    StopAll,
    /// Pause only the offending worker; phase unchanged
    PauseWorker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// `threshold` failed polls in a row, all within the window
    ConsecutiveFailures { threshold: u32, window_minutes: u64 },
    /// More than `max_errors` failed polls within the window
    ErrorBurst { max_errors: u32, window_secs: u64 },
    /// Reported daily PnL at or below `-limit_usd`
    DailyLoss { limit_usd: Decimal },
    /// Equity fell this many percent below its peak in the window
    EquityDrawdown { max_drawdown_pct: Decimal },
    /// Health monitor classified the worker frozen
    Frozen,
    /// Health score below `min_score` once enough samples exist
    LowHealthScore {
        min_score: u8,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
}

fn default_min_samples() -> usize {
    5
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub name: String,
    pub kind: TriggerKind,
    pub action: TriggerAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A fired trigger
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breach {
    pub trigger: String,
    pub action: TriggerAction,
    pub worker_id: String,
    pub detail: String,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.trigger, self.worker_id, self.detail)
    }
}

impl TriggerCondition {
    pub fn new(name: &str, kind: TriggerKind, action: TriggerAction) -> Self {
        Self {
            name: name.to_string(),
            kind,
            action,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match &self.kind {
            TriggerKind::ConsecutiveFailures {
                threshold,
                window_minutes,
            } => {
                if *threshold == 0 || *window_minutes == 0 {
                    return Err("threshold and window_minutes must be positive".into());
                }
            }
            TriggerKind::ErrorBurst { window_secs, .. } => {
                if *window_secs == 0 {
                    return Err("window_secs must be positive".into());
                }
            }
            TriggerKind::DailyLoss { limit_usd } => {
                if *limit_usd <= Decimal::ZERO {
                    return Err("limit_usd must be positive".into());
                }
            }
            TriggerKind::EquityDrawdown { max_drawdown_pct } => {
                if *max_drawdown_pct <= Decimal::ZERO || *max_drawdown_pct > Decimal::from(100) {
                    return Err("max_drawdown_pct must be in (0, 100]".into());
                }
            }
            TriggerKind::Frozen => {}
            TriggerKind::LowHealthScore { min_score, .. } => {
                if *min_score > 100 {
                    return Err("min_score must be at most 100".into());
                }
            }
        }
        Ok(())
    }

    /// How far back this trigger looks
    pub fn lookback(&self) -> ChronoDuration {
        match &self.kind {
            TriggerKind::ConsecutiveFailures { window_minutes, .. } => {
                ChronoDuration::minutes(*window_minutes as i64)
            }
            TriggerKind::ErrorBurst { window_secs, .. } => {
                ChronoDuration::seconds(*window_secs as i64)
            }
            _ => ChronoDuration::zero(),
        }
    }

    /// Evaluate against one worker's window
    pub fn evaluate(&self, window: &MetricsWindow, now: DateTime<Utc>) -> Option<Breach> {
        if !self.enabled {
            return None;
        }

        let detail = match &self.kind {
            TriggerKind::ConsecutiveFailures {
                threshold,
                window_minutes,
            } => {
                let since = now - ChronoDuration::minutes(*window_minutes as i64);
                let streak = window
                    .samples
                    .iter()
                    .rev()
                    .take_while(|s| !s.healthy && s.timestamp >= since)
                    .count() as u32;
                (streak >= *threshold).then(|| {
                    format!(
                        "{} consecutive failures within {} minutes",
                        streak, window_minutes
                    )
                })
            }
            TriggerKind::ErrorBurst {
                max_errors,
                window_secs,
            } => {
                let since = now - ChronoDuration::seconds(*window_secs as i64);
                let errors = window
                    .samples
                    .iter()
                    .filter(|s| !s.healthy && s.timestamp >= since)
                    .count() as u32;
                (errors > *max_errors)
                    .then(|| format!("{} errors within {}s", errors, window_secs))
            }
            TriggerKind::DailyLoss { limit_usd } => window.latest_pnl().and_then(|pnl| {
                (pnl <= -*limit_usd)
                    .then(|| format!("daily PnL {} breached loss limit {}", pnl, limit_usd))
            }),
            TriggerKind::EquityDrawdown { max_drawdown_pct } => {
                window.drawdown_pct().and_then(|dd| {
                    (dd >= *max_drawdown_pct).then(|| {
                        format!("equity drawdown {}% >= {}%", dd.round_dp(2), max_drawdown_pct)
                    })
                })
            }
            TriggerKind::Frozen => window.frozen.then(|| "worker frozen".to_string()),
            TriggerKind::LowHealthScore {
                min_score,
                min_samples,
            } => match window.score {
                Some(score) if window.samples.len() >= *min_samples && score < *min_score => {
                    Some(format!("health score {} below {}", score, min_score))
                }
                _ => None,
            },
        }?;

        Some(Breach {
            trigger: self.name.clone(),
            action: self.action,
            worker_id: window.worker_id.clone(),
            detail,
        })
    }
}

/// Triggers used when the configuration lists none
pub fn default_triggers() -> Vec<TriggerCondition> {
    vec![
        TriggerCondition::new(
            "consecutive-failures",
            TriggerKind::ConsecutiveFailures {
                threshold: 5,
                window_minutes: 30,
            },
            TriggerAction::StopAll,
        ),
        TriggerCondition::new("frozen-worker", TriggerKind::Frozen, TriggerAction::StopAll),
    ]
}

/// Recent samples and derived signals for one worker
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    pub worker_id: String,
    samples: VecDeque<HealthSample>,
    retention: ChronoDuration,
    max_samples: usize,
    pub frozen: bool,
    pub score: Option<u8>,
}

impl MetricsWindow {
    pub fn new(worker_id: &str, retention: ChronoDuration, max_samples: usize) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            samples: VecDeque::new(),
            retention,
            max_samples: max_samples.max(1),
            frozen: false,
            score: None,
        }
    }

    /// Retention long enough for every trigger in `triggers`
    pub fn retention_for(triggers: &[TriggerCondition]) -> ChronoDuration {
        triggers
            .iter()
            .map(|t| t.lookback())
            .max()
            .unwrap_or_else(ChronoDuration::zero)
            .max(ChronoDuration::hours(24))
    }

    pub fn push(&mut self, sample: HealthSample, score: Option<u8>) {
        if sample.healthy {
            self.frozen = false;
        }
        if score.is_some() {
            self.score = score;
        }
        let cutoff = sample.timestamp - self.retention;
        self.samples.push_back(sample);
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
        while self
            .samples
            .front()
            .map(|s| s.timestamp < cutoff)
            .unwrap_or(false)
        {
            self.samples.pop_front();
        }
    }

    pub fn mark_frozen(&mut self) {
        self.frozen = true;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &HealthSample> {
        self.samples.iter()
    }

    fn latest_pnl(&self) -> Option<Decimal> {
        self.samples
            .iter()
            .rev()
            .find_map(|s| s.trading.as_ref().map(|t| t.daily_pnl_usd))
    }

    /// Percent below peak equity, from the newest equity report
    fn drawdown_pct(&self) -> Option<Decimal> {
        let mut equities = self
            .samples
            .iter()
            .filter_map(|s| s.trading.as_ref().and_then(|t| t.equity_usd));
        let first = equities.next()?;
        let (peak, latest) = equities.fold((first, first), |(peak, _), e| (peak.max(e), e));
        if peak <= Decimal::ZERO {
            return None;
        }
        Some((peak - latest) / peak * Decimal::from(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ProbeReport, TradingMetrics};
    use rust_decimal_macros::dec;

    fn window() -> MetricsWindow {
        MetricsWindow::new("trader", ChronoDuration::hours(24), 1_000)
    }

    fn fail_at(ts: DateTime<Utc>) -> HealthSample {
        HealthSample::failure("trader", 10, "refused").at(ts)
    }

    fn ok_at(ts: DateTime<Utc>) -> HealthSample {
        HealthSample::success("trader", 10, ProbeReport::default()).at(ts)
    }

    #[test]
    fn test_consecutive_failures_within_window() {
        let trigger = default_triggers().remove(0);
        let now = Utc::now();
        let mut w = window();

        for i in 0..4 {
            w.push(fail_at(now - ChronoDuration::minutes(4 - i)), None);
        }
        assert!(trigger.evaluate(&w, now).is_none());

        w.push(fail_at(now), None);
        let breach = trigger.evaluate(&w, now).unwrap();
        assert_eq!(breach.action, TriggerAction::StopAll);
        assert_eq!(breach.worker_id, "trader");
    }

    #[test]
    fn test_consecutive_failures_broken_by_success_or_age() {
        let trigger = default_triggers().remove(0);
        let now = Utc::now();

        let mut w = window();
        for i in 0..3 {
            w.push(fail_at(now - ChronoDuration::minutes(10 - i)), None);
        }
        w.push(ok_at(now - ChronoDuration::minutes(5)), None);
        for i in 0..3 {
            w.push(fail_at(now - ChronoDuration::minutes(3 - i)), None);
        }
        assert!(trigger.evaluate(&w, now).is_none());

        // Five failures, but three of them older than 30 minutes
        let mut old = window();
        for m in [50, 40, 35, 10, 5] {
            old.push(fail_at(now - ChronoDuration::minutes(m)), None);
        }
        assert!(trigger.evaluate(&old, now).is_none());
    }

    #[test]
    fn test_daily_loss_and_drawdown() {
        let loss = TriggerCondition::new(
            "daily-loss",
            TriggerKind::DailyLoss {
                limit_usd: dec!(100),
            },
            TriggerAction::StopAll,
        );
        let drawdown = TriggerCondition::new(
            "drawdown",
            TriggerKind::EquityDrawdown {
                max_drawdown_pct: dec!(10),
            },
            TriggerAction::PauseWorker,
        );
        let now = Utc::now();
        let mut w = window();

        for (pnl, equity) in [(dec!(-20), dec!(1000)), (dec!(-60), dec!(1050)), (dec!(-99), dec!(950))] {
            w.push(
                ok_at(now).with_trading(TradingMetrics {
                    daily_pnl_usd: pnl,
                    equity_usd: Some(equity),
                    open_positions: 1,
                }),
                None,
            );
        }
        assert!(loss.evaluate(&w, now).is_none());
        assert!(drawdown.evaluate(&w, now).is_none());

        w.push(
            ok_at(now).with_trading(TradingMetrics {
                daily_pnl_usd: dec!(-100),
                equity_usd: Some(dec!(900)),
                open_positions: 1,
            }),
            None,
        );
        assert!(loss.evaluate(&w, now).is_some());
        let breach = drawdown.evaluate(&w, now).unwrap();
        assert_eq!(breach.action, TriggerAction::PauseWorker);
    }

    #[test]
    fn test_frozen_and_low_score() {
        let frozen = default_triggers().remove(1);
        let low = TriggerCondition::new(
            "low-score",
            TriggerKind::LowHealthScore {
                min_score: 40,
                min_samples: 2,
            },
            TriggerAction::PauseWorker,
        );
        let now = Utc::now();
        let mut w = window();
        w.push(fail_at(now), Some(30));
        assert!(low.evaluate(&w, now).is_none());
        w.push(fail_at(now), Some(20));
        assert!(low.evaluate(&w, now).is_some());

        assert!(frozen.evaluate(&w, now).is_none());
        w.mark_frozen();
        assert!(frozen.evaluate(&w, now).is_some());
        w.push(ok_at(now), Some(60));
        assert!(frozen.evaluate(&w, now).is_none());
    }

    #[test]
    fn test_disabled_trigger_never_fires() {
        let mut trigger = default_triggers().remove(1);
        trigger.enabled = false;
        let mut w = window();
        w.mark_frozen();
        assert!(trigger.evaluate(&w, Utc::now()).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let bad = TriggerCondition::new(
            "bad",
            TriggerKind::EquityDrawdown {
                max_drawdown_pct: dec!(150),
            },
            TriggerAction::StopAll,
        );
        assert!(bad.validate().is_err());
        assert!(default_triggers().iter().all(|t| t.validate().is_ok()));
    }
}
