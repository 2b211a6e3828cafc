use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource usage reported by a worker probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub memory_mb: f64,
}

/// Money-side metrics a trading worker may expose on its health endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingMetrics {
    #[serde(default)]
    pub daily_pnl_usd: Decimal,
    #[serde(default)]
    pub equity_usd: Option<Decimal>,
    #[serde(default)]
    pub open_positions: u32,
}

/// What a successful health probe returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    #[serde(default)]
    pub resources: ResourceUsage,
    #[serde(default)]
    pub trading: Option<TradingMetrics>,
}

/// One health poll result. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub latency_ms: u64,
    pub resources: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trading: Option<TradingMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthSample {
    pub fn success(worker_id: &str, latency_ms: u64, report: ProbeReport) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            healthy: true,
            latency_ms,
            resources: report.resources,
            trading: report.trading,
            error: None,
        }
    }

    pub fn failure(worker_id: &str, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            timestamp: Utc::now(),
            healthy: false,
            latency_ms,
            resources: ResourceUsage::default(),
            trading: None,
            error: Some(error.into()),
        }
    }

    /// Override the timestamp (replaying recorded samples, tests)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_trading(mut self, trading: TradingMetrics) -> Self {
        self.trading = Some(trading);
        self
    }
}

/// Health classification derived from recent samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthClass {
    /// No samples yet or polling suspended
    #[default]
    Unknown,
    Healthy,
    /// Succeeding but with failures or slow responses in the window
    Degraded,
    /// Consecutive failed polls crossed the threshold
    Unhealthy,
    /// No heartbeat for longer than the freeze threshold
    Frozen,
}

impl HealthClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthClass::Unknown => "UNKNOWN",
            HealthClass::Healthy => "HEALTHY",
            HealthClass::Degraded => "DEGRADED",
            HealthClass::Unhealthy => "UNHEALTHY",
            HealthClass::Frozen => "FROZEN",
        }
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, HealthClass::Unhealthy | HealthClass::Frozen)
    }
}

impl fmt::Display for HealthClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_probe_report_parses_partial_body() {
        let report: ProbeReport =
            serde_json::from_str(r#"{"resources":{"cpuPct":12.5},"trading":{"dailyPnlUsd":"-42.10"}}"#)
                .unwrap();
        assert_eq!(report.resources.cpu_pct, 12.5);
        assert_eq!(report.resources.memory_mb, 0.0);
        let trading = report.trading.unwrap();
        assert_eq!(trading.daily_pnl_usd, dec!(-42.10));
        assert!(trading.equity_usd.is_none());
    }

    #[test]
    fn test_failure_sample() {
        let sample = HealthSample::failure("a", 5000, "timeout");
        assert!(!sample.healthy);
        assert_eq!(sample.error.as_deref(), Some("timeout"));
        assert!(HealthClass::Frozen.is_failing());
        assert!(!HealthClass::Degraded.is_failing());
    }
}
