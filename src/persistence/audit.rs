//! Append-only audit log
//!
//! One JSON object per line. Every kill switch transition and override is
//! recorded here with timestamp, reason and actor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, WardenError};

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Component that produced the entry (e.g. "kill_switch")
    pub component: String,
    /// What happened (e.g. "activated", "override_rejected")
    pub event_type: String,
    pub reason: String,
    /// Operator or "system"
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(component: &str, event_type: &str, reason: &str, actor: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.to_string(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            from: None,
            to: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn transition(mut self, from: &str, to: &str) -> Self {
        self.from = Some(from.to_string());
        self.to = Some(to.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry
    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.storage_err("create audit dir", e))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.storage_err("open audit log", e))?;
        file.write_all(&line)
            .await
            .map_err(|e| self.storage_err("append audit entry", e))?;
        file.flush()
            .await
            .map_err(|e| self.storage_err("flush audit log", e))?;

        debug!(
            "Audit {}/{} by {}: {}",
            entry.component, entry.event_type, entry.actor, entry.reason
        );
        Ok(())
    }

    /// Most recent entries, newest last. Malformed lines are skipped.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let body = match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.storage_err("read audit log", e)),
        };

        let entries: Vec<AuditEntry> = body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    fn storage_err(&self, action: &str, e: std::io::Error) -> WardenError {
        WardenError::Storage(format!("{} {}: {}", action, self.path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_recent() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit/kill_switch.jsonl"));

        for i in 0..5 {
            let entry = AuditEntry::new("kill_switch", "activated", &format!("breach {}", i), "system")
                .transition("ARMED", "ACTIVE");
            log.append(&entry).await.unwrap();
        }

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].reason, "breach 3");
        assert_eq!(recent[1].reason, "breach 4");
        assert_eq!(recent[1].to.as_deref(), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("none.jsonl"));
        assert!(log.recent(10).await.unwrap().is_empty());
    }
}
