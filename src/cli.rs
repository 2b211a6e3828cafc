//! Command-line interface
//!
//! `serve` and `validate` run locally; `status`, `kill` and `override` talk
//! to a running instance over the control API.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

use crate::api::auth::ADMIN_TOKEN_HEADER;
use crate::error::{Result, WardenError};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "botwarden")]
#[command(version)]
#[command(about = "Safety-interlocked supervisor for trading bot fleets", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file; defaults to config/default.toml plus WARDEN_ENV overlay
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the supervisor and the control API
    Serve {
        /// Start auto-start workers in dependency order on boot
        #[arg(long)]
        auto_start: bool,
        /// Start them in safe mode
        #[arg(long, requires = "auto_start")]
        safe_mode: bool,
    },
    /// Load and validate configuration, then exit
    Validate,
    /// Show fleet status from a running instance
    Status {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Activate the kill switch on a running instance
    Kill {
        /// Why the fleet is being halted
        reason: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Override an active or locked kill switch
    Override {
        reason: String,
        /// Operator approving the override
        #[arg(long)]
        approved_by: Option<String>,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct RemoteArgs {
    /// Control API base URL
    #[arg(long, env = "WARDEN_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,
    /// Admin token for mutating endpoints
    #[arg(long, env = "WARDEN_API_ADMIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

/// Thin HTTP client for the control API
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ControlClient {
    pub fn new(remote: &RemoteArgs) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: remote.url.trim_end_matches('/').to_string(),
            token: remote.token.clone(),
        })
    }

    pub async fn status(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/status", self.base_url))
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn kill(&self, reason: &str, actor: &str) -> Result<Value> {
        self.post(
            "/kill-switch",
            json!({ "action": "activate", "reason": reason, "actor": actor }),
        )
        .await
    }

    pub async fn override_switch(
        &self,
        reason: &str,
        approved_by: Option<&str>,
        actor: &str,
    ) -> Result<Value> {
        self.post(
            "/kill-switch",
            json!({
                "action": "override",
                "reason": reason,
                "approvedBy": approved_by,
                "actor": actor,
            }),
        )
        .await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let mut request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.header(ADMIN_TOKEN_HEADER, token);
        }
        Self::decode(request.send().await?).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(body);
        }
        let code = body["code"].as_str().unwrap_or("UNKNOWN");
        let message = body["error"].as_str().unwrap_or("no error message");
        Err(WardenError::Validation(format!(
            "{} ({}): {}",
            status.as_u16(),
            code,
            message
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_with_auto_start() {
        let cli = Cli::try_parse_from(["botwarden", "serve", "--auto-start", "--safe-mode"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Serve {
                auto_start: true,
                safe_mode: true
            }
        ));
    }

    #[test]
    fn test_safe_mode_requires_auto_start() {
        assert!(Cli::try_parse_from(["botwarden", "serve", "--safe-mode"]).is_err());
    }

    #[test]
    fn test_parse_override_with_approver_and_config() {
        let cli = Cli::try_parse_from([
            "botwarden",
            "override",
            "postmortem reviewed",
            "--approved-by",
            "alice",
            "--url",
            "http://10.0.0.5:8080/",
            "--config",
            "/etc/botwarden.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/botwarden.toml")));
        match cli.command {
            Commands::Override {
                reason,
                approved_by,
                remote,
                ..
            } => {
                assert_eq!(reason, "postmortem reviewed");
                assert_eq!(approved_by.as_deref(), Some("alice"));
                let client = ControlClient::new(&remote).unwrap();
                assert_eq!(client.base_url, "http://10.0.0.5:8080");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
