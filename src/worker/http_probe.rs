use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::domain::ProbeReport;
use crate::error::{Result, WardenError};

/// HTTP health check against a worker's `health_url`
///
/// Any 2xx counts as healthy. A JSON body may carry resource and trading
/// metrics; a body that does not parse is treated as an empty report.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn check(&self) -> Result<ProbeReport> {
        let resp = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_connect() {
                WardenError::ConnectionRefused(self.url.clone())
            } else if e.is_timeout() {
                WardenError::Timeout(format!("health probe {}", self.url))
            } else {
                WardenError::Http(e)
            }
        })?;

        let resp = resp.error_for_status()?;
        let body = resp.bytes().await?;
        if body.is_empty() {
            return Ok(ProbeReport::default());
        }

        match serde_json::from_slice::<ProbeReport>(&body) {
            Ok(report) => Ok(report),
            Err(e) => {
                debug!("Health body from {} is not a probe report: {}", self.url, e);
                Ok(ProbeReport::default())
            }
        }
    }
}
