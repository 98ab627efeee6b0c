use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::warn;
use uuid::Uuid;

/// Retry policy for job triggers: per-attempt timeout, hard cap on attempts,
/// fixed delay between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub timeout: Duration,
    pub attempts: usize,
    pub delay: Duration,
}

/// Outbound surface of the companion automation node.
pub trait AutomationClient {
    fn trigger_job(
        &self,
        job_id: Uuid,
        payload: &Value,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone, Debug)]
pub struct HttpAutomationClient {
    http: reqwest::Client,
    base_url: String,
    access_key: String,
    secret: String,
    retry: RetryConfig,
}

struct TriggerFailure {
    retriable: bool,
    source: anyhow::Error,
}

// Every non-2xx status is retriable except client errors, with 408 and 429
// added back as retriable.
fn retriable_status(status: StatusCode) -> bool {
    if status.is_client_error() {
        return status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS;
    }
    !status.is_success()
}

impl HttpAutomationClient {
    pub fn new(
        base_url: String,
        access_key: String,
        secret: String,
        retry: RetryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(retry.timeout)
            .build()
            .context("Failed to build HTTP client for the automation node")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_key,
            secret,
            retry,
        })
    }

    async fn post_trigger(&self, job_id: Uuid, payload: &Value) -> Result<(), TriggerFailure> {
        let url = format!("{}/v2/jobs/{}/runs", self.base_url, job_id);

        let response = self
            .http
            .post(&url)
            .header("X-Automation-Access-Key", &self.access_key)
            .header("X-Automation-Secret", &self.secret)
            .json(payload)
            .send()
            .await
            .map_err(|err| TriggerFailure {
                retriable: true,
                source: anyhow::Error::new(err).context("Failed to reach the automation node"),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(TriggerFailure {
            retriable: retriable_status(status),
            source: anyhow!("automation node returned {status}"),
        })
    }
}

impl AutomationClient for HttpAutomationClient {
    async fn trigger_job(&self, job_id: Uuid, payload: &Value) -> Result<()> {
        let strategy = FixedInterval::new(self.retry.delay).take(self.retry.attempts.saturating_sub(1));

        RetryIf::spawn(
            strategy,
            || self.post_trigger(job_id, payload),
            |failure: &TriggerFailure| {
                if failure.retriable {
                    warn!(%job_id, err = %failure.source, "retrying job trigger");
                }
                failure.retriable
            },
        )
        .await
        .map_err(|failure| failure.source)
    }
}
