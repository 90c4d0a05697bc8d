//! Job queue polling loop.
//!
//! [`run`] repeatedly takes a job from the queue's take endpoint, hands it
//! to the [`Handler`], and posts the output back. Transport failures back
//! off exponentially; jobs themselves are never retried. The loop stops
//! between jobs once the [`CancellationToken`] is triggered.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use faceswap_core::result::JobOutput;

use crate::config::QueueConfig;
use crate::handler::Handler;

/// Pause after an empty take before asking again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tunable parameters for the transport-error backoff.
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Next backoff delay, clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("queue returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Serialize)]
struct OutputEnvelope<'a> {
    output: &'a JobOutput,
}

/// HTTP client for the queue's take and result endpoints.
pub struct QueueClient {
    http: reqwest::Client,
    config: QueueConfig,
}

impl QueueClient {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.header(AUTHORIZATION, key),
            None => request,
        }
    }

    /// Take the next job. `Ok(None)` means the queue is idle.
    pub async fn take(&self) -> Result<Option<Value>, QueueError> {
        let response = self
            .authorized(self.http.get(self.config.take_url()))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(QueueError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Post a job's output as `{"output": ...}`.
    pub async fn post_output(&self, job_id: &str, output: &JobOutput) -> Result<(), QueueError> {
        let response = self
            .authorized(self.http.post(self.config.post_url(job_id)))
            .json(&OutputEnvelope { output })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Serve jobs until `cancel` is triggered. Returns the number of jobs handled.
pub async fn run(
    handler: &mut Handler,
    queue: &QueueClient,
    backoff: &BackoffConfig,
    cancel: &CancellationToken,
) -> u64 {
    let mut delay = backoff.initial_delay;
    let mut handled = 0u64;
    tracing::info!(worker_id = %queue.config.worker_id, "Polling job queue");

    while !cancel.is_cancelled() {
        let taken = tokio::select! {
            () = cancel.cancelled() => break,
            taken = queue.take() => taken,
        };

        let outcome = match taken {
            Ok(Some(job)) => {
                handled += 1;
                let Some(job_id) = job.get("id").and_then(Value::as_str) else {
                    tracing::error!(job = %job, "Dropping job without id");
                    delay = backoff.initial_delay;
                    continue;
                };
                serve(handler, queue, job_id, &job).await
            }
            Ok(None) => {
                delay = backoff.initial_delay;
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                }
                continue;
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => delay = backoff.initial_delay,
            Err(e) => {
                tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "Queue transport error, backing off");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, backoff);
            }
        }
    }

    tracing::info!(handled, "Queue loop stopped");
    handled
}

async fn serve(
    handler: &mut Handler,
    queue: &QueueClient,
    job_id: &str,
    job: &Value,
) -> Result<(), QueueError> {
    let output = handler.handle(job).await;
    queue.post_output(job_id, &output).await?;
    tracing::info!(job_id, "Posted job output");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = BackoffConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = BackoffConfig::default();
        assert_eq!(next_delay(Duration::from_secs(20), &config), Duration::from_secs(30));
        assert_eq!(next_delay(Duration::from_secs(30), &config), Duration::from_secs(30));
    }

    #[test]
    fn output_envelope_shape() {
        let output = JobOutput::from(faceswap_core::result::JobResult::error("boom"));
        assert_eq!(
            serde_json::to_value(OutputEnvelope { output: &output }).unwrap(),
            serde_json::json!({"output": {"status": "error", "error": "boom"}})
        );
    }
}
