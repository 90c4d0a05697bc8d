//! JSON payloads returned to the job queue.

use serde::{Deserialize, Serialize};

/// Result of one face-swap job.
///
/// Serializes with a `status` tag of `"success"` or `"error"`, matching
/// what queue clients already parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResult {
    Success {
        prompt_id: String,
        /// Base64-encoded image bytes, in history order.
        output_images: Vec<String>,
        message: String,
    },
    Error {
        error: ErrorMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
    },
}

/// The `error` field: one message, or a list for validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorMessage {
    Text(String),
    List(Vec<String>),
}

impl JobResult {
    /// Successful result for images read from `node_id`.
    pub fn success(prompt_id: impl Into<String>, output_images: Vec<String>, node_id: &str) -> Self {
        let message = format!("{} image(s) generated by node {node_id}.", output_images.len());
        Self::Success {
            prompt_id: prompt_id.into(),
            output_images,
            message,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorMessage::Text(error.into()),
            details: None,
            traceback: None,
        }
    }

    pub fn error_list(errors: Vec<String>) -> Self {
        Self::Error {
            error: ErrorMessage::List(errors),
            details: None,
            traceback: None,
        }
    }

    /// Attach a `details` string to an error result. No-op on success.
    pub fn with_details(mut self, text: impl Into<String>) -> Self {
        if let Self::Error { details, .. } = &mut self {
            *details = Some(text.into());
        }
        self
    }

    /// Attach a `traceback` string to an error result. No-op on success.
    pub fn with_traceback(mut self, text: impl Into<String>) -> Self {
        if let Self::Error { traceback, .. } = &mut self {
            *traceback = Some(text.into());
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// The four diagnostic flags of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDetails {
    /// The engine child process exists and has not exited.
    pub comfyui_running: bool,
    /// `GET /system_stats` answered successfully.
    pub comfyui_api_accessible: bool,
    pub workflow_exists: bool,
    pub network_storage_accessible: bool,
}

impl HealthDetails {
    /// Network storage is informational only and does not affect health.
    pub fn is_healthy(&self) -> bool {
        self.comfyui_running && self.comfyui_api_accessible && self.workflow_exists
    }
}

/// Health check payload: `{"status": ..., "details": {...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: HealthDetails,
}

impl From<HealthDetails> for HealthReport {
    fn from(details: HealthDetails) -> Self {
        let status = if details.is_healthy() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Self { status, details }
    }
}

/// Anything the worker hands back for a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobOutput {
    Health(HealthReport),
    Result(JobResult),
}

impl From<HealthReport> for JobOutput {
    fn from(report: HealthReport) -> Self {
        Self::Health(report)
    }
}

impl From<JobResult> for JobOutput {
    fn from(result: JobResult) -> Self {
        Self::Result(result)
    }
}
