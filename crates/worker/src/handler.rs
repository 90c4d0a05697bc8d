//! Per-job request handling.
//!
//! [`Handler::handle`] takes one raw queue job through validation, engine
//! bootstrap, graph patching, submission, the completion wait and result
//! retrieval. Every failure, panics included, becomes a structured error
//! result; nothing escapes to the caller.

use std::fmt;
use std::panic::AssertUnwindSafe;

use base64::Engine as _;
use futures::FutureExt;
use serde_json::Value;

use faceswap_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use faceswap_comfyui::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use faceswap_comfyui::completion::{wait_for_completion, WaitError};
use faceswap_comfyui::history::{output_images, HistoryError, OutputImage};
use faceswap_comfyui::process::{EngineStartError, EngineSupervisor};
use faceswap_core::result::{JobOutput, JobResult};
use faceswap_core::types::{is_health_check, job_input};
use faceswap_core::validation::{validate_input, ValidationErrors};
use faceswap_core::workflow::{load_workflow, patch_image_inputs, WorkflowError};

use crate::config::WorkerConfig;
use crate::{health, panic_trace};

/// Lifecycle of a face-swap job, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    EngineReady,
    Submitted,
    AwaitingCompletion,
    ResultsFetched,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::EngineReady => "engine_ready",
            Self::Submitted => "submitted",
            Self::AwaitingCompletion => "awaiting_completion",
            Self::ResultsFetched => "results_fetched",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reading results back from the engine.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Content(#[from] HistoryError),
}

/// Why a job failed, by the stage that failed it.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("Failed to start ComfyUI")]
    EngineStart(#[source] EngineStartError),

    #[error("Error loading workflow: {0}")]
    Workflow(#[source] WorkflowError),

    #[error("Error resolving image paths: {0}")]
    ImagePaths(#[source] std::io::Error),

    #[error("HTTP Error {status}: {reason}")]
    SubmitRejected {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("Error sending prompt to ComfyUI: {0}")]
    Submit(#[source] ComfyUIApiError),

    #[error("WebSocket communication error: {0}")]
    Connect(#[source] ComfyUIClientError),

    #[error("{}", wait_message(.0))]
    Wait(#[source] WaitError),

    #[error("Error retrieving history: {0}")]
    History(#[source] RetrievalError),

    #[error("Error retrieving images: {0}")]
    Images(#[source] RetrievalError),
}

fn wait_message(e: &WaitError) -> String {
    match e {
        WaitError::ExecutionTimeout { .. }
        | WaitError::SocketTimeout { .. }
        | WaitError::ExecutionFailed { .. } => e.to_string(),
        other => format!("WebSocket communication error: {other}"),
    }
}

impl JobError {
    /// The last stage the job reached before failing.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Validation(_) => Stage::Received,
            Self::EngineStart(_) => Stage::Validated,
            Self::Workflow(_) | Self::ImagePaths(_) | Self::Connect(_) => Stage::EngineReady,
            Self::SubmitRejected { .. } | Self::Submit(_) => Stage::EngineReady,
            Self::Wait(_) | Self::History(_) | Self::Images(_) => Stage::AwaitingCompletion,
        }
    }

    fn from_submission(e: ComfyUIApiError) -> Self {
        match e {
            ComfyUIApiError::ApiError {
                status,
                reason,
                body,
            } => Self::SubmitRejected {
                status,
                reason,
                body,
            },
            other => Self::Submit(other),
        }
    }
}

impl From<JobError> for JobResult {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Validation(errors) => {
                JobResult::error_list(errors.into_messages()).with_details("Input validation failed")
            }
            JobError::EngineStart(cause) => {
                JobResult::error("Failed to start ComfyUI").with_details(cause.to_string())
            }
            JobError::SubmitRejected {
                status,
                reason,
                body,
            } => JobResult::error(format!("HTTP Error {status}: {reason}")).with_details(body),
            other => JobResult::error(other.to_string()),
        }
    }
}

/// Serves jobs against one local engine.
///
/// Owns the engine supervisor, so jobs and health checks are serialised by
/// `&mut self`.
pub struct Handler {
    config: WorkerConfig,
    api: ComfyUIApi,
    client: ComfyUIClient,
    engine: EngineSupervisor,
}

impl Handler {
    pub fn new(config: WorkerConfig) -> Self {
        let api = ComfyUIApi::for_host(&config.comfyui_host);
        let client = ComfyUIClient::for_host(&config.comfyui_host);
        let engine = EngineSupervisor::new(config.engine.clone(), api.clone());
        Self {
            config,
            api,
            client,
            engine,
        }
    }

    pub fn engine(&self) -> &EngineSupervisor {
        &self.engine
    }

    /// Handle one raw queue job: a health check or a face swap.
    pub async fn handle(&mut self, job: &Value) -> JobOutput {
        let job_id = job.get("id").and_then(Value::as_str).unwrap_or("-").to_string();

        if is_health_check(job) {
            return health::check(&mut self.engine, &self.api, &self.config)
                .await
                .into();
        }

        tracing::info!(job_id = %job_id, stage = %Stage::Received, "Handler called");
        let outcome = AssertUnwindSafe(self.process(job)).catch_unwind().await;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(job_id = %job_id, stage = %e.stage(), error = %e, "Job failed");
                JobResult::from(e)
            }
            Err(payload) => {
                tracing::error!(job_id = %job_id, "Unhandled error in handler");
                panic_trace::panic_result(payload)
            }
        };
        result.into()
    }

    async fn process(&mut self, job: &Value) -> Result<JobResult, JobError> {
        let images = validate_input(&job_input(job))?;
        tracing::info!(stage = %Stage::Validated, "Input validated");

        self.engine
            .ensure_running()
            .await
            .map_err(JobError::EngineStart)?;
        tracing::info!(stage = %Stage::EngineReady, "ComfyUI ready");

        let mut graph = load_workflow(&self.config.workflow_path).map_err(JobError::Workflow)?;
        let images = images.into_absolute().map_err(JobError::ImagePaths)?;
        tracing::info!(
            image1 = %images.image1.display(),
            image2 = %images.image2.display(),
            nodes = ?graph.as_object().map(|nodes| nodes.keys().collect::<Vec<_>>()),
            "Processing faceswap",
        );

        let report =
            patch_image_inputs(&mut graph, &images, &self.config.patch).map_err(JobError::Workflow)?;
        if !report.is_complete() {
            tracing::warn!(
                strategy = ?report.strategy,
                image1_node = ?report.image1_node,
                image2_node = ?report.image2_node,
                "Workflow did not receive both images",
            );
        }

        let mut connection = self.client.connect().await.map_err(JobError::Connect)?;
        let outcome = self.submit_and_wait(&graph, &mut connection).await;
        connection.close().await;
        let prompt_id = outcome?;

        let encoded = self.fetch_outputs(&prompt_id).await?;
        tracing::info!(
            prompt_id = %prompt_id,
            stage = %Stage::ResultsFetched,
            count = encoded.len(),
            node_id = %self.config.output_node_id,
            "Images retrieved",
        );

        let result = JobResult::success(prompt_id, encoded, &self.config.output_node_id);
        tracing::info!(stage = %Stage::Done, "Job complete");
        Ok(result)
    }

    /// Queue the graph under the connection's client id and wait for the
    /// completion sentinel. Returns the prompt id.
    async fn submit_and_wait(
        &self,
        graph: &Value,
        connection: &mut ComfyUIConnection,
    ) -> Result<String, JobError> {
        let submitted = self
            .api
            .submit_workflow(graph, &connection.client_id)
            .await
            .map_err(JobError::from_submission)?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(
            prompt_id = %prompt_id,
            client_id = %connection.client_id,
            queue_number = submitted.number,
            stage = %Stage::Submitted,
            "Prompt sent successfully",
        );
        if submitted.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            tracing::warn!(prompt_id = %prompt_id, node_errors = %submitted.node_errors, "ComfyUI reported node errors");
        }

        tracing::info!(prompt_id = %prompt_id, stage = %Stage::AwaitingCompletion, "Waiting for execution");
        wait_for_completion(&mut connection.ws_stream, &prompt_id, &self.config.wait)
            .await
            .map_err(JobError::Wait)?;
        Ok(prompt_id)
    }

    /// Download and base64-encode the output node's images, in history order.
    async fn fetch_outputs(&self, prompt_id: &str) -> Result<Vec<String>, JobError> {
        let history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(|e| JobError::History(e.into()))?;

        let images = output_images(&history, prompt_id, &self.config.output_node_id).map_err(
            |e| match e {
                HistoryError::MissingPrompt(_) => JobError::History(e.into()),
                other => JobError::Images(other.into()),
            },
        )?;

        let mut encoded = Vec::with_capacity(images.len());
        for image in &images {
            encoded.push(self.fetch_image(image).await?);
        }
        Ok(encoded)
    }

    async fn fetch_image(&self, image: &OutputImage) -> Result<String, JobError> {
        let bytes = self
            .api
            .view_image(image)
            .await
            .map_err(|e| JobError::Images(e.into()))?;
        tracing::debug!(filename = %image.filename, bytes = bytes.len(), "Fetched output image");
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}
