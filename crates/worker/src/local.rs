//! Local test mode: run one job from a file.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;

use faceswap_core::result::JobOutput;

use crate::handler::Handler;

/// Load the job at `path`, run it through the handler and return its output.
pub async fn run_once(handler: &mut Handler, path: &Path) -> anyhow::Result<JobOutput> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read test input {}", path.display()))?;
    let job: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in test input {}", path.display()))?;
    tracing::info!(path = %path.display(), "Local test input loaded");

    let output = handler.handle(&job).await;
    tracing::info!("Local test handler finished");
    Ok(output)
}
