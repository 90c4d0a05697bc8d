//! Health check job.

use faceswap_comfyui::api::ComfyUIApi;
use faceswap_comfyui::process::EngineSupervisor;
use faceswap_core::result::{HealthDetails, HealthReport};

use crate::config::WorkerConfig;

/// Probe the engine and the filesystem.
///
/// Never starts the engine; the only side effect is reaping a child that
/// has already exited.
pub async fn check(
    engine: &mut EngineSupervisor,
    api: &ComfyUIApi,
    config: &WorkerConfig,
) -> HealthReport {
    let details = HealthDetails {
        comfyui_running: engine.is_running(),
        comfyui_api_accessible: api.is_ready().await,
        workflow_exists: config.workflow_path.exists(),
        network_storage_accessible: config.network_storage_path.exists(),
    };
    let report = HealthReport::from(details);
    tracing::info!(status = ?report.status, details = ?report.details, "Health check");
    report
}
