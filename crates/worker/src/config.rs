use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use faceswap_comfyui::completion::WaitLimits;
use faceswap_comfyui::process::EngineLaunchConfig;
use faceswap_core::workflow::{PatchOptions, SingleLoaderPolicy};

/// Port assumed when `COMFYUI_HOST` carries no `:port` suffix.
const DEFAULT_COMFYUI_PORT: u16 = 8188;

/// Worker configuration loaded from environment variables.
///
/// Every field has a default matching the stock serverless image; only the
/// queue endpoints are optional, and without them the binary runs in local
/// test mode.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Workflow graph submitted for every job.
    pub workflow_path: PathBuf,
    /// Engine `host:port`, used for both HTTP and WebSocket.
    pub comfyui_host: String,
    pub network_storage_path: PathBuf,
    /// History node whose images are returned.
    pub output_node_id: String,
    pub patch: PatchOptions,
    pub wait: WaitLimits,
    pub engine: EngineLaunchConfig,
    /// Queue endpoints; `None` selects local test mode.
    pub queue: Option<QueueConfig>,
    /// Job file run by local test mode.
    pub test_input_path: PathBuf,
}

/// Job queue endpoints and credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Take URL; `$ID` is replaced by the worker id.
    pub take_url: String,
    /// Result URL; `$ID` is replaced by the job id.
    pub post_url: String,
    pub worker_id: String,
    /// Sent verbatim as the `Authorization` header.
    pub api_key: Option<String>,
}

impl QueueConfig {
    pub fn take_url(&self) -> String {
        self.take_url.replace("$ID", &self.worker_id)
    }

    pub fn post_url(&self, job_id: &str) -> String {
        self.post_url.replace("$ID", job_id)
    }
}

/// A variable was set but could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{present} is set but {missing} is not")]
    IncompleteQueue {
        present: &'static str,
        missing: &'static str,
    },
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                      | Default            |
    /// |------------------------------|--------------------|
    /// | `WORKFLOW_PATH`              | `good.json`        |
    /// | `COMFYUI_HOST`               | `127.0.0.1:8188`   |
    /// | `NETWORK_STORAGE_PATH`       | `/runpod-volume`   |
    /// | `COMFYUI_TIMEOUT`            | `120` (seconds)    |
    /// | `COMFYUI_PATH`               | `/ComfyUI`         |
    /// | `COMFYUI_PYTHON`             | `python`           |
    /// | `EXECUTION_TIMEOUT`          | `300` (seconds)    |
    /// | `SOCKET_TIMEOUT`             | `300` (seconds)    |
    /// | `OUTPUT_NODE_ID`             | `413`              |
    /// | `SINGLE_LOADER_POLICY`       | `leave_unset`      |
    /// | `RUNPOD_WEBHOOK_GET_JOB`     | unset              |
    /// | `RUNPOD_WEBHOOK_POST_OUTPUT` | unset              |
    /// | `RUNPOD_POD_ID`              | random UUID        |
    /// | `RUNPOD_AI_API_KEY`          | unset              |
    /// | `TEST_INPUT_PATH`            | `test_input.json`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let comfyui_host = var("COMFYUI_HOST", "127.0.0.1:8188");
        let port = port_of(&comfyui_host)?;

        let engine = EngineLaunchConfig {
            python: var("COMFYUI_PYTHON", "python"),
            comfyui_dir: var("COMFYUI_PATH", "/ComfyUI").into(),
            port,
            startup_timeout: seconds("COMFYUI_TIMEOUT", lookup("COMFYUI_TIMEOUT"), 120)?,
            poll_interval: Duration::from_secs(1),
        };

        let wait = WaitLimits {
            idle_timeout: seconds("SOCKET_TIMEOUT", lookup("SOCKET_TIMEOUT"), 300)?,
            overall_timeout: seconds("EXECUTION_TIMEOUT", lookup("EXECUTION_TIMEOUT"), 300)?,
        };

        let single_loader = match lookup("SINGLE_LOADER_POLICY") {
            Some(raw) => {
                SingleLoaderPolicy::from_str(&raw).map_err(|reason| ConfigError::Invalid {
                    key: "SINGLE_LOADER_POLICY",
                    value: raw,
                    reason,
                })?
            }
            None => SingleLoaderPolicy::default(),
        };
        let patch = PatchOptions {
            single_loader,
            ..PatchOptions::default()
        };

        let queue = match (lookup("RUNPOD_WEBHOOK_GET_JOB"), lookup("RUNPOD_WEBHOOK_POST_OUTPUT")) {
            (Some(take_url), Some(post_url)) => Some(QueueConfig {
                take_url,
                post_url,
                worker_id: lookup("RUNPOD_POD_ID")
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                api_key: lookup("RUNPOD_AI_API_KEY"),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::IncompleteQueue {
                    present: "RUNPOD_WEBHOOK_GET_JOB",
                    missing: "RUNPOD_WEBHOOK_POST_OUTPUT",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteQueue {
                    present: "RUNPOD_WEBHOOK_POST_OUTPUT",
                    missing: "RUNPOD_WEBHOOK_GET_JOB",
                })
            }
        };

        Ok(Self {
            workflow_path: var("WORKFLOW_PATH", "good.json").into(),
            comfyui_host,
            network_storage_path: var("NETWORK_STORAGE_PATH", "/runpod-volume").into(),
            output_node_id: var("OUTPUT_NODE_ID", "413"),
            patch,
            wait,
            engine,
            queue,
            test_input_path: var("TEST_INPUT_PATH", "test_input.json").into(),
        })
    }
}

fn port_of(host: &str) -> Result<u16, ConfigError> {
    let Some((_, port)) = host.rsplit_once(':') else {
        return Ok(DEFAULT_COMFYUI_PORT);
    };
    port.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key: "COMFYUI_HOST",
        value: host.to_string(),
        reason: e.to_string(),
    })
}

fn seconds(key: &'static str, raw: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".into(),
        }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.workflow_path, PathBuf::from("good.json"));
        assert_eq!(config.comfyui_host, "127.0.0.1:8188");
        assert_eq!(config.network_storage_path, PathBuf::from("/runpod-volume"));
        assert_eq!(config.output_node_id, "413");
        assert_eq!(config.engine.port, 8188);
        assert_eq!(config.engine.python, "python");
        assert_eq!(config.engine.comfyui_dir, PathBuf::from("/ComfyUI"));
        assert_eq!(config.engine.startup_timeout, Duration::from_secs(120));
        assert_eq!(config.wait, WaitLimits::default());
        assert_eq!(config.patch, PatchOptions::default());
        assert!(config.queue.is_none());
        assert_eq!(config.test_input_path, PathBuf::from("test_input.json"));
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("COMFYUI_HOST", "10.0.0.5:9000"),
            ("COMFYUI_TIMEOUT", "30"),
            ("EXECUTION_TIMEOUT", "600"),
            ("SOCKET_TIMEOUT", "45"),
            ("OUTPUT_NODE_ID", "9"),
            ("SINGLE_LOADER_POLICY", "reject"),
        ])
        .unwrap();
        assert_eq!(config.engine.port, 9000);
        assert_eq!(config.engine.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.wait.overall_timeout, Duration::from_secs(600));
        assert_eq!(config.wait.idle_timeout, Duration::from_secs(45));
        assert_eq!(config.output_node_id, "9");
        assert_eq!(config.patch.single_loader, SingleLoaderPolicy::Reject);
    }

    #[test]
    fn host_without_port_uses_default() {
        let config = load(&[("COMFYUI_HOST", "comfy")]).unwrap();
        assert_eq!(config.engine.port, DEFAULT_COMFYUI_PORT);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert_matches!(
            load(&[("COMFYUI_TIMEOUT", "soon")]),
            Err(ConfigError::Invalid { key: "COMFYUI_TIMEOUT", .. })
        );
        assert_matches!(
            load(&[("SOCKET_TIMEOUT", "0")]),
            Err(ConfigError::Invalid { key: "SOCKET_TIMEOUT", .. })
        );
        assert_matches!(
            load(&[("COMFYUI_HOST", "localhost:http")]),
            Err(ConfigError::Invalid { key: "COMFYUI_HOST", .. })
        );
        assert_matches!(
            load(&[("SINGLE_LOADER_POLICY", "guess")]),
            Err(ConfigError::Invalid { key: "SINGLE_LOADER_POLICY", .. })
        );
    }

    #[test]
    fn queue_urls_substitute_ids() {
        let config = load(&[
            ("RUNPOD_WEBHOOK_GET_JOB", "https://queue/job-take/$ID"),
            ("RUNPOD_WEBHOOK_POST_OUTPUT", "https://queue/job-done/$ID"),
            ("RUNPOD_POD_ID", "pod-7"),
            ("RUNPOD_AI_API_KEY", "secret"),
        ])
        .unwrap();
        let queue = config.queue.unwrap();
        assert_eq!(queue.take_url(), "https://queue/job-take/pod-7");
        assert_eq!(queue.post_url("job-1"), "https://queue/job-done/job-1");
        assert_eq!(queue.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn half_configured_queue_is_an_error() {
        assert_matches!(
            load(&[("RUNPOD_WEBHOOK_GET_JOB", "https://queue/take")]),
            Err(ConfigError::IncompleteQueue { missing: "RUNPOD_WEBHOOK_POST_OUTPUT", .. })
        );
    }
}
