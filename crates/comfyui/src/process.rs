//! ComfyUI engine process bootstrap.
//!
//! [`EngineSupervisor`] owns the single engine child process of a worker.
//! [`EngineSupervisor::ensure_running`] launches `main.py` on first use and
//! polls the readiness endpoint until the engine answers or the startup
//! timeout elapses. Child stdout/stderr are drained continuously into a
//! bounded tail so the pipes never fill, and the tail is attached to
//! startup errors for diagnosis.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::api::ComfyUIApi;

/// Locations tried when `main.py` is not under the configured directory.
pub const FALLBACK_ENTRY_POINTS: [&str; 3] = [
    "/root/ComfyUI/main.py",
    "/ComfyUI/main.py",
    "./ComfyUI/main.py",
];

/// Environment that stops the engine fetching models at startup.
const LAUNCH_ENV: [(&str, &str); 2] = [
    ("COMFYUI_NO_DOWNLOAD", "1"),
    ("COMFYUI_SKIP_AUTODOWNLOAD", "1"),
];

/// Output lines kept per process for error reports.
const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for a killed child and its pipe readers.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// How to launch the engine and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLaunchConfig {
    /// Interpreter used to run `main.py`.
    pub python: String,
    /// ComfyUI installation directory containing `main.py`.
    pub comfyui_dir: PathBuf,
    /// Port passed to `--port`.
    pub port: u16,
    pub startup_timeout: Duration,
    /// Delay between readiness probes.
    pub poll_interval: Duration,
}

impl EngineLaunchConfig {
    /// Locate `main.py`, preferring the configured directory.
    pub fn resolve_entry_point(&self) -> Result<PathBuf, EngineStartError> {
        let primary = self.comfyui_dir.join("main.py");
        if primary.exists() {
            return Ok(primary);
        }
        tracing::warn!(path = %primary.display(), "ComfyUI main.py not found, trying fallbacks");

        let mut searched = vec![primary];
        for candidate in FALLBACK_ENTRY_POINTS.iter().map(PathBuf::from) {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Found ComfyUI main.py");
                return Ok(candidate);
            }
            searched.push(candidate);
        }
        Err(EngineStartError::EntryPointNotFound { searched })
    }

    fn command(&self, entry_point: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg(entry_point)
            .args(["--listen", "--port", &self.port.to_string(), "--cpu"])
            .envs(LAUNCH_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Why the engine could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum EngineStartError {
    #[error("ComfyUI main.py not found (searched {})", display_paths(.searched))]
    EntryPointNotFound { searched: Vec<PathBuf> },

    #[error("failed to spawn ComfyUI: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ComfyUI process terminated with code {} during startup", display_code(.code))]
    Exited { code: Option<i32>, output: String },

    #[error("Timeout starting ComfyUI after {} seconds", .timeout.as_secs())]
    Timeout { timeout: Duration, output: String },

    #[error("failed to poll ComfyUI process: {0}")]
    Wait(#[source] std::io::Error),
}

impl EngineStartError {
    /// Captured engine stdout/stderr, when the process got far enough to
    /// produce any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Exited { output, .. } | Self::Timeout { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "<signal>".to_string(), |c| c.to_string())
}

/// Bounded, shared tail of a child's interleaved stdout/stderr.
#[derive(Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// Drain `stream` line by line until EOF, logging each line.
    fn spawn_reader<R>(&self, stream: R, name: &'static str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = self.clone();
        tokio::spawn(async move {
            let mut segments = BufReader::new(stream).split(b'\n');
            while let Ok(Some(segment)) = segments.next_segment().await {
                let line = String::from_utf8_lossy(&segment).trim_end().to_string();
                tracing::debug!(target: "comfyui_engine", stream = name, "{line}");
                tail.push(line);
            }
        })
    }
}

/// A launched engine child plus its output capture.
struct EngineProcess {
    child: Child,
    output: OutputTail,
    readers: Vec<JoinHandle<()>>,
}

impl EngineProcess {
    fn spawn(config: &EngineLaunchConfig, entry_point: &Path) -> Result<Self, EngineStartError> {
        let mut child = config.command(entry_point).spawn().map_err(EngineStartError::Spawn)?;
        tracing::info!(
            pid = ?child.id(),
            entry_point = %entry_point.display(),
            port = config.port,
            "Starting ComfyUI",
        );

        let output = OutputTail::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(output.spawn_reader(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(output.spawn_reader(stderr, "stderr"));
        }

        Ok(Self {
            child,
            output,
            readers,
        })
    }

    fn exit_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Let the pipe readers reach EOF, then return the captured tail.
    async fn collect_output(&mut self) -> String {
        for reader in self.readers.drain(..) {
            let _ = tokio::time::timeout(REAP_TIMEOUT, reader).await;
        }
        self.output.snapshot()
    }

    /// Kill the child and return whatever it printed.
    async fn terminate(&mut self) -> String {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill ComfyUI process");
        }
        let _ = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await;
        self.collect_output().await
    }
}

/// Owner of the worker's single engine process.
///
/// Constructed once per worker and passed by `&mut` to whatever needs the
/// engine; exclusive borrows stand in for a lock. Dropping the supervisor
/// kills the engine.
pub struct EngineSupervisor {
    config: EngineLaunchConfig,
    api: ComfyUIApi,
    process: Option<EngineProcess>,
}

impl EngineSupervisor {
    pub fn new(config: EngineLaunchConfig, api: ComfyUIApi) -> Self {
        Self {
            config,
            api,
            process: None,
        }
    }

    /// Whether a process handle is held, alive or not.
    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Whether the held engine process exists and has not exited.
    pub fn is_running(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.exit_status(), Ok(None)),
            None => false,
        }
    }

    /// Make sure the engine has been launched and answered a readiness probe.
    ///
    /// Returns immediately when a process is already held. Otherwise spawns
    /// the engine and polls `GET /system_stats` until it succeeds, the child
    /// exits, or the startup timeout elapses. On failure no handle is kept,
    /// so the next call starts from scratch.
    pub async fn ensure_running(&mut self) -> Result<(), EngineStartError> {
        if self.process.is_some() {
            return Ok(());
        }

        let entry_point = self.config.resolve_entry_point()?;
        let mut process = EngineProcess::spawn(&self.config, &entry_point)?;

        wait_until_ready(&self.api, &mut process, &self.config).await?;
        self.process = Some(process);
        Ok(())
    }
}

async fn wait_until_ready(
    api: &ComfyUIApi,
    process: &mut EngineProcess,
    config: &EngineLaunchConfig,
) -> Result<(), EngineStartError> {
    let start = Instant::now();
    let deadline = start + config.startup_timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if api.is_ready().await {
            tracing::info!(
                attempts,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "ComfyUI started and ready",
            );
            return Ok(());
        }

        if let Some(status) = process.exit_status().map_err(EngineStartError::Wait)? {
            let output = process.collect_output().await;
            tracing::error!(code = ?status.code(), output = %output, "ComfyUI process terminated during startup");
            return Err(EngineStartError::Exited {
                code: status.code(),
                output,
            });
        }

        if Instant::now() >= deadline {
            break;
        }
        if attempts % 5 == 0 {
            tracing::debug!(attempts, "Waiting for ComfyUI to accept requests");
        }
        tokio::time::sleep(config.poll_interval).await;
    }

    let output = process.terminate().await;
    tracing::error!(
        timeout_secs = config.startup_timeout.as_secs(),
        output = %output,
        "Timeout starting ComfyUI",
    );
    Err(EngineStartError::Timeout {
        timeout: config.startup_timeout,
        output,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// A fake ComfyUI install whose `main.py` is a shell script.
    fn engine_dir(script: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), script).unwrap();
        dir
    }

    fn supervisor(dir: &Path, port: u16, startup_timeout: Duration) -> EngineSupervisor {
        let config = EngineLaunchConfig {
            python: "sh".into(),
            comfyui_dir: dir.to_path_buf(),
            port,
            startup_timeout,
            poll_interval: Duration::from_millis(50),
        };
        EngineSupervisor::new(config, ComfyUIApi::for_host(&format!("127.0.0.1:{port}")))
    }

    async fn serve_system_stats() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route(
            "/system_stats",
            axum::routing::get(|| async { axum::Json(serde_json::json!({"system": {"os": "posix"}})) }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        port
    }

    #[test]
    fn tail_keeps_most_recent_lines() {
        let tail = OutputTail::default();
        for i in 0..OUTPUT_TAIL_LINES + 5 {
            tail.push(format!("line {i}"));
        }
        let snapshot = tail.snapshot();
        assert!(snapshot.starts_with("line 5\n"));
        assert!(snapshot.ends_with(&format!("line {}", OUTPUT_TAIL_LINES + 4)));
    }

    #[test]
    fn missing_entry_point_lists_searched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineLaunchConfig {
            python: "python".into(),
            comfyui_dir: dir.path().to_path_buf(),
            port: 8188,
            startup_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        };
        let err = config.resolve_entry_point().unwrap_err();
        assert_matches!(err, EngineStartError::EntryPointNotFound { ref searched } if searched.len() == 4);
        assert!(err.to_string().contains("main.py"));
    }

    #[tokio::test]
    async fn crashed_engine_reports_exit_code_and_output() {
        let dir = engine_dir("echo \"args: $@\"\necho \"nodl=$COMFYUI_NO_DOWNLOAD\"\necho 'model load failed' >&2\nexit 3\n");
        let port = free_port();
        let mut engine = supervisor(dir.path(), port, Duration::from_secs(10));

        let err = engine.ensure_running().await.unwrap_err();
        assert_matches!(err, EngineStartError::Exited { code: Some(3), .. });

        let output = err.output().unwrap();
        assert!(output.contains("model load failed"));
        assert!(output.contains(&format!("--listen --port {port} --cpu")));
        assert!(output.contains("nodl=1"));
        assert!(!engine.has_process());
    }

    #[tokio::test]
    async fn unresponsive_engine_times_out_and_is_killed() {
        let dir = engine_dir("echo booting\nexec sleep 30\n");
        let mut engine = supervisor(dir.path(), free_port(), Duration::from_millis(300));

        let err = engine.ensure_running().await.unwrap_err();
        assert_matches!(err, EngineStartError::Timeout { .. });
        assert!(err.output().unwrap().contains("booting"));
        assert!(!engine.has_process());
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn ready_engine_is_kept_and_reused() {
        let port = serve_system_stats().await;
        let dir = engine_dir("exec sleep 30\n");
        let mut engine = supervisor(dir.path(), port, Duration::from_secs(10));

        engine.ensure_running().await.unwrap();
        assert!(engine.has_process());
        assert!(engine.is_running());

        // A held handle short-circuits without spawning again.
        std::fs::remove_file(dir.path().join("main.py")).unwrap();
        engine.ensure_running().await.unwrap();
        assert!(engine.is_running());
    }
}
