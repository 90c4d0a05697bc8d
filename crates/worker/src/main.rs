use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use faceswap_worker::config::WorkerConfig;
use faceswap_worker::handler::Handler;
use faceswap_worker::queue::{self, BackoffConfig, QueueClient};
use faceswap_worker::{local, panic_trace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    // `LOG_FORMAT=json` switches to one JSON object per line for log shippers.
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "faceswap_worker=info,faceswap_comfyui=info,faceswap_core=info".into()
            }),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
    panic_trace::install();

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        workflow = %config.workflow_path.display(),
        comfyui_host = %config.comfyui_host,
        output_node = %config.output_node_id,
        "Loaded worker configuration",
    );

    let queue_config = config.queue.clone();
    let test_input_path = config.test_input_path.clone();
    let mut handler = Handler::new(config);

    match queue_config {
        Some(queue_config) => {
            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                signal_cancel.cancel();
            });

            let client = QueueClient::new(queue_config);
            queue::run(&mut handler, &client, &BackoffConfig::default(), &cancel).await;
        }
        None => {
            tracing::info!(path = %test_input_path.display(), "No queue configured, running local test");
            let output = local::run_once(&mut handler, &test_input_path).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), finishing current job");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, finishing current job");
        }
    }
}
