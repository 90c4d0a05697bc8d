//! Waiting for a submitted prompt to finish.
//!
//! [`wait_for_completion`] reads frames from a ComfyUI WebSocket until the
//! engine signals that the given prompt has finished executing, bounded by
//! an idle timeout per frame and an overall execution ceiling.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::messages::{parse_message, ComfyUIMessage};

/// Time limits applied while waiting for a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitLimits {
    /// Longest silence tolerated between two frames.
    pub idle_timeout: Duration,
    /// Ceiling on the whole wait, however chatty the socket is.
    pub overall_timeout: Duration,
}

impl Default for WaitLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            overall_timeout: Duration::from_secs(300),
        }
    }
}

/// Why a prompt did not reach completion.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("Timeout during workflow execution")]
    ExecutionTimeout { elapsed: Duration },

    #[error("Timeout waiting for WebSocket results")]
    SocketTimeout { idle: Duration },

    #[error("Execution error in node {node_id} ({exception_type}): {exception_message}")]
    ExecutionFailed {
        node_id: String,
        exception_type: String,
        exception_message: String,
    },

    #[error("execution interrupted")]
    Interrupted,

    #[error("connection closed before execution finished")]
    Closed,

    #[error("receive failed: {0}")]
    Socket(#[from] tungstenite::Error),
}

/// Read frames until the completion sentinel for `prompt_id` arrives.
///
/// Returns the time spent waiting. Frames for other prompts, binary
/// preview frames and unparseable frames are skipped.
pub async fn wait_for_completion<S>(
    stream: &mut S,
    prompt_id: &str,
    limits: &WaitLimits,
) -> Result<Duration, WaitError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let start = Instant::now();
    let deadline = start + limits.overall_timeout;
    let mut last_frame = start;

    loop {
        if Instant::now() >= deadline {
            return Err(WaitError::ExecutionTimeout {
                elapsed: start.elapsed(),
            });
        }

        // A silent socket is a socket timeout, even when the ceiling expires
        // at the same instant.
        let idle_deadline = last_frame + limits.idle_timeout;
        let frame = match tokio::time::timeout_at(idle_deadline.min(deadline), stream.next()).await {
            Ok(frame) => {
                last_frame = Instant::now();
                frame
            }
            Err(_) if idle_deadline <= deadline => {
                return Err(WaitError::SocketTimeout {
                    idle: limits.idle_timeout,
                });
            }
            Err(_) => {
                return Err(WaitError::ExecutionTimeout {
                    elapsed: start.elapsed(),
                });
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if handle_text(&text, prompt_id)? {
                    let elapsed = start.elapsed();
                    tracing::info!(
                        prompt_id,
                        elapsed_secs = elapsed.as_secs_f64(),
                        "Execution completed",
                    );
                    return Ok(elapsed);
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!(prompt_id, "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::warn!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return Err(WaitError::Closed);
            }
            Some(Ok(_)) => {
                // Ping / Pong / raw frames; tungstenite answers pings itself.
            }
            Some(Err(e)) => {
                tracing::error!(prompt_id, error = %e, "WebSocket receive error");
                return Err(WaitError::Socket(e));
            }
            None => return Err(WaitError::Closed),
        }
    }
}

/// Interpret one text frame. Returns `Ok(true)` on the completion sentinel.
fn handle_text(text: &str, prompt_id: &str) -> Result<bool, WaitError> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
            return Ok(false);
        }
    };

    if msg.is_completion_of(prompt_id) {
        return Ok(true);
    }
    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        return Ok(false);
    }

    match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::ExecutionStart(_) => {
            tracing::info!(prompt_id, "Execution started");
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::Executing(data) => {
            tracing::debug!(prompt_id, node = ?data.node, "Executing node");
        }
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(prompt_id, percent = data.percent(), node = ?data.node, "Generation progress");
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id, node = %data.node, "Node executed with output");
        }
        ComfyUIMessage::ExecutionSuccess(_) => {
            tracing::debug!(prompt_id, "Engine reported execution success");
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id,
                node_id = %data.node_id,
                node_type = ?data.node_type,
                exception_type = %data.exception_type,
                "Execution error: {}",
                data.exception_message,
            );
            return Err(WaitError::ExecutionFailed {
                node_id: data.node_id,
                exception_type: data.exception_type,
                exception_message: data.exception_message,
            });
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::warn!(prompt_id, node_id = ?data.node_id, "Execution interrupted");
            return Err(WaitError::Interrupted);
        }
    }

    Ok(false)
}
