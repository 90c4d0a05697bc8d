//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON text frames shaped `{"type": "<kind>", "data": {...}}`
//! and binary frames for live previews. Only the text frames are modelled
//! here; [`parse_message`] turns one into a [`ComfyUIMessage`].

use serde::{Deserialize, Deserializer};

/// Accepts `null` but not a missing field.
fn nullable<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Option::<String>::deserialize(deserializer)
}

/// Known ComfyUI WebSocket message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth).
    #[serde(rename = "status")]
    Status(StatusData),

    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node started executing, or the prompt finished when `node` is null.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step progress inside a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Newer engines confirm a finished prompt explicitly.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only the prompt it refers to.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    /// Required; only an explicit `null` marks the end of a prompt.
    #[serde(deserialize_with = "nullable")]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage, 0 when `max` is not positive.
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0) as i16
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    pub exception_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl ComfyUIMessage {
    /// The prompt a message refers to, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => Some(d.prompt_id.as_str()),
            Self::ExecutionCached(d) => Some(d.prompt_id.as_str()),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => Some(d.prompt_id.as_str()),
            Self::ExecutionError(d) => Some(d.prompt_id.as_str()),
            Self::ExecutionInterrupted(d) => Some(d.prompt_id.as_str()),
        }
    }

    /// Whether this is the sentinel that ends execution of `prompt_id`:
    /// an `executing` frame with a null node for that prompt.
    pub fn is_completion_of(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            Self::Executing(ExecutingData { node: None, prompt_id: Some(id) }) if id == prompt_id
        )
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values; callers
/// log those and keep reading.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
