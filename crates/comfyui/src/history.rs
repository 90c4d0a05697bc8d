//! Output extraction from `GET /history/{prompt_id}` responses.
//!
//! A history response is keyed by prompt id; each entry holds an
//! `outputs` map from node id to that node's results, where image
//! producing nodes list `{filename, subfolder, type}` records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One image written by an output node, as addressed by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area the file lives in (`output`, `temp`, `input`).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "output".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("no history entry for prompt {0}")]
    MissingPrompt(String),

    #[error("history entry for prompt {0} has no outputs")]
    MissingOutputs(String),

    #[error("malformed image list for node {node_id}: {source}")]
    InvalidImages {
        node_id: String,
        source: serde_json::Error,
    },
}

/// List the images produced by `node_id` for `prompt_id`.
///
/// A node absent from the outputs, or one without an `images` list,
/// yields an empty list rather than an error.
pub fn output_images(
    history: &Value,
    prompt_id: &str,
    node_id: &str,
) -> Result<Vec<OutputImage>, HistoryError> {
    let entry = history
        .get(prompt_id)
        .ok_or_else(|| HistoryError::MissingPrompt(prompt_id.to_string()))?;
    let outputs = entry
        .get("outputs")
        .and_then(Value::as_object)
        .ok_or_else(|| HistoryError::MissingOutputs(prompt_id.to_string()))?;

    let Some(images) = outputs.get(node_id).and_then(|node| node.get("images")) else {
        tracing::warn!(
            prompt_id,
            node_id,
            available = ?outputs.keys().collect::<Vec<_>>(),
            "Output node has no images",
        );
        return Ok(Vec::new());
    };

    Vec::<OutputImage>::deserialize(images).map_err(|source| HistoryError::InvalidImages {
        node_id: node_id.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn history() -> Value {
        json!({
            "abc": {
                "prompt": [],
                "outputs": {
                    "413": {"images": [
                        {"filename": "ComfyUI_00001_.png", "subfolder": "", "type": "output"},
                        {"filename": "ComfyUI_00002_.png", "subfolder": "swaps", "type": "temp"}
                    ]},
                    "12": {"text": ["ignored"]}
                },
                "status": {"status_str": "success", "completed": true}
            }
        })
    }

    #[test]
    fn lists_images_of_output_node_in_order() {
        let images = output_images(&history(), "abc", "413").unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].filename, "ComfyUI_00001_.png");
        assert_eq!(images[1].subfolder, "swaps");
        assert_eq!(images[1].kind, "temp");
    }

    #[test]
    fn absent_node_or_images_yield_nothing() {
        assert!(output_images(&history(), "abc", "999").unwrap().is_empty());
        assert!(output_images(&history(), "abc", "12").unwrap().is_empty());
    }

    #[test]
    fn missing_prompt_is_an_error() {
        assert_matches!(
            output_images(&json!({}), "abc", "413"),
            Err(HistoryError::MissingPrompt(id)) if id == "abc"
        );
    }

    #[test]
    fn missing_outputs_is_an_error() {
        assert_matches!(
            output_images(&json!({"abc": {"status": {}}}), "abc", "413"),
            Err(HistoryError::MissingOutputs(_))
        );
    }

    #[test]
    fn image_defaults_for_sparse_records() {
        let h = json!({"p": {"outputs": {"413": {"images": [{"filename": "x.png"}]}}}});
        let images = output_images(&h, "p", "413").unwrap();
        assert_eq!(
            images,
            vec![OutputImage {
                filename: "x.png".into(),
                subfolder: String::new(),
                kind: "output".into(),
            }]
        );
    }

    #[test]
    fn malformed_image_list() {
        let h = json!({"p": {"outputs": {"413": {"images": "nope"}}}});
        assert_matches!(
            output_images(&h, "p", "413"),
            Err(HistoryError::InvalidImages { .. })
        );
    }
}
