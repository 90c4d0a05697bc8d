//! Workflow graph loading and image-input patching.
//!
//! A ComfyUI workflow in API format is a JSON object keyed by node id, each
//! node carrying a `class_type` and an `inputs` map. The face-swap graph has
//! two image loader nodes; [`patch_image_inputs`] points them at the job's
//! images before the graph is submitted.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::types::{ImagePair, ImageSlot};

/// Node class that loads an image from disk.
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// Node receiving image 1 when the graph has no recognised loader nodes.
pub const FALLBACK_IMAGE1_NODE: &str = "240";

/// Node receiving image 2 when the graph has no recognised loader nodes.
pub const FALLBACK_IMAGE2_NODE: &str = "431";

/// What to do when the graph contains exactly one loader node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SingleLoaderPolicy {
    /// Patch image 1 only and submit with image 2 unset.
    #[default]
    LeaveUnset,
    /// Patch image 2 into the fallback image 2 node, if the graph has it.
    UseFallback,
    /// Refuse to submit the graph.
    Reject,
}

impl FromStr for SingleLoaderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "leave_unset" => Ok(Self::LeaveUnset),
            "use_fallback" => Ok(Self::UseFallback),
            "reject" => Ok(Self::Reject),
            other => Err(format!(
                "unknown single loader policy '{other}' (expected leave_unset, use_fallback or reject)"
            )),
        }
    }
}

/// Which nodes [`patch_image_inputs`] targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// `class_type` identifying image loader nodes.
    pub loader_class: String,
    /// Node ids used for image 1 and image 2 when no loader is found.
    pub fallback_nodes: [String; 2],
    pub single_loader: SingleLoaderPolicy,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            loader_class: LOAD_IMAGE_CLASS.to_string(),
            fallback_nodes: [
                FALLBACK_IMAGE1_NODE.to_string(),
                FALLBACK_IMAGE2_NODE.to_string(),
            ],
            single_loader: SingleLoaderPolicy::default(),
        }
    }
}

impl PatchOptions {
    fn fallback(&self, slot: ImageSlot) -> &str {
        match slot {
            ImageSlot::First => &self.fallback_nodes[0],
            ImageSlot::Second => &self.fallback_nodes[1],
        }
    }
}

/// How the patched nodes were located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// Nodes matched by `class_type`.
    ClassType,
    /// Hardcoded fallback node ids.
    FallbackIds,
}

/// Outcome of [`patch_image_inputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub strategy: PatchStrategy,
    /// Node now holding image 1, if any.
    pub image1_node: Option<String>,
    /// Node now holding image 2, if any.
    pub image2_node: Option<String>,
}

impl PatchReport {
    /// Whether both images found a node.
    pub fn is_complete(&self) -> bool {
        self.image1_node.is_some() && self.image2_node.is_some()
    }

    fn record(&mut self, slot: ImageSlot, node_id: &str) {
        let target = match slot {
            ImageSlot::First => &mut self.image1_node,
            ImageSlot::Second => &mut self.image2_node,
        };
        *target = Some(node_id.to_string());
    }
}

/// Errors from loading or patching a workflow graph.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("workflow graph must be a JSON object keyed by node id")]
    NotAnObject,

    #[error("node {node_id} has no inputs object")]
    MissingInputs { node_id: String },

    #[error("graph has a single {class} node ({node_id}); no node left for image 2")]
    SingleLoader { class: String, node_id: String },
}

/// Read and parse a workflow graph file.
pub fn load_workflow(path: &Path) -> Result<Value, WorkflowError> {
    let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let graph: Value = serde_json::from_str(&text).map_err(|source| WorkflowError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if !graph.is_object() {
        return Err(WorkflowError::NotAnObject);
    }
    Ok(graph)
}

/// Overwrite the `image` input of the graph's two image loader nodes.
///
/// Loader nodes are matched by `class_type` in graph order: the first
/// receives image 1 and the second image 2; any further loaders are left
/// alone. When no loader matches, the fallback node ids are used instead,
/// each only if present. The rest of the graph is not touched.
pub fn patch_image_inputs(
    graph: &mut Value,
    images: &ImagePair,
    options: &PatchOptions,
) -> Result<PatchReport, WorkflowError> {
    let nodes = graph.as_object_mut().ok_or(WorkflowError::NotAnObject)?;

    let loaders: Vec<String> = nodes
        .iter()
        .filter(|(_, node)| {
            node.get("class_type").and_then(Value::as_str) == Some(options.loader_class.as_str())
        })
        .map(|(id, _)| id.clone())
        .take(2)
        .collect();

    tracing::debug!(node_count = nodes.len(), loaders = ?loaders, "Scanned workflow for image loaders");

    let mut report = PatchReport {
        strategy: PatchStrategy::ClassType,
        image1_node: None,
        image2_node: None,
    };

    match loaders.as_slice() {
        [] => {
            report.strategy = PatchStrategy::FallbackIds;
            for slot in ImageSlot::ALL {
                let node_id = options.fallback(slot);
                if nodes.contains_key(node_id) {
                    tracing::info!(node_id, %slot, "Using fallback node");
                    set_image(nodes, node_id, images.get(slot))?;
                    report.record(slot, node_id);
                }
            }
        }
        [only] => {
            if options.single_loader == SingleLoaderPolicy::Reject {
                return Err(WorkflowError::SingleLoader {
                    class: options.loader_class.clone(),
                    node_id: only.clone(),
                });
            }
            set_image(nodes, only, &images.image1)?;
            report.record(ImageSlot::First, only);

            let fallback = options.fallback(ImageSlot::Second);
            if options.single_loader == SingleLoaderPolicy::UseFallback
                && fallback != only.as_str()
                && nodes.contains_key(fallback)
            {
                set_image(nodes, fallback, &images.image2)?;
                report.record(ImageSlot::Second, fallback);
            } else {
                tracing::warn!(node_id = %only, "Only one image loader found, image 2 left unset");
            }
        }
        [first, second, ..] => {
            set_image(nodes, first, &images.image1)?;
            report.record(ImageSlot::First, first);
            set_image(nodes, second, &images.image2)?;
            report.record(ImageSlot::Second, second);
        }
    }

    Ok(report)
}

fn set_image(nodes: &mut Map<String, Value>, node_id: &str, path: &Path) -> Result<(), WorkflowError> {
    let inputs = nodes
        .get_mut(node_id)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or_else(|| WorkflowError::MissingInputs {
            node_id: node_id.to_string(),
        })?;

    let path = path.to_string_lossy().into_owned();
    tracing::info!(node_id, image = %path, "Patching image input");
    inputs.insert("image".to_string(), Value::String(path));
    Ok(())
}
