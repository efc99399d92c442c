//! Typed ComfyUI workflow graph (API format).
//!
//! The server accepts a workflow as a JSON object mapping node ids to
//! node descriptors:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 42, "model": ["4", 0] } },
//!   "10": { "class_type": "LoadImage", "inputs": { "image": "input.png" } }
//! }
//! ```
//!
//! [`WorkflowGraph::parse`] turns that object into [`WorkflowNode`]s whose
//! [`NodeKind`] is a closed set of recognized class types with typed
//! inputs, plus catch-all variants for every other class type and for
//! nodes with no `class_type` at all. Per-job values (uploaded image
//! name, target size, seed) are injected with
//! [`WorkflowGraph::apply_job_inputs`] before submission.

use std::collections::BTreeMap;

use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::size::ImageSize;

// ---------------------------------------------------------------------------
// Class types with typed inputs
// ---------------------------------------------------------------------------

const LOAD_IMAGE_CLASS: &str = "LoadImage";
const LATENT_UPSCALE_CLASS: &str = "LatentUpscale";
const IMAGE_SCALE_CLASS: &str = "ImageScale";
const KSAMPLER_CLASS: &str = "KSampler";
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";
const LOAD_CHECKPOINT_CLASS: &str = "CheckpointLoaderSimple";
const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// Node-level keys that are not carried in `extra`.
const CLASS_TYPE_KEY: &str = "class_type";
const INPUTS_KEY: &str = "inputs";

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// Inputs of a `LoadImage` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadImageInputs {
    /// Filename of an image previously uploaded to the server.
    pub image: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Inputs of a `LatentUpscale` or `ImageScale` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScaleInputs {
    pub width: u32,
    pub height: u32,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Inputs of a `KSampler` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SamplerInputs {
    pub seed: u64,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Inputs of a `KSamplerAdvanced` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdvancedSamplerInputs {
    pub noise_seed: u64,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Inputs of a `CheckpointLoaderSimple` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointInputs {
    pub ckpt_name: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Inputs of a `SaveImage` node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveImageInputs {
    pub filename_prefix: String,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Node descriptor, discriminated by its `class_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    LoadImage(LoadImageInputs),
    LatentUpscale(ScaleInputs),
    ImageScale(ScaleInputs),
    KSampler(SamplerInputs),
    KSamplerAdvanced(AdvancedSamplerInputs),
    CheckpointLoaderSimple(CheckpointInputs),
    SaveImage(SaveImageInputs),
    /// Any class type without typed inputs; passed through untouched.
    Other {
        class_type: String,
        inputs: Map<String, Value>,
    },
    /// A node with no `class_type`. Kept so the graph round-trips, but the
    /// server will most likely reject it.
    Untagged { inputs: Map<String, Value> },
}

/// A single node of the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowNode {
    pub kind: NodeKind,
    /// Node-level fields other than `class_type` and `inputs` (e.g. `_meta`).
    pub extra: Map<String, Value>,
}

/// Per-job values injected into a workflow before submission.
#[derive(Debug, Clone)]
pub struct JobInputs {
    /// Server-side filename of the uploaded input image.
    pub image_name: String,
    pub size: ImageSize,
    pub seed: u64,
    /// Replaces every checkpoint loader's model when set.
    pub checkpoint: Option<String>,
}

/// Summary of what [`WorkflowGraph::apply_job_inputs`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedInputs {
    pub images: usize,
    pub scales: usize,
    pub seeds: usize,
    pub checkpoints: usize,
}

/// Parsed workflow, ordered by node id.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, WorkflowNode>,
}

// ---------------------------------------------------------------------------
// Node helpers
// ---------------------------------------------------------------------------

impl NodeKind {
    /// The node's class type, if it has one.
    pub fn class_type(&self) -> Option<&str> {
        Some(match self {
            Self::LoadImage(_) => LOAD_IMAGE_CLASS,
            Self::LatentUpscale(_) => LATENT_UPSCALE_CLASS,
            Self::ImageScale(_) => IMAGE_SCALE_CLASS,
            Self::KSampler(_) => KSAMPLER_CLASS,
            Self::KSamplerAdvanced(_) => KSAMPLER_ADVANCED_CLASS,
            Self::CheckpointLoaderSimple(_) => LOAD_CHECKPOINT_CLASS,
            Self::SaveImage(_) => SAVE_IMAGE_CLASS,
            Self::Other { class_type, .. } => class_type.as_str(),
            Self::Untagged { .. } => return None,
        })
    }

    /// Re-assemble the `inputs` object, typed fields included.
    fn inputs_json(&self) -> Map<String, Value> {
        let (mut map, typed): (Map<String, Value>, Vec<(&str, Value)>) = match self {
            Self::LoadImage(i) => (i.other.clone(), vec![("image", i.image.clone().into())]),
            Self::LatentUpscale(i) | Self::ImageScale(i) => (
                i.other.clone(),
                vec![("width", i.width.into()), ("height", i.height.into())],
            ),
            Self::KSampler(i) => (i.other.clone(), vec![("seed", i.seed.into())]),
            Self::KSamplerAdvanced(i) => {
                (i.other.clone(), vec![("noise_seed", i.noise_seed.into())])
            }
            Self::CheckpointLoaderSimple(i) => {
                (i.other.clone(), vec![("ckpt_name", i.ckpt_name.clone().into())])
            }
            Self::SaveImage(i) => (
                i.other.clone(),
                vec![("filename_prefix", i.filename_prefix.clone().into())],
            ),
            Self::Other { inputs, .. } | Self::Untagged { inputs } => (inputs.clone(), vec![]),
        };
        for (key, value) in typed {
            map.insert(key.to_string(), value);
        }
        map
    }
}

impl WorkflowNode {
    pub fn class_type(&self) -> Option<&str> {
        self.kind.class_type()
    }

    fn to_json(&self) -> Value {
        let mut obj = self.extra.clone();
        if let Some(class_type) = self.class_type() {
            obj.insert(CLASS_TYPE_KEY.to_string(), class_type.into());
        }
        obj.insert(INPUTS_KEY.to_string(), Value::Object(self.kind.inputs_json()));
        Value::Object(obj)
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

impl WorkflowGraph {
    /// Parse and validate an API-format workflow.
    ///
    /// Fatal (returns [`CoreError::Validation`]):
    /// - the graph is not a JSON object, or has no nodes;
    /// - a node is not a JSON object;
    /// - a node's `class_type` or `inputs` has the wrong JSON type;
    /// - a recognized class type whose typed inputs are missing or malformed.
    ///
    /// A node with no `class_type` is logged as a warning and kept.
    pub fn parse(json: &Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        let mut nodes = BTreeMap::new();
        for (node_id, node_value) in obj {
            nodes.insert(node_id.clone(), parse_node(node_id, node_value)?);
        }

        Ok(Self { nodes })
    }

    /// Parse a workflow from its JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let json: Value = serde_json::from_str(text)
            .map_err(|e| CoreError::Validation(format!("Workflow is not valid JSON: {e}")))?;
        Self::parse(&json)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(node_id)
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    /// Inject per-job values into the workflow.
    ///
    /// Every `LoadImage` receives the uploaded filename, every
    /// `LatentUpscale`/`ImageScale` the target size, every sampler the
    /// seed, and every checkpoint loader the override model if one is
    /// given. A workflow without a `LoadImage` node cannot consume the
    /// job's image and is rejected.
    pub fn apply_job_inputs(&mut self, job: &JobInputs) -> Result<AppliedInputs, CoreError> {
        let mut applied = AppliedInputs::default();

        for (node_id, node) in self.nodes.iter_mut() {
            match &mut node.kind {
                NodeKind::LoadImage(i) => {
                    i.image = job.image_name.clone();
                    applied.images += 1;
                }
                NodeKind::LatentUpscale(i) | NodeKind::ImageScale(i) => {
                    i.width = job.size.width;
                    i.height = job.size.height;
                    applied.scales += 1;
                }
                NodeKind::KSampler(i) => {
                    i.seed = job.seed;
                    applied.seeds += 1;
                }
                NodeKind::KSamplerAdvanced(i) => {
                    i.noise_seed = job.seed;
                    applied.seeds += 1;
                }
                NodeKind::CheckpointLoaderSimple(i) => {
                    if let Some(ckpt) = &job.checkpoint {
                        i.ckpt_name = ckpt.clone();
                        applied.checkpoints += 1;
                    }
                }
                _ => continue,
            }
            tracing::trace!(node_id = %node_id, class_type = ?node.class_type(), "Applied job input");
        }

        if applied.images == 0 {
            return Err(CoreError::Validation(
                "Workflow has no LoadImage node to receive the input image".to_string(),
            ));
        }

        Ok(applied)
    }

    /// Serialize back to the API-format JSON object for `POST /prompt`.
    pub fn to_prompt_json(&self) -> Value {
        let map: Map<String, Value> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.to_json()))
            .collect();
        Value::Object(map)
    }
}

/// A fresh seed, uniform over the unsigned 32-bit range.
pub fn random_seed() -> u64 {
    u64::from(rand::rng().random::<u32>())
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_node(node_id: &str, value: &Value) -> Result<WorkflowNode, CoreError> {
    let obj = value.as_object().ok_or_else(|| {
        CoreError::Validation(format!("Node '{node_id}' is not an object: {value}"))
    })?;

    let mut extra = obj.clone();
    let class_type = extra.remove(CLASS_TYPE_KEY);
    let inputs = match extra.remove(INPUTS_KEY) {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' has non-object 'inputs': {other}"
            )))
        }
    };

    let kind = match class_type {
        None => {
            tracing::warn!(node_id = %node_id, "Workflow node is missing 'class_type'");
            NodeKind::Untagged { inputs }
        }
        Some(Value::String(class_type)) => typed_kind(node_id, class_type, inputs)?,
        Some(other) => {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' has non-string 'class_type': {other}"
            )))
        }
    };

    Ok(WorkflowNode { kind, extra })
}

fn typed_kind(
    node_id: &str,
    class_type: String,
    inputs: Map<String, Value>,
) -> Result<NodeKind, CoreError> {
    fn typed<T: serde::de::DeserializeOwned>(
        node_id: &str,
        class_type: &str,
        inputs: Map<String, Value>,
    ) -> Result<T, CoreError> {
        serde_json::from_value(Value::Object(inputs)).map_err(|e| {
            CoreError::Validation(format!(
                "Node '{node_id}' ({class_type}) has invalid inputs: {e}"
            ))
        })
    }

    let kind = match class_type.as_str() {
        LOAD_IMAGE_CLASS => NodeKind::LoadImage(typed(node_id, &class_type, inputs)?),
        LATENT_UPSCALE_CLASS => NodeKind::LatentUpscale(typed(node_id, &class_type, inputs)?),
        IMAGE_SCALE_CLASS => NodeKind::ImageScale(typed(node_id, &class_type, inputs)?),
        KSAMPLER_CLASS => NodeKind::KSampler(typed(node_id, &class_type, inputs)?),
        KSAMPLER_ADVANCED_CLASS => {
            NodeKind::KSamplerAdvanced(typed(node_id, &class_type, inputs)?)
        }
        LOAD_CHECKPOINT_CLASS => {
            NodeKind::CheckpointLoaderSimple(typed(node_id, &class_type, inputs)?)
        }
        SAVE_IMAGE_CLASS => NodeKind::SaveImage(typed(node_id, &class_type, inputs)?),
        _ => NodeKind::Other { class_type, inputs },
    };
    Ok(kind)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
