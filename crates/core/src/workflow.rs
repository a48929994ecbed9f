//! ComfyUI job graphs: parsing, parameter substitution and step extraction.
//!
//! A job graph is a JSON object keyed by node id; each node carries a
//! `class_type` and an `inputs` object. Inputs that reference another node
//! are encoded as `[source_node_id, output_index]` arrays.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::style::StylePreset;

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

const LOAD_IMAGE_CLASS: &str = "LoadImage";
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
const CONTROLNET_APPLY_PREFIX: &str = "ControlNetApply";
const IPADAPTER_PREFIX: &str = "IPAdapter";

/// Node classes whose progress events reflect the job's overall progress.
/// Every other node reports progress too, but only samplers run long enough
/// for it to matter.
pub const SAMPLER_CLASSES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "SamplerCustom",
    "SamplerCustomAdvanced",
];

// ---------------------------------------------------------------------------
// Parameter limits
// ---------------------------------------------------------------------------

pub const MIN_STRENGTH: f64 = 0.1;
pub const MAX_STRENGTH: f64 = 1.0;
pub const DEFAULT_STRENGTH: f64 = 0.6;

/// Maximum length of a custom prompt.
pub const MAX_PROMPT_LENGTH: usize = 2_000;

// ---------------------------------------------------------------------------
// Parsed graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub class_type: String,
    pub inputs: Value,
}

/// A link from one node's output to another node's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnection {
    pub from_node: String,
    pub from_output: String,
    pub to_node: String,
    pub to_input: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedWorkflow {
    /// Nodes ordered by id (numeric ids in numeric order).
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<NodeConnection>,
}

impl ParsedWorkflow {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_of_class<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a WorkflowNode> {
        self.nodes.iter().filter(move |n| n.class_type == class)
    }
}

/// Validate and parse a job graph.
pub fn parse_workflow(json: &Value) -> Result<ParsedWorkflow, CoreError> {
    let obj = json.as_object().ok_or_else(|| {
        CoreError::Validation("Workflow JSON must be an object".to_string())
    })?;

    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }

    let mut nodes = Vec::with_capacity(obj.len());
    let mut connections = Vec::new();

    for (node_id, node_value) in obj {
        let class_type = node_value
            .get("class_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                ))
            })?
            .to_string();

        let inputs = node_value
            .get("inputs")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        if !inputs.is_object() {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' has non-object 'inputs'"
            )));
        }

        if let Some(input_obj) = inputs.as_object() {
            for (input_name, input_val) in input_obj {
                if let Some((from_node, from_output)) = as_link(input_val) {
                    connections.push(NodeConnection {
                        from_node,
                        from_output,
                        to_node: node_id.clone(),
                        to_input: input_name.clone(),
                    });
                }
            }
        }

        nodes.push(WorkflowNode {
            id: node_id.clone(),
            class_type,
            inputs,
        });
    }

    nodes.sort_by(|a, b| node_order(&a.id).cmp(&node_order(&b.id)));

    Ok(ParsedWorkflow { nodes, connections })
}

/// Decode a `[node_id, output_index]` link.
fn as_link(value: &Value) -> Option<(String, String)> {
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let from_node = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let from_output = match &arr[1] {
        Value::Number(n) if n.is_u64() => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Some((from_node, from_output))
}

fn node_order(id: &str) -> (u64, String) {
    (id.parse::<u64>().unwrap_or(u64::MAX), id.to_string())
}

// ---------------------------------------------------------------------------
// Step extraction
// ---------------------------------------------------------------------------

/// Ids of the nodes whose progress events count toward task progress.
pub fn sampler_node_ids(workflow: &ParsedWorkflow) -> HashSet<String> {
    workflow
        .nodes
        .iter()
        .filter(|n| SAMPLER_CLASSES.contains(&n.class_type.as_str()))
        .map(|n| n.id.clone())
        .collect()
}

/// Ids of the text-encode nodes that feed a sampler's `positive` input.
/// Falls back to the first text-encode node when no sampler is wired.
pub fn positive_prompt_node_ids(workflow: &ParsedWorkflow) -> BTreeSet<String> {
    let samplers = sampler_node_ids(workflow);
    let wired: BTreeSet<String> = workflow
        .connections
        .iter()
        .filter(|c| c.to_input == "positive" && samplers.contains(&c.to_node))
        .filter(|c| {
            workflow
                .node(&c.from_node)
                .is_some_and(|n| n.class_type == CLIP_TEXT_ENCODE_CLASS)
        })
        .map(|c| c.from_node.clone())
        .collect();

    if !wired.is_empty() {
        return wired;
    }

    workflow
        .nodes_of_class(CLIP_TEXT_ENCODE_CLASS)
        .next()
        .map(|n| n.id.clone())
        .into_iter()
        .collect()
}

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

/// Explicit value for one node input, applied after all other substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputOverride {
    pub node_id: String,
    pub input: String,
    pub value: Value,
}

/// Caller-supplied knobs for instantiating a job template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    #[serde(default)]
    pub style: StylePreset,
    /// Custom positive prompt; replaces the preset's prompt when set.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default = "default_strength")]
    pub strength: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub overrides: Vec<InputOverride>,
}

fn default_strength() -> f64 {
    DEFAULT_STRENGTH
}

impl Default for JobParams {
    fn default() -> Self {
        Self {
            style: StylePreset::default(),
            prompt: None,
            strength: DEFAULT_STRENGTH,
            seed: None,
            overrides: Vec::new(),
        }
    }
}

impl JobParams {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(MIN_STRENGTH..=MAX_STRENGTH).contains(&self.strength) {
            return Err(CoreError::Validation(format!(
                "Strength must be between {MIN_STRENGTH} and {MAX_STRENGTH}, got {}",
                self.strength
            )));
        }
        if let Some(prompt) = &self.prompt {
            if prompt.trim().is_empty() {
                return Err(CoreError::Validation(
                    "Custom prompt must not be blank".to_string(),
                ));
            }
            if prompt.len() > MAX_PROMPT_LENGTH {
                return Err(CoreError::Validation(format!(
                    "Custom prompt exceeds {MAX_PROMPT_LENGTH} characters"
                )));
            }
        }
        Ok(())
    }

    /// Positive prompt text for this job.
    pub fn positive_prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or_else(|| self.style.prompt())
    }
}

// ---------------------------------------------------------------------------
// Instantiation
// ---------------------------------------------------------------------------

/// A job graph ready for submission, with its relevant progress steps.
#[derive(Debug, Clone)]
pub struct InstantiatedJob {
    pub graph: Value,
    pub relevant_step_ids: HashSet<String>,
}

/// Substitute the uploaded input reference and `params` into a copy of
/// `template`. Pure: the template is never modified.
pub fn instantiate(
    template: &Value,
    input_reference: &str,
    params: &JobParams,
) -> Result<InstantiatedJob, CoreError> {
    params.validate()?;
    let parsed = parse_workflow(template)?;
    let samplers = sampler_node_ids(&parsed);
    let prompt_nodes = positive_prompt_node_ids(&parsed);

    let mut graph = template.clone();
    let nodes = graph.as_object_mut().ok_or_else(|| {
        CoreError::Internal("parsed workflow is no longer an object".to_string())
    })?;

    for node in &parsed.nodes {
        let Some(inputs) = nodes
            .get_mut(&node.id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(|i| i.as_object_mut())
        else {
            continue;
        };

        let class = node.class_type.as_str();
        if class == LOAD_IMAGE_CLASS {
            inputs.insert("image".to_string(), Value::from(input_reference));
        } else if prompt_nodes.contains(&node.id) {
            inputs.insert("text".to_string(), Value::from(params.positive_prompt()));
        } else if samplers.contains(&node.id) {
            if inputs.contains_key("denoise") {
                inputs.insert("denoise".to_string(), Value::from(params.strength));
            }
            if let Some(seed) = params.seed {
                for key in ["seed", "noise_seed"] {
                    if inputs.contains_key(key) {
                        inputs.insert(key.to_string(), Value::from(seed));
                    }
                }
            }
        } else if (class.starts_with(CONTROLNET_APPLY_PREFIX) || class.starts_with(IPADAPTER_PREFIX))
            && inputs.contains_key("strength")
        {
            inputs.insert("strength".to_string(), Value::from(params.strength));
        }
    }

    for o in &params.overrides {
        let inputs = nodes
            .get_mut(&o.node_id)
            .and_then(|n| n.get_mut("inputs"))
            .and_then(|i| i.as_object_mut())
            .ok_or_else(|| {
                CoreError::Validation(format!("Override targets unknown node '{}'", o.node_id))
            })?;
        inputs.insert(o.input.clone(), o.value.clone());
    }

    Ok(InstantiatedJob {
        graph,
        relevant_step_ids: samplers,
    })
}
