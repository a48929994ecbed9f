//! Output artifact extraction.
//!
//! ComfyUI has reported results in several shapes over time:
//!
//! * nested by node id: `{"9": {"images": [{...}]}}`
//! * a flat list of node entries: `[{"node_id": "9", "outputs": {"images": [...]}}]`
//! * a flat list of image descriptors: `[{"filename": ..., "type": ...}]`
//! * a single node output: `{"images": [...]}`
//!
//! All of them are accepted. Final images (`type == "output"`) win over
//! `temp` previews.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a final, saved image.
pub const KIND_OUTPUT: &str = "output";

/// Kind of a preview image that ComfyUI may delete later.
pub const KIND_TEMP: &str = "temp";

/// Locator of one image on the ComfyUI server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    KIND_OUTPUT.to_string()
}

impl OutputImage {
    fn from_descriptor(value: &Value) -> Option<Self> {
        let filename = value.get("filename")?.as_str()?;
        if filename.is_empty() {
            return None;
        }
        let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            filename: filename.to_string(),
            subfolder: field("subfolder").unwrap_or_default(),
            kind: field("type").unwrap_or_else(default_kind),
        })
    }

    pub fn is_final(&self) -> bool {
        self.kind == KIND_OUTPUT
    }
}

/// Every image found in `outputs`, in node order.
pub fn collect_images(outputs: &Value) -> Vec<OutputImage> {
    let mut found = Vec::new();
    gather(outputs, &mut found);
    found
}

/// The image a task should report as its result.
pub fn primary_image(outputs: &Value) -> Option<OutputImage> {
    let images = collect_images(outputs);
    let idx = images.iter().position(OutputImage::is_final).unwrap_or(0);
    images.into_iter().nth(idx)
}

fn gather(value: &Value, found: &mut Vec<OutputImage>) {
    match value {
        Value::Array(items) => {
            for item in items {
                gather(item, found);
            }
        }
        Value::Object(map) => {
            if let Some(image) = OutputImage::from_descriptor(value) {
                found.push(image);
            } else if let Some(images) = map.get("images").and_then(Value::as_array) {
                found.extend(images.iter().filter_map(OutputImage::from_descriptor));
            } else if let Some(inner) = map.get("outputs") {
                gather(inner, found);
            } else {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_by(|a, b| node_key(a).cmp(&node_key(b)));
                for key in keys {
                    gather(&map[key.as_str()], found);
                }
            }
        }
        _ => {}
    }
}

fn node_key(id: &str) -> (u64, &str) {
    (id.parse::<u64>().unwrap_or(u64::MAX), id)
}
