//! Boundary to the compute collaborator
//!
//! The image generator itself (model loading, sampling, decoding) lives
//! outside this workspace. The serving layer only needs a blocking,
//! cooperatively-cancellable call that reports milestones as it goes.

use crate::{CancelAction, GenerationConfiguration, GeneratorError, Signpost};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Device class of the requesting client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeviceType {
    Phone,
    Tablet,
    #[default]
    Laptop,
}

/// Metadata describing one model-like asset (model, LoRA, control net, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    /// File name the specification applies to
    pub file: String,
    /// Display name
    pub name: String,
    /// Remaining fields, passed through to the generator untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Specification {
    /// Create a minimal specification
    pub fn new(file: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            name: name.into(),
            extra: Map::new(),
        }
    }
}

/// Per-request substitution of asset metadata.
///
/// Passed explicitly to [`ImageGenerator::generate`] so two lanes can run
/// concurrently without sharing global override state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataOverrides {
    pub models: Vec<Specification>,
    pub loras: Vec<Specification>,
    pub control_nets: Vec<Specification>,
    pub textual_inversions: Vec<Specification>,
    pub upscalers: Vec<Specification>,
}

impl MetadataOverrides {
    /// Decode each override list from its JSON payload.
    ///
    /// Each list is decoded independently; an undecodable list is empty and
    /// an undecodable element is skipped without affecting its neighbours.
    pub fn decode(
        models: &[u8],
        loras: &[u8],
        control_nets: &[u8],
        textual_inversions: &[u8],
        upscalers: &[u8],
    ) -> Self {
        Self {
            models: decode_specifications(models),
            loras: decode_specifications(loras),
            control_nets: decode_specifications(control_nets),
            textual_inversions: decode_specifications(textual_inversions),
            upscalers: decode_specifications(upscalers),
        }
    }

    /// Whether no overrides are present
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
            && self.loras.is_empty()
            && self.control_nets.is_empty()
            && self.textual_inversions.is_empty()
            && self.upscalers.is_empty()
    }

    /// Model overrides keyed by file; the first entry for a file wins
    pub fn model_mapping(&self) -> HashMap<&str, &Specification> {
        mapping(&self.models)
    }

    /// LoRA overrides keyed by file; the first entry for a file wins
    pub fn lora_mapping(&self) -> HashMap<&str, &Specification> {
        mapping(&self.loras)
    }
}

fn mapping(specs: &[Specification]) -> HashMap<&str, &Specification> {
    let mut map = HashMap::with_capacity(specs.len());
    for spec in specs {
        map.entry(spec.file.as_str()).or_insert(spec);
    }
    map
}

/// Decode a JSON array of specifications, dropping malformed elements
pub fn decode_specifications(data: &[u8]) -> Vec<Specification> {
    if data.is_empty() {
        return Vec::new();
    }

    let values: Vec<Value> = match serde_json::from_slice(data) {
        Ok(values) => values,
        Err(e) => {
            debug!("Ignoring malformed specification list: {}", e);
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

/// Control hint input
#[derive(Debug, Clone, PartialEq)]
pub struct ControlHint {
    /// Hint type name, e.g. "scribble" or "depth"
    pub hint_type: String,
    /// Encoded tensors with their weights
    pub tensors: Vec<(Vec<u8>, f32)>,
}

/// Everything the generator needs for one request
#[derive(Debug, Clone, Default)]
pub struct GenerationInput {
    /// Encoded init image
    pub image: Option<Vec<u8>>,
    /// Encoded inpainting mask
    pub mask: Option<Vec<u8>>,
    /// Control hints
    pub hints: Vec<ControlHint>,
    pub prompt: String,
    pub negative_prompt: String,
    /// Requested upscale factor
    pub scale_factor: u32,
    pub configuration: GenerationConfiguration,
    pub keywords: Vec<String>,
    pub overrides: MetadataOverrides,
}

/// A progress tick reported by the generator
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Milestone just reached
    pub signpost: Signpost,
    /// All milestones expected for this request
    pub signposts: BTreeSet<Signpost>,
    /// Encoded preview tensor, when the generator produced one
    pub preview: Option<Vec<u8>>,
}

/// Result of a generation call
#[derive(Debug, Clone, Default)]
pub struct GenerationOutput {
    /// Encoded output tensors; empty when nothing was produced
    pub images: Vec<Vec<u8>>,
    /// Effective upscale factor of the outputs
    pub scale_factor: u32,
}

/// The compute collaborator.
///
/// `generate` blocks the calling thread. Implementations poll the feedback
/// callback between units of work and return early once it answers `false`.
/// Phase-specific cancel actions (e.g. aborting a GPU command buffer) are
/// handed to `cancellation`.
pub trait ImageGenerator: Send + Sync + 'static {
    /// Signposts this request is expected to pass
    fn expected_signposts(&self, input: &GenerationInput) -> BTreeSet<Signpost> {
        let mut signposts = crate::signpost::text_to_image_signposts(input.configuration.steps);
        if input.image.is_some() {
            signposts.insert(Signpost::ImageEncoded);
        }
        signposts
    }

    /// Run the generation
    fn generate(
        &self,
        input: GenerationInput,
        cancellation: &dyn Fn(CancelAction),
        feedback: &mut dyn FnMut(ProgressEvent) -> bool,
    ) -> Result<GenerationOutput, GeneratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_skips_malformed_elements() {
        let data = br#"[
            {"file": "a.ckpt", "name": "A", "version": "v1"},
            {"name": "missing file"},
            42,
            {"file": "b.ckpt", "name": "B"}
        ]"#;
        let specs = decode_specifications(data);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].file, "a.ckpt");
        assert_eq!(specs[0].extra.get("version"), Some(&Value::from("v1")));
        assert_eq!(specs[1].file, "b.ckpt");
    }

    #[test]
    fn test_decode_tolerates_malformed_list() {
        assert!(decode_specifications(b"not json").is_empty());
        assert!(decode_specifications(b"{\"file\": \"a\"}").is_empty());
        assert!(decode_specifications(b"").is_empty());
    }

    #[test]
    fn test_lists_decode_independently() {
        let overrides = MetadataOverrides::decode(
            br#"[{"file":"m.ckpt","name":"M"}]"#,
            b"garbage",
            b"",
            br#"[{"file":"ti.ckpt","name":"TI"}]"#,
            b"",
        );
        assert_eq!(overrides.models.len(), 1);
        assert!(overrides.loras.is_empty());
        assert_eq!(overrides.textual_inversions.len(), 1);
        assert!(!overrides.is_empty());
    }

    #[test]
    fn test_mapping_keeps_first_entry() {
        let overrides = MetadataOverrides {
            models: vec![
                Specification::new("m.ckpt", "first"),
                Specification::new("m.ckpt", "second"),
            ],
            ..Default::default()
        };
        let mapping = overrides.model_mapping();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping["m.ckpt"].name, "first");
    }
}
