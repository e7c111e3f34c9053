//! Pipeline milestones used for progress reporting

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A named milestone in the generation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Signpost {
    /// Prompt encoded
    TextEncoded,
    /// Input image encoded into latent space
    ImageEncoded,
    /// Denoising step completed
    Sampling(u32),
    /// Latent decoded to pixels
    ImageDecoded,
    /// Second pass: image re-encoded
    SecondPassImageEncoded,
    /// Second pass denoising step completed
    SecondPassSampling(u32),
    /// Second pass decoded
    SecondPassImageDecoded,
    /// Face restoration applied
    FaceRestored,
    /// Upscaler applied
    ImageUpscaled,
}

impl Signpost {
    /// Step number for sampling signposts
    pub fn step(&self) -> Option<u32> {
        match self {
            Signpost::Sampling(step) | Signpost::SecondPassSampling(step) => Some(*step),
            _ => None,
        }
    }
}

impl fmt::Display for Signpost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signpost::TextEncoded => write!(f, "textEncoded"),
            Signpost::ImageEncoded => write!(f, "imageEncoded"),
            Signpost::Sampling(step) => write!(f, "sampling({})", step),
            Signpost::ImageDecoded => write!(f, "imageDecoded"),
            Signpost::SecondPassImageEncoded => write!(f, "secondPassImageEncoded"),
            Signpost::SecondPassSampling(step) => write!(f, "secondPassSampling({})", step),
            Signpost::SecondPassImageDecoded => write!(f, "secondPassImageDecoded"),
            Signpost::FaceRestored => write!(f, "faceRestored"),
            Signpost::ImageUpscaled => write!(f, "imageUpscaled"),
        }
    }
}

/// Signposts a plain text-to-image run with `steps` sampling steps emits
pub fn text_to_image_signposts(steps: u32) -> BTreeSet<Signpost> {
    let mut signposts = BTreeSet::new();
    signposts.insert(Signpost::TextEncoded);
    for step in 0..steps {
        signposts.insert(Signpost::Sampling(step));
    }
    signposts.insert(Signpost::ImageDecoded);
    signposts
}
