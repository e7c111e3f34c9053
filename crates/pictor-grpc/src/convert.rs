//! Conversions between wire messages and domain types.

use std::collections::BTreeSet;

use pictor_core::{
    ContentTable, ControlHint, DeviceType, GenerationConfiguration, GenerationInput,
    MetadataOverrides, Signpost, Specification,
};
use pictor_rewriter::DownloadProgress;

use crate::proto::{
    DeviceType as DeviceProto, ImageGenerationRequest, ImageGenerationResponse, MetadataOverride,
    RemoteDownloadResponse, SignpostKind, SignpostProto,
};

/// Wire form of a signpost
pub fn signpost_to_proto(signpost: &Signpost) -> SignpostProto {
    let (kind, step) = match *signpost {
        Signpost::TextEncoded => (SignpostKind::TextEncoded, 0),
        Signpost::ImageEncoded => (SignpostKind::ImageEncoded, 0),
        Signpost::Sampling(step) => (SignpostKind::Sampling, step),
        Signpost::ImageDecoded => (SignpostKind::ImageDecoded, 0),
        Signpost::SecondPassImageEncoded => (SignpostKind::SecondPassImageEncoded, 0),
        Signpost::SecondPassSampling(step) => (SignpostKind::SecondPassSampling, step),
        Signpost::SecondPassImageDecoded => (SignpostKind::SecondPassImageDecoded, 0),
        Signpost::FaceRestored => (SignpostKind::FaceRestored, 0),
        Signpost::ImageUpscaled => (SignpostKind::ImageUpscaled, 0),
    };
    SignpostProto {
        kind: kind as i32,
        step: step as i32,
    }
}

/// Domain form of a wire signpost; unknown kinds yield `None`
pub fn signpost_from_proto(proto: &SignpostProto) -> Option<Signpost> {
    let step = proto.step.max(0) as u32;
    let signpost = match SignpostKind::try_from(proto.kind).ok()? {
        SignpostKind::TextEncoded => Signpost::TextEncoded,
        SignpostKind::ImageEncoded => Signpost::ImageEncoded,
        SignpostKind::Sampling => Signpost::Sampling(step),
        SignpostKind::ImageDecoded => Signpost::ImageDecoded,
        SignpostKind::SecondPassImageEncoded => Signpost::SecondPassImageEncoded,
        SignpostKind::SecondPassSampling => Signpost::SecondPassSampling(step),
        SignpostKind::SecondPassImageDecoded => Signpost::SecondPassImageDecoded,
        SignpostKind::FaceRestored => Signpost::FaceRestored,
        SignpostKind::ImageUpscaled => Signpost::ImageUpscaled,
    };
    Some(signpost)
}

/// Device class; unknown values fall back to laptop
pub fn device_from_proto(device: i32) -> DeviceType {
    match DeviceProto::try_from(device) {
        Ok(DeviceProto::Phone) => DeviceType::Phone,
        Ok(DeviceProto::Tablet) => DeviceType::Tablet,
        _ => DeviceType::Laptop,
    }
}

/// Decode the per-request metadata overrides
pub fn overrides_from_proto(proto: Option<&MetadataOverride>) -> MetadataOverrides {
    match proto {
        Some(o) => MetadataOverrides::decode(
            &o.models,
            &o.loras,
            &o.control_nets,
            &o.textual_inversions,
            &o.upscalers,
        ),
        None => MetadataOverrides::default(),
    }
}

/// Encode specifications as the JSON lists carried on the wire
pub fn overrides_to_proto(overrides: &MetadataOverrides) -> MetadataOverride {
    MetadataOverride {
        models: encode_specifications(&overrides.models),
        loras: encode_specifications(&overrides.loras),
        control_nets: encode_specifications(&overrides.control_nets),
        textual_inversions: encode_specifications(&overrides.textual_inversions),
        upscalers: encode_specifications(&overrides.upscalers),
    }
}

fn encode_specifications(specs: &[Specification]) -> Vec<u8> {
    if specs.is_empty() {
        return Vec::new();
    }
    serde_json::to_vec(specs).unwrap_or_default()
}

/// Build the generator input, resolving content references
pub fn generation_input(
    request: ImageGenerationRequest,
    configuration: GenerationConfiguration,
) -> GenerationInput {
    let contents = ContentTable::new(request.contents);
    let hints = request
        .hints
        .into_iter()
        .map(|hint| ControlHint {
            hint_type: hint.hint_type,
            tensors: hint
                .tensors
                .into_iter()
                .map(|t| (contents.resolve(t.tensor), t.weight))
                .collect(),
        })
        .collect();

    GenerationInput {
        image: request.image.map(|image| contents.resolve(image)),
        mask: request.mask.map(|mask| contents.resolve(mask)),
        hints,
        prompt: request.prompt,
        negative_prompt: request.negative_prompt,
        scale_factor: request.scale_factor.max(1) as u32,
        configuration,
        keywords: request.keywords,
        overrides: overrides_from_proto(request.r#override.as_ref()),
    }
}

/// Remote download progress message
pub fn download_message(progress: &DownloadProgress) -> ImageGenerationResponse {
    ImageGenerationResponse {
        remote_download: Some(RemoteDownloadResponse {
            bytes_received: progress.bytes_received as i64,
            bytes_expected: progress.bytes_expected.map(|b| b as i64).unwrap_or(0),
            item: progress.index as i32,
            items_expected: progress.total as i32,
        }),
        ..Default::default()
    }
}

/// Signpost progress message
pub fn progress_message(
    signpost: &Signpost,
    signposts: &BTreeSet<Signpost>,
    preview: Option<Vec<u8>>,
) -> ImageGenerationResponse {
    ImageGenerationResponse {
        current_signpost: Some(signpost_to_proto(signpost)),
        signposts: signposts.iter().map(signpost_to_proto).collect(),
        preview_image: preview,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{HintProto, TensorAndWeight};
    use sha2::{Digest, Sha256};

    #[test]
    fn test_signpost_wire_form() {
        for signpost in [
            Signpost::TextEncoded,
            Signpost::Sampling(12),
            Signpost::SecondPassSampling(3),
            Signpost::ImageUpscaled,
        ] {
            let proto = signpost_to_proto(&signpost);
            assert_eq!(signpost_from_proto(&proto), Some(signpost));
        }
        assert_eq!(
            signpost_from_proto(&SignpostProto { kind: 99, step: 0 }),
            None
        );
    }

    #[test]
    fn test_device_fallback() {
        assert_eq!(device_from_proto(DeviceProto::Phone as i32), DeviceType::Phone);
        assert_eq!(device_from_proto(42), DeviceType::Laptop);
    }

    #[test]
    fn test_input_resolves_content_references() {
        let image = b"init image bytes".to_vec();
        let reference = Sha256::digest(&image).to_vec();
        let missing = Sha256::digest(b"not uploaded").to_vec();

        let request = ImageGenerationRequest {
            image: Some(reference.clone()),
            mask: Some(missing),
            hints: vec![HintProto {
                hint_type: "depth".to_string(),
                tensors: vec![TensorAndWeight {
                    tensor: reference,
                    weight: 0.5,
                }],
            }],
            contents: vec![image.clone()],
            prompt: "animal".to_string(),
            ..Default::default()
        };

        let input = generation_input(request, GenerationConfiguration::default());
        assert_eq!(input.image.as_deref(), Some(image.as_slice()));
        assert_eq!(input.mask.as_deref(), Some(&[][..]));
        assert_eq!(input.hints[0].tensors[0].0, image);
        assert_eq!(input.scale_factor, 1);
        assert_eq!(input.prompt, "animal");
    }

    #[test]
    fn test_overrides_tolerate_bad_lists() {
        let proto = MetadataOverride {
            models: br#"[{"file":"a.ckpt","name":"A"},{"bogus":true}]"#.to_vec(),
            loras: b"not json".to_vec(),
            ..Default::default()
        };
        let overrides = overrides_from_proto(Some(&proto));
        assert_eq!(overrides.models.len(), 1);
        assert!(overrides.loras.is_empty());

        let encoded = overrides_to_proto(&overrides);
        assert!(encoded.loras.is_empty());
        assert_eq!(overrides_from_proto(Some(&encoded)), overrides);
    }

    #[test]
    fn test_download_message() {
        let message = download_message(&DownloadProgress {
            bytes_received: 10,
            bytes_expected: None,
            index: 1,
            total: 2,
        });
        let download = message.remote_download.unwrap();
        assert_eq!(download.bytes_received, 10);
        assert_eq!(download.bytes_expected, 0);
        assert_eq!(download.items_expected, 2);
    }
}
