//! ACE-Step back-end: latent diffusion generation, 48 kHz output.

pub mod decoder;
pub mod generate;
pub mod guidance;
pub mod latent;
pub mod scheduler;
mod tensors;
pub mod text_encoder;
pub mod transformer;
pub mod vocoder;

use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::models::loader::missing_files;

pub use decoder::LatentDecoder;
pub use generate::generate;
pub use guidance::{
    apply_cfg, validate_guidance_scale, DEFAULT_GUIDANCE_SCALE, MAX_GUIDANCE_SCALE,
    MIN_GUIDANCE_SCALE,
};
pub use scheduler::{FlowScheduler, SchedulerType};
pub use text_encoder::Umt5TextEncoder;
pub use transformer::DiffusionTransformer;
pub use vocoder::{Vocoder, VOCODER_SAMPLE_RATE};

/// Files that must exist before the back-end counts as installed.
pub const REQUIRED_FILES: &[&str] = &[
    "tokenizer.json",
    "text_encoder.onnx",
    "transformer_encoder.onnx",
    "transformer_decoder.onnx",
    "transformer_decoder_weights.bin",
    "dcae_decoder.onnx",
    "vocoder.onnx",
];

/// Download sources for the asset fetcher.
pub const ASSET_URLS: &[(&str, &str)] = &[
    (
        "tokenizer.json",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/tokenizer.json",
    ),
    (
        "text_encoder.onnx",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/text_encoder.onnx",
    ),
    (
        "transformer_encoder.onnx",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/transformer_encoder.onnx",
    ),
    (
        "transformer_decoder.onnx",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/transformer_decoder.onnx",
    ),
    (
        "transformer_decoder_weights.bin",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/transformer_decoder_weights.bin",
    ),
    (
        "dcae_decoder.onnx",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/dcae_decoder.onnx",
    ),
    (
        "vocoder.onnx",
        "https://huggingface.co/cadenced/ace-step-onnx/resolve/main/vocoder.onnx",
    ),
];

/// Model-version string for this asset set.
pub fn detect_version(_model_dir: &Path) -> String {
    "ace-step-v1".to_string()
}

/// The loaded ACE-Step session set.
pub struct AceStepModels {
    pub text_encoder: Umt5TextEncoder,
    pub transformer: DiffusionTransformer,
    pub decoder: LatentDecoder,
    pub vocoder: Vocoder,
    version: String,
    device_name: String,
}

impl std::fmt::Debug for AceStepModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AceStepModels")
            .field("version", &self.version)
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

impl AceStepModels {
    /// Loads all sessions from the asset directory.
    ///
    /// On macOS the pipeline stays in fp32: reduced-precision CoreML paths
    /// destabilize the diffusion numerics.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
        device_name: &str,
    ) -> Result<Self> {
        missing_files(model_dir, REQUIRED_FILES)?;

        let fp32_forced = cfg!(target_os = "macos");
        info!(
            dir = %model_dir.display(),
            device = device_name,
            fp32_forced,
            "loading ACE-Step sessions"
        );

        let text_encoder = Umt5TextEncoder::load(model_dir, providers, threads)?;
        let transformer = DiffusionTransformer::load(model_dir, providers, threads)?;
        let decoder = LatentDecoder::load(model_dir, providers, threads)?;
        let vocoder = Vocoder::load(model_dir, providers, threads)?;
        info!("ACE-Step sessions ready");

        Ok(Self {
            text_encoder,
            transformer,
            decoder,
            vocoder,
            version: detect_version(model_dir),
            device_name: device_name.to_string(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_files_cover_all_sessions() {
        assert!(REQUIRED_FILES.contains(&"text_encoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"transformer_encoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"transformer_decoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"dcae_decoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"vocoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"tokenizer.json"));
    }

    #[test]
    fn every_required_file_has_a_url() {
        for file in REQUIRED_FILES {
            assert!(
                ASSET_URLS.iter().any(|(name, _)| name == file),
                "no URL for {file}"
            );
        }
    }
}
