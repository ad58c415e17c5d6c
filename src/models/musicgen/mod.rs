//! MusicGen back-end: autoregressive 4-codebook generation at 32 kHz.

pub mod audio_codec;
pub mod decoder;
pub mod delay_pattern;
pub mod logits;
pub mod text_encoder;

use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::models::backend::GenerateSpec;
use crate::models::loader::missing_files;
use crate::models::TOKENS_PER_SECOND;
use crate::types::{CancelFlag, ModelConfig};

pub use audio_codec::MusicGenAudioCodec;
pub use decoder::MusicGenDecoder;
pub use delay_pattern::DelayPattern;
pub use logits::{Logits, GUIDANCE_SCALE, TOP_K};
pub use text_encoder::MusicGenTextEncoder;

/// Files that must exist before the back-end counts as installed.
pub const REQUIRED_FILES: &[&str] = &[
    "tokenizer.json",
    "config.json",
    "text_encoder.onnx",
    "decoder_model.onnx",
    "decoder_with_past_model.onnx",
    "encodec_decode.onnx",
];

/// Download sources for the asset fetcher.
pub const ASSET_URLS: &[(&str, &str)] = &[
    (
        "tokenizer.json",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/tokenizer.json",
    ),
    (
        "config.json",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/config.json",
    ),
    (
        "text_encoder.onnx",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/text_encoder.onnx",
    ),
    (
        "decoder_model.onnx",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/decoder_model.onnx",
    ),
    (
        "decoder_with_past_model.onnx",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/decoder_with_past_model.onnx",
    ),
    (
        "encodec_decode.onnx",
        "https://huggingface.co/gabotechs/music_gen/resolve/main/small_fp16/encodec_decode.onnx",
    ),
];

/// Model-version string for this asset set. The fp16/fp32 variant is part of
/// the version because it changes the output bits.
pub fn detect_version(model_dir: &Path) -> String {
    let variant = model_dir
        .to_str()
        .map(|s| s.contains("fp32"))
        .unwrap_or(false);
    if variant {
        "musicgen-small-fp32-v1".to_string()
    } else {
        "musicgen-small-fp16-v1".to_string()
    }
}

/// The loaded MusicGen session set.
pub struct MusicGenModels {
    pub text_encoder: MusicGenTextEncoder,
    pub decoder: MusicGenDecoder,
    pub audio_codec: MusicGenAudioCodec,
    version: String,
    device_name: String,
}

impl std::fmt::Debug for MusicGenModels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicGenModels")
            .field("version", &self.version)
            .field("device_name", &self.device_name)
            .finish_non_exhaustive()
    }
}

impl MusicGenModels {
    /// Loads all four sessions from the asset directory.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
        device_name: &str,
    ) -> Result<Self> {
        missing_files(model_dir, REQUIRED_FILES)?;
        let config = ModelConfig::from_model_dir(model_dir)?;

        info!(
            dir = %model_dir.display(),
            device = device_name,
            layers = config.num_hidden_layers,
            "loading MusicGen sessions"
        );
        let text_encoder = MusicGenTextEncoder::load(model_dir, providers, threads)?;
        let decoder = MusicGenDecoder::load(model_dir, providers, threads, config)?;
        let audio_codec = MusicGenAudioCodec::load(model_dir, providers, threads)?;
        info!("MusicGen sessions ready");

        Ok(Self {
            text_encoder,
            decoder,
            audio_codec,
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

/// Runs the full AR pipeline: encode prompt, decode token frames, decode
/// audio. Returns mono samples at 32 kHz.
pub fn generate(
    models: &mut MusicGenModels,
    spec: &GenerateSpec,
    cancel: &CancelFlag,
    on_progress: &dyn Fn(usize, usize),
) -> Result<Vec<f32>> {
    let frames_wanted = spec.duration_sec as usize * TOKENS_PER_SECOND;

    let (hidden_states, attention_mask) = models.text_encoder.encode(&spec.prompt)?;
    let frames = models.decoder.generate_frames(
        hidden_states,
        attention_mask,
        frames_wanted,
        spec.seed,
        cancel,
        on_progress,
    )?;
    models.audio_codec.decode(&frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_files_cover_all_sessions() {
        assert!(REQUIRED_FILES.contains(&"text_encoder.onnx"));
        assert!(REQUIRED_FILES.contains(&"decoder_model.onnx"));
        assert!(REQUIRED_FILES.contains(&"decoder_with_past_model.onnx"));
        assert!(REQUIRED_FILES.contains(&"encodec_decode.onnx"));
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

    #[test]
    fn version_tracks_precision_variant() {
        assert_eq!(
            detect_version(Path::new("/models/musicgen-small-fp16")),
            "musicgen-small-fp16-v1"
        );
        assert_eq!(
            detect_version(Path::new("/models/musicgen-small-fp32")),
            "musicgen-small-fp32-v1"
        );
    }
}
