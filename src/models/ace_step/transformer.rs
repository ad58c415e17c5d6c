//! Diffusion transformer sessions.
//!
//! Two sessions: a context encoder that fuses text, speaker, and lyric
//! conditioning into 2560-dimensional hidden states, and the denoiser that
//! predicts the velocity for a noisy latent at a timestep.
//!
//! Instrumental generation feeds zeroed speaker embeddings and an empty
//! lyric sequence.
//!
//! Session signatures:
//!
//! `transformer_encoder.onnx`
//! - in: `encoder_text_hidden_states` (batch, text_seq, 768),
//!   `text_attention_mask` (batch, text_seq), `speaker_embeds` (batch, 512),
//!   `lyric_token_idx` (batch, lyric_seq), `lyric_mask` (batch, lyric_seq)
//! - out: `encoder_hidden_states` (batch, seq, 2560), `encoder_hidden_mask`
//!   (batch, seq)
//!
//! `transformer_decoder.onnx`
//! - in: `hidden_states` (batch, 8, 16, frames), `attention_mask`
//!   (batch, frames), `encoder_hidden_states`, `encoder_hidden_mask`,
//!   `timestep` (1,)
//! - out: `sample` (batch, 8, 16, frames)

use std::path::Path;

use ndarray::{Array2, Array3, Array4};
use ort::session::Session;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

use super::tensors::{f32_tensor, i64_tensor, to_array2, to_array3, to_array4};

/// Dimension of the fused conditioning states.
pub const CONTEXT_DIM: usize = 2560;

/// Dimension of the (zeroed) speaker embedding input.
pub const SPEAKER_EMBED_DIM: usize = 512;

/// Fused conditioning for one guidance branch.
pub struct ConditioningContext {
    pub hidden_states: Array3<f32>,
    pub mask: Array2<f32>,
}

pub struct DiffusionTransformer {
    encoder: Session,
    denoiser: Session,
}

impl std::fmt::Debug for DiffusionTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffusionTransformer").finish_non_exhaustive()
    }
}

impl DiffusionTransformer {
    /// Loads `transformer_encoder.onnx` and `transformer_decoder.onnx`.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let encoder = load_session(&model_dir.join("transformer_encoder.onnx"), providers, threads)?;
        let denoiser = load_session(&model_dir.join("transformer_decoder.onnx"), providers, threads)?;
        Ok(Self { encoder, denoiser })
    }

    /// Fuses text conditioning into the denoiser's context space, with
    /// zeroed speaker and lyric inputs (instrumental mode).
    pub fn encode_context(
        &mut self,
        text_hidden_states: &Array3<f32>,
        text_attention_mask: &Array2<i64>,
    ) -> Result<ConditioningContext> {
        let (batch, text_seq, dim) = text_hidden_states.dim();

        let text_states = f32_tensor(
            vec![batch, text_seq, dim],
            text_hidden_states.iter().copied().collect(),
            "encoder_text_hidden_states",
        )?;
        let text_mask = i64_tensor(
            vec![batch, text_seq],
            text_attention_mask.iter().copied().collect(),
            "text_attention_mask",
        )?;
        let speaker = f32_tensor(
            vec![batch, SPEAKER_EMBED_DIM],
            vec![0.0; batch * SPEAKER_EMBED_DIM],
            "speaker_embeds",
        )?;
        // a single padding token stands in for the absent lyrics
        let lyrics = i64_tensor(vec![batch, 1], vec![0; batch], "lyric_token_idx")?;
        let lyric_mask = i64_tensor(vec![batch, 1], vec![0; batch], "lyric_mask")?;

        let mut outputs = self
            .encoder
            .run(ort::inputs![
                "encoder_text_hidden_states" => text_states.view(),
                "text_attention_mask" => text_mask.view(),
                "speaker_embeds" => speaker.view(),
                "lyric_token_idx" => lyrics.view(),
                "lyric_mask" => lyric_mask.view(),
            ])
            .map_err(|e| DaemonError::inference(format!("context encoder failed: {e}")))?;

        let hidden = outputs
            .remove("encoder_hidden_states")
            .ok_or_else(|| DaemonError::inference("context encoder returned no hidden states"))?;
        let mask = outputs
            .remove("encoder_hidden_mask")
            .ok_or_else(|| DaemonError::inference("context encoder returned no mask"))?;

        Ok(ConditioningContext {
            hidden_states: to_array3(&hidden, "conditioning context")?,
            mask: to_array2(&mask, "conditioning mask")?,
        })
    }

    /// One denoiser evaluation: predicts the velocity for `latent` at
    /// `timestep` under the given conditioning.
    pub fn predict(
        &mut self,
        latent: &Array4<f32>,
        timestep: f32,
        context: &ConditioningContext,
    ) -> Result<Array4<f32>> {
        let (batch, channels, height, frames) = latent.dim();
        let (_, context_seq, context_dim) = context.hidden_states.dim();
        debug_assert_eq!(context_dim, CONTEXT_DIM);

        let latent_tensor = f32_tensor(
            vec![batch, channels, height, frames],
            latent.iter().copied().collect(),
            "hidden_states",
        )?;
        // all latent frames attend
        let frame_mask = f32_tensor(vec![batch, frames], vec![1.0; batch * frames], "attention_mask")?;
        let context_states = f32_tensor(
            vec![batch, context_seq, context_dim],
            context.hidden_states.iter().copied().collect(),
            "encoder_hidden_states",
        )?;
        let context_mask = f32_tensor(
            vec![batch, context_seq],
            context.mask.iter().copied().collect(),
            "encoder_hidden_mask",
        )?;
        let timestep_tensor = f32_tensor(vec![1], vec![timestep], "timestep")?;

        let mut outputs = self
            .denoiser
            .run(ort::inputs![
                "hidden_states" => latent_tensor.view(),
                "attention_mask" => frame_mask.view(),
                "encoder_hidden_states" => context_states.view(),
                "encoder_hidden_mask" => context_mask.view(),
                "timestep" => timestep_tensor.view(),
            ])
            .map_err(|e| DaemonError::inference(format!("denoiser failed: {e}")))?;

        let sample = outputs
            .remove("sample")
            .ok_or_else(|| DaemonError::inference("denoiser returned no sample"))?;
        to_array4(&sample, "velocity prediction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions() {
        assert_eq!(CONTEXT_DIM, 2560);
        assert_eq!(SPEAKER_EMBED_DIM, 512);
    }
}
