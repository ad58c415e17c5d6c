//! DCAE latent decoder: diffusion latent to mel-spectrogram.
//!
//! The exported model takes a fixed 128-frame latent window, so longer
//! latents are decoded in windows and stitched along the time axis; shorter
//! ones are zero-padded and the mel output trimmed back proportionally.

use std::path::Path;

use ndarray::{concatenate, s, Array3, Array4, Axis};
use ort::session::Session;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

use super::latent::{LATENT_CHANNELS, LATENT_HEIGHT};
use super::tensors::{f32_tensor, shape_of};

/// Mel bins produced per frame.
pub const MEL_BINS: usize = 128;

/// Fixed latent window of the exported decoder.
pub const DECODE_WINDOW: usize = 128;

pub struct LatentDecoder {
    session: Session,
}

impl std::fmt::Debug for LatentDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatentDecoder").finish_non_exhaustive()
    }
}

impl LatentDecoder {
    /// Loads `dcae_decoder.onnx`.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let session = load_session(&model_dir.join("dcae_decoder.onnx"), providers, threads)?;
        Ok(Self { session })
    }

    /// Decodes a `(1, 8, 16, frames)` latent into a `(1, mel_bins, time)`
    /// spectrogram.
    pub fn decode(&mut self, latent: &Array4<f32>) -> Result<Array3<f32>> {
        let frames = latent.shape()[3];
        if frames <= DECODE_WINDOW {
            return self.decode_window(latent, frames);
        }

        let windows = frames.div_ceil(DECODE_WINDOW);
        let mut mel_parts: Vec<Array3<f32>> = Vec::with_capacity(windows);
        for w in 0..windows {
            let start = w * DECODE_WINDOW;
            let end = ((w + 1) * DECODE_WINDOW).min(frames);
            let part = latent.slice(s![.., .., .., start..end]).to_owned();
            mel_parts.push(self.decode_window(&part, end - start)?);
        }

        let views: Vec<_> = mel_parts.iter().map(|m| m.view()).collect();
        concatenate(Axis(2), &views)
            .map_err(|e| DaemonError::inference(format!("cannot stitch mel windows: {e}")))
    }

    /// Decodes one window, zero-padding up to the fixed size and trimming
    /// the mel output back to `valid_frames` worth of time.
    fn decode_window(&mut self, latent: &Array4<f32>, valid_frames: usize) -> Result<Array3<f32>> {
        let padded;
        let input = if valid_frames < DECODE_WINDOW {
            let mut buffer = Array4::<f32>::zeros((1, LATENT_CHANNELS, LATENT_HEIGHT, DECODE_WINDOW));
            buffer
                .slice_mut(s![.., .., .., ..valid_frames])
                .assign(latent);
            padded = buffer;
            &padded
        } else {
            latent
        };

        let tensor = f32_tensor(
            input.shape().to_vec(),
            input.iter().copied().collect(),
            "latents",
        )?;
        let mut outputs = self
            .session
            .run(ort::inputs!["latents" => tensor.view()])
            .map_err(|e| DaemonError::inference(format!("latent decoder failed: {e}")))?;

        let mel = outputs
            .remove("mel_spectrogram")
            .ok_or_else(|| DaemonError::inference("latent decoder returned no mel_spectrogram"))?;
        let (dims, data) = shape_of(&mel, "mel spectrogram")?;

        // some exports emit (1, 2, bins, time); keep the first channel
        let mel = match dims.len() {
            4 => {
                let channel = dims[2] * dims[3];
                Array3::from_shape_vec((dims[0], dims[2], dims[3]), data[..channel].to_vec())
            }
            3 => Array3::from_shape_vec((dims[0], dims[1], dims[2]), data),
            _ => {
                return Err(DaemonError::inference(format!(
                    "unexpected mel shape {dims:?}"
                )))
            }
        }
        .map_err(|e| DaemonError::inference(format!("cannot reshape mel: {e}")))?;

        if valid_frames < DECODE_WINDOW {
            let time = mel.shape()[2];
            let keep = time * valid_frames / DECODE_WINDOW;
            Ok(mel.slice(s![.., .., ..keep]).to_owned())
        } else {
            Ok(mel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_constants() {
        assert_eq!(MEL_BINS, 128);
        assert_eq!(DECODE_WINDOW, 128);
    }
}
