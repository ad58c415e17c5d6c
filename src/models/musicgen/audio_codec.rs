//! Neural audio codec decode: 4-codebook token grid to a 32 kHz waveform.

use std::path::Path;

use half::f16;
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

pub struct MusicGenAudioCodec {
    session: Session,
}

impl std::fmt::Debug for MusicGenAudioCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicGenAudioCodec").finish_non_exhaustive()
    }
}

impl MusicGenAudioCodec {
    /// Loads `encodec_decode.onnx` from the asset directory.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let session = load_session(&model_dir.join("encodec_decode.onnx"), providers, threads)?;
        Ok(Self { session })
    }

    /// Decodes aligned token frames into mono f32 samples.
    ///
    /// Frames arrive time-major (`[cb0, cb1, cb2, cb3]` per step); the codec
    /// wants codebook-major layout with shape `(1, 1, 4, steps)`.
    pub fn decode(&mut self, frames: &[[i64; 4]]) -> Result<Vec<f32>> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }

        let steps = frames.len();
        let mut codebook_major = vec![0i64; steps * 4];
        for (t, frame) in frames.iter().enumerate() {
            for (k, &token) in frame.iter().enumerate() {
                codebook_major[k * steps + t] = token;
            }
        }

        let tokens = Tensor::from_array(([1usize, 1, 4, steps], codebook_major))
            .map_err(|e| DaemonError::inference(format!("cannot build token tensor: {e}")))?;

        let mut outputs = self
            .session
            .run(ort::inputs![tokens])
            .map_err(|e| DaemonError::inference(format!("codec decode failed: {e}")))?;

        let audio = outputs
            .remove("audio_values")
            .ok_or_else(|| DaemonError::inference("codec returned no audio_values"))?;

        if let Ok((_, data)) = audio.try_extract_tensor::<f32>() {
            return Ok(data.to_vec());
        }
        if let Ok((_, data)) = audio.try_extract_tensor::<f16>() {
            return Ok(data.iter().map(|&v| f32::from(v)).collect());
        }
        Err(DaemonError::inference("audio_values must be f32 or f16"))
    }
}
