//! Sample-rate conversion.
//!
//! The diffusion vocoder emits 44.1 kHz audio; the daemon's contract is
//! 48 kHz output. Conversion runs through rubato's FFT resampler in fixed
//! input chunks.

use rubato::{FftFixedIn, Resampler};

use crate::error::{DaemonError, Result};

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

/// Resamples a mono signal from `from_rate` to `to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1,
    )
    .map_err(|e| DaemonError::inference(format!("cannot create resampler: {e}")))?;

    let expected_len =
        (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let mut output = Vec::with_capacity(expected_len + CHUNK_SIZE);

    let frames_per_chunk = resampler.input_frames_next();
    let mut position = 0;
    while position < samples.len() {
        let end = (position + frames_per_chunk).min(samples.len());
        let mut chunk = samples[position..end].to_vec();
        // final chunk is zero-padded to the fixed input size
        if chunk.len() < frames_per_chunk {
            chunk.resize(frames_per_chunk, 0.0);
        }

        let resampled = resampler
            .process(&[chunk], None)
            .map_err(|e| DaemonError::inference(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&resampled[0]);
        position += frames_per_chunk;
    }

    // drop the tail introduced by the zero padding
    output.truncate(expected_len);
    Ok(output)
}

/// Vocoder output (44.1 kHz) to the daemon's 48 kHz contract.
pub fn resample_to_48k(samples: &[f32]) -> Result<Vec<f32>> {
    resample(samples, 44100, 48000)
}
