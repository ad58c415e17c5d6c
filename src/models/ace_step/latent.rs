//! Latent-tensor setup for the diffusion loop.

use ndarray::Array4;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Channels in the latent space.
pub const LATENT_CHANNELS: usize = 8;

/// Height of the latent grid.
pub const LATENT_HEIGHT: usize = 16;

/// Vocoder-native sample rate the frame math is defined against.
pub const NATIVE_SAMPLE_RATE: f32 = 44100.0;

/// Audio samples per latent frame: 512-sample mel hop through the 8x DCAE
/// compression.
pub const SAMPLES_PER_FRAME: f32 = 512.0 * 8.0;

/// Latent frames needed for a duration: `duration * 44100 / 4096`, at least
/// one frame.
pub fn frame_length(duration_sec: f32) -> usize {
    ((duration_sec * NATIVE_SAMPLE_RATE / SAMPLES_PER_FRAME).ceil() as usize).max(1)
}

/// Audio duration a latent of `frames` decodes to.
pub fn frames_to_duration(frames: usize) -> f32 {
    frames as f32 * SAMPLES_PER_FRAME / NATIVE_SAMPLE_RATE
}

/// Initializes a `(1, 8, 16, frames)` latent with standard-normal noise from
/// the job's generator. Flow matching starts from unscaled noise, so no
/// sigma multiplier is applied here.
pub fn init_latent(frames: usize, rng: &mut ChaCha8Rng) -> Array4<f32> {
    let shape = (1, LATENT_CHANNELS, LATENT_HEIGHT, frames);
    let count = LATENT_CHANNELS * LATENT_HEIGHT * frames;
    let noise: Vec<f32> = (0..count).map(|_| StandardNormal.sample(rng)).collect();
    Array4::from_shape_vec(shape, noise).expect("noise buffer matches latent shape")
}
