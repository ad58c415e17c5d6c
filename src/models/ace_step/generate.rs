//! The diffusion generation loop.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::error::{DaemonError, Result};
use crate::models::backend::GenerateSpec;
use crate::types::CancelFlag;

use super::guidance::apply_cfg;
use super::latent::{frame_length, init_latent};
use super::scheduler::create_scheduler;
use super::AceStepModels;

/// Runs the full diffusion pipeline for one job. Returns mono samples at
/// the vocoder's native 44.1 kHz.
///
/// `on_progress(step, total)` fires after every user-visible scheduler step.
/// The cancel flag is polled at the same boundary; the denoiser call in
/// flight is never interrupted.
pub fn generate(
    models: &mut AceStepModels,
    spec: &GenerateSpec,
    cancel: &CancelFlag,
    on_progress: &dyn Fn(usize, usize),
) -> Result<Vec<f32>> {
    let total_steps = spec.inference_steps as usize;

    debug!(
        duration = spec.duration_sec,
        steps = total_steps,
        scheduler = spec.scheduler.as_str(),
        guidance = spec.guidance_scale,
        "starting diffusion"
    );

    // Conditioning runs once; both guidance branches are reused for every
    // denoiser call.
    let (text_states, text_mask) = models.text_encoder.encode(&spec.prompt)?;
    let cond = models.transformer.encode_context(&text_states, &text_mask)?;

    let (empty_states, empty_mask) = models.text_encoder.encode("")?;
    let uncond = models.transformer.encode_context(&empty_states, &empty_mask)?;

    // One generator drives latent init and, for PingPong, the re-injected
    // noise, so the seed fixes the full trajectory.
    let frames = frame_length(spec.duration_sec as f32);
    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
    let mut latent = init_latent(frames, &mut rng);
    let mut scheduler = create_scheduler(spec.scheduler, spec.inference_steps, rng);

    for step in 0..total_steps {
        if cancel.is_set() {
            return Err(DaemonError::cancelled());
        }

        for _ in 0..scheduler.calls_per_step() {
            let timestep = scheduler.timestep();
            let cond_velocity = models.transformer.predict(&latent, timestep, &cond)?;
            let uncond_velocity = models.transformer.predict(&latent, timestep, &uncond)?;
            let guided = apply_cfg(&cond_velocity, &uncond_velocity, spec.guidance_scale);
            latent = scheduler.advance(&latent, &guided);
        }

        on_progress(step + 1, total_steps);
    }

    let mel = models.decoder.decode(&latent)?;
    debug!(mel_shape = ?mel.shape(), "vocoding");
    models.vocoder.synthesize(&mel)
}
