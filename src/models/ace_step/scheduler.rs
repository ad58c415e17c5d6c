//! Flow-matching schedulers for the diffusion loop.
//!
//! Three solvers over the same shifted sigma schedule: Euler (one denoiser
//! call per step), Heun (predictor-corrector, two calls per user step), and
//! PingPong (one call per step plus seeded noise re-injection). All state is
//! per-job; the PingPong noise source is the job's own seeded generator, so
//! the (seed, steps, scheduler) triple fixes the trajectory.

use ndarray::{Array4, Dimension};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Sigma-shift parameter of the flow-matching schedule.
pub const SHIFT: f32 = 3.0;

/// Omega used for mean-shifted updates.
pub const OMEGA: f32 = 10.0;

const NUM_TRAIN_TIMESTEPS: f32 = 1000.0;

/// Solver variant requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerType {
    /// Deterministic ODE, one denoiser call per step.
    #[default]
    Euler,
    /// Deterministic ODE, predictor-corrector, two calls per user step.
    Heun,
    /// Stochastic SDE with seeded noise re-injection.
    PingPong,
}

impl SchedulerType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euler" => Some(SchedulerType::Euler),
            "heun" => Some(SchedulerType::Heun),
            "pingpong" | "ping_pong" | "ping-pong" => Some(SchedulerType::PingPong),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerType::Euler => "euler",
            SchedulerType::Heun => "heun",
            SchedulerType::PingPong => "pingpong",
        }
    }
}

/// One denoising solver. `calls_per_step` denoiser evaluations advance the
/// latent by one user-visible step.
pub trait FlowScheduler {
    /// Timestep fed to the denoiser for the next call (sigma * 1000).
    fn timestep(&self) -> f32;

    /// Current noise level.
    fn sigma(&self) -> f32;

    /// Consumes one denoiser output and returns the advanced latent.
    fn advance(&mut self, latent: &Array4<f32>, model_output: &Array4<f32>) -> Array4<f32>;

    /// Denoiser evaluations per user-visible step (1, or 2 for Heun).
    fn calls_per_step(&self) -> usize {
        1
    }
}

/// Shifted flow-matching schedule.
///
/// Sigmas run from 1.0 towards 0 with `shift * t / (1 + (shift - 1) * t)`
/// applied; a terminal 0.0 is appended. Timesteps are the first
/// `num_steps` sigmas scaled by 1000.
fn build_schedule(num_steps: u32, shift: f32) -> (Vec<f32>, Vec<f32>) {
    let mut sigmas: Vec<f32> = (0..num_steps)
        .map(|i| {
            let t = 1.0 - i as f32 / num_steps as f32;
            shift * t / (1.0 + (shift - 1.0) * t)
        })
        .collect();
    sigmas.push(0.0);

    let timesteps = sigmas
        .iter()
        .take(num_steps as usize)
        .map(|s| s * NUM_TRAIN_TIMESTEPS)
        .collect();
    (sigmas, timesteps)
}

/// Maps omega into a [0.9, 1.1] gain through a logistic curve.
fn omega_gain(omega: f32) -> f32 {
    0.9 + 0.2 / (1.0 + (-0.1 * omega).exp())
}

/// Mean-shifted update: scales the update around its mean by the omega gain.
fn mean_shifted(dx: Array4<f32>, omega: f32) -> Array4<f32> {
    let gain = omega_gain(omega);
    let mean = dx.mean().unwrap_or(0.0);
    dx.mapv(|v| (v - mean) * gain + mean)
}

fn noise_like(reference: &Array4<f32>, rng: &mut ChaCha8Rng) -> Array4<f32> {
    let dim = reference.raw_dim();
    let samples: Vec<f32> = (0..dim.size()).map(|_| StandardNormal.sample(rng)).collect();
    Array4::from_shape_vec(dim, samples).expect("noise buffer matches reference shape")
}

/// Euler ODE solver.
pub struct EulerScheduler {
    sigmas: Vec<f32>,
    timesteps: Vec<f32>,
    omega: f32,
    step: usize,
}

impl EulerScheduler {
    pub fn new(num_steps: u32) -> Self {
        let (sigmas, timesteps) = build_schedule(num_steps, SHIFT);
        Self {
            sigmas,
            timesteps,
            omega: OMEGA,
            step: 0,
        }
    }

    #[cfg(test)]
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }
}

impl FlowScheduler for EulerScheduler {
    fn timestep(&self) -> f32 {
        self.timesteps[self.step]
    }

    fn sigma(&self) -> f32 {
        self.sigmas[self.step]
    }

    fn advance(&mut self, latent: &Array4<f32>, model_output: &Array4<f32>) -> Array4<f32> {
        // dt is negative: sigma decreases towards 0
        let dt = self.sigmas[self.step + 1] - self.sigmas[self.step];
        let dx = mean_shifted(model_output.mapv(|v| v * dt), self.omega);
        self.step += 1;
        latent + &dx
    }
}

/// Heun predictor-corrector. Odd calls predict, even calls correct with the
/// averaged derivative.
pub struct HeunScheduler {
    sigmas: Vec<f32>,
    timesteps: Vec<f32>,
    omega: f32,
    call: usize,
    held: Option<HeunState>,
}

struct HeunState {
    derivative: Array4<f32>,
    dt: f32,
    sample: Array4<f32>,
}

impl HeunScheduler {
    pub fn new(num_steps: u32) -> Self {
        let (base_sigmas, _) = build_schedule(num_steps, SHIFT);

        // interleave interior points: each user step gets a predictor and a
        // corrector call at the same target sigma
        let mut sigmas = Vec::with_capacity(2 * num_steps as usize);
        sigmas.push(base_sigmas[0]);
        for &sigma in &base_sigmas[1..base_sigmas.len() - 1] {
            sigmas.push(sigma);
            sigmas.push(sigma);
        }
        sigmas.push(0.0);

        let mut timesteps = Vec::with_capacity(2 * num_steps as usize - 1);
        timesteps.push(base_sigmas[0] * NUM_TRAIN_TIMESTEPS);
        for &sigma in base_sigmas[1..num_steps as usize].iter() {
            let t = sigma * NUM_TRAIN_TIMESTEPS;
            timesteps.push(t);
            timesteps.push(t);
        }

        Self {
            sigmas,
            timesteps,
            omega: OMEGA,
            call: 0,
            held: None,
        }
    }
}

impl FlowScheduler for HeunScheduler {
    fn timestep(&self) -> f32 {
        self.timesteps[self.call.min(self.timesteps.len() - 1)]
    }

    fn sigma(&self) -> f32 {
        self.sigmas[self.call]
    }

    fn advance(&mut self, latent: &Array4<f32>, model_output: &Array4<f32>) -> Array4<f32> {
        match self.held.take() {
            None => {
                // predictor: first-order step, remember the state for the
                // corrector
                let sigma = self.sigmas[self.call];
                let sigma_next = self.sigmas[self.call + 1];
                let denoised = latent - &model_output.mapv(|v| v * sigma);
                let derivative = (latent - &denoised).mapv(|v| v / sigma);
                let dt = sigma_next - sigma;

                let dx = mean_shifted(derivative.mapv(|v| v * dt), self.omega);
                self.held = Some(HeunState {
                    derivative,
                    dt,
                    sample: latent.clone(),
                });
                self.call += 1;
                latent + &dx
            }
            Some(state) => {
                // corrector: average the derivative at the predicted point
                // with the held one, re-apply from the held sample
                let sigma_next = self.sigmas[self.call];
                let derivative = if sigma_next > 0.0 {
                    let denoised = latent - &model_output.mapv(|v| v * sigma_next);
                    (latent - &denoised).mapv(|v| v / sigma_next)
                } else {
                    Array4::zeros(latent.raw_dim())
                };
                let averaged = (&state.derivative + &derivative).mapv(|v| v * 0.5);
                let dx = mean_shifted(averaged.mapv(|v| v * state.dt), self.omega);
                self.call += 1;
                &state.sample + &dx
            }
        }
    }

    fn calls_per_step(&self) -> usize {
        2
    }
}

/// Stochastic PingPong solver: denoise fully, then re-inject seeded noise at
/// the next sigma level.
pub struct PingPongScheduler {
    sigmas: Vec<f32>,
    timesteps: Vec<f32>,
    step: usize,
    rng: ChaCha8Rng,
}

impl PingPongScheduler {
    /// `rng` is the job's generator, already advanced past latent
    /// initialization.
    pub fn new(num_steps: u32, rng: ChaCha8Rng) -> Self {
        let (sigmas, timesteps) = build_schedule(num_steps, SHIFT);
        Self {
            sigmas,
            timesteps,
            step: 0,
            rng,
        }
    }
}

impl FlowScheduler for PingPongScheduler {
    fn timestep(&self) -> f32 {
        self.timesteps[self.step]
    }

    fn sigma(&self) -> f32 {
        self.sigmas[self.step]
    }

    fn advance(&mut self, latent: &Array4<f32>, model_output: &Array4<f32>) -> Array4<f32> {
        let sigma = self.sigmas[self.step];
        let sigma_next = self.sigmas[self.step + 1];

        let denoised = latent - &model_output.mapv(|v| v * sigma);
        let noise = noise_like(latent, &mut self.rng);

        self.step += 1;
        denoised.mapv(|v| v * (1.0 - sigma_next)) + noise.mapv(|v| v * sigma_next)
    }
}

/// Builds the requested solver. The generator is consumed only by PingPong.
pub fn create_scheduler(
    kind: SchedulerType,
    num_steps: u32,
    rng: ChaCha8Rng,
) -> Box<dyn FlowScheduler + Send> {
    match kind {
        SchedulerType::Euler => Box::new(EulerScheduler::new(num_steps)),
        SchedulerType::Heun => Box::new(HeunScheduler::new(num_steps)),
        SchedulerType::PingPong => Box::new(PingPongScheduler::new(num_steps, rng)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }

    #[test]
    fn scheduler_type_parsing() {
        assert_eq!(SchedulerType::parse("euler"), Some(SchedulerType::Euler));
        assert_eq!(SchedulerType::parse("Heun"), Some(SchedulerType::Heun));
        assert_eq!(SchedulerType::parse("pingpong"), Some(SchedulerType::PingPong));
        assert_eq!(SchedulerType::parse("ping-pong"), Some(SchedulerType::PingPong));
        assert_eq!(SchedulerType::parse("ddim"), None);
    }

    #[test]
    fn schedule_shape_and_monotonicity() {
        let (sigmas, timesteps) = build_schedule(60, SHIFT);
        assert_eq!(sigmas.len(), 61);
        assert_eq!(timesteps.len(), 60);
        assert!((sigmas[0] - 1.0).abs() < 1e-3);
        assert_eq!(*sigmas.last().unwrap(), 0.0);
        for pair in sigmas.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(timesteps[0] > 900.0);
    }

    #[test]
    fn euler_advances_one_step_per_call() {
        let mut scheduler = EulerScheduler::new(10);
        let latent = Array4::zeros((1, 8, 16, 20));
        let output = Array4::ones((1, 8, 16, 20));

        let t0 = scheduler.timestep();
        let _ = scheduler.advance(&latent, &output);
        assert!(scheduler.timestep() < t0);
        assert_eq!(scheduler.calls_per_step(), 1);
    }

    #[test]
    fn euler_step_moves_latent_towards_output_direction() {
        let mut scheduler = EulerScheduler::new(10);
        let latent = Array4::zeros((1, 8, 16, 4));
        let output = Array4::ones((1, 8, 16, 4));
        let next = scheduler.advance(&latent, &output);
        // dt < 0, so a positive velocity lowers the latent
        assert!(next.iter().all(|&v| v < 0.0));
    }

    #[test]
    fn heun_needs_two_calls_per_step() {
        let mut scheduler = HeunScheduler::new(10);
        assert_eq!(scheduler.calls_per_step(), 2);

        let latent = Array4::ones((1, 8, 16, 4));
        let output = Array4::ones((1, 8, 16, 4));

        let predicted = scheduler.advance(&latent, &output);
        assert!(scheduler.held.is_some());
        let _ = scheduler.advance(&predicted, &output);
        assert!(scheduler.held.is_none());
    }

    #[test]
    fn pingpong_same_seed_same_trajectory() {
        let latent = Array4::ones((1, 8, 16, 8));
        let output = Array4::ones((1, 8, 16, 8));

        let mut a = PingPongScheduler::new(10, rng(42));
        let mut b = PingPongScheduler::new(10, rng(42));
        assert_eq!(a.advance(&latent, &output), b.advance(&latent, &output));
    }

    #[test]
    fn pingpong_different_seed_diverges() {
        let latent = Array4::ones((1, 8, 16, 8));
        let output = Array4::ones((1, 8, 16, 8));

        let mut a = PingPongScheduler::new(10, rng(42));
        let mut b = PingPongScheduler::new(10, rng(43));
        assert_ne!(a.advance(&latent, &output), b.advance(&latent, &output));
    }

    #[test]
    fn omega_gain_stays_bounded() {
        assert!((omega_gain(0.0) - 1.0).abs() < 1e-3);
        assert!(omega_gain(1000.0) <= 1.1);
        assert!(omega_gain(-1000.0) >= 0.9);
    }

    #[test]
    fn factory_respects_kind() {
        let s = create_scheduler(SchedulerType::Heun, 10, rng(1));
        assert_eq!(s.calls_per_step(), 2);
        let s = create_scheduler(SchedulerType::Euler, 10, rng(1));
        assert_eq!(s.calls_per_step(), 1);
    }
}
