//! Generation job: one validated request travelling through the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::models::ace_step::SchedulerType;
use crate::models::Backend;

/// Queue priority for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// FIFO order behind other normal jobs.
    #[default]
    Normal,
    /// Inserted ahead of all normal jobs, FIFO among high jobs.
    High,
}

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting in the queue.
    #[default]
    Queued,
    /// Running on the worker.
    Generating,
    /// Finished; the track is in the cache.
    Complete,
    /// The engine errored; a `generation_error` notification was emitted.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Rejected during validation; never entered the queue.
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Rejected
        )
    }
}

/// Shared cooperative-cancellation flag.
///
/// Set by the RPC thread, observed by the engines between decode/diffusion
/// steps. Never interrupts a tensor op in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A validated generation request with its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    /// Fresh id for this submission, distinct from the content-addressed
    /// track id.
    pub job_id: String,

    /// Content address of the artifact this job will produce.
    pub track_id: String,

    /// Prompt text.
    pub prompt: String,

    /// Requested duration in seconds.
    pub duration_sec: u32,

    /// Resolved seed (request seed, or freshly drawn).
    pub seed: u64,

    /// Back-end that will run this job.
    pub backend: Backend,

    /// Queue priority.
    pub priority: JobPriority,

    /// Diffusion step count (ace_step only).
    pub inference_steps: u32,

    /// Scheduler variant (ace_step only).
    pub scheduler: SchedulerType,

    /// Classifier-free guidance scale (ace_step only).
    pub guidance_scale: f32,

    /// Model version string captured at submission time.
    pub model_version: String,

    /// Cooperative cancellation flag shared with the cancel handler.
    pub cancel: CancelFlag,

    /// Submission timestamp.
    pub created_at: SystemTime,
}

impl GenerationJob {
    /// Creates a queued job with a fresh job id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        track_id: String,
        prompt: String,
        duration_sec: u32,
        seed: u64,
        backend: Backend,
        priority: JobPriority,
        inference_steps: u32,
        scheduler: SchedulerType,
        guidance_scale: f32,
        model_version: String,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            track_id,
            prompt,
            duration_sec,
            seed,
            backend,
            priority,
            inference_steps,
            scheduler,
            guidance_scale,
            model_version,
            cancel: CancelFlag::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Total progress units for this job: token frames for the AR back-end,
    /// user-visible scheduler steps for diffusion.
    pub fn total_steps(&self) -> usize {
        match self.backend {
            Backend::MusicGen => self.duration_sec as usize * crate::models::TOKENS_PER_SECOND,
            Backend::AceStep => self.inference_steps as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(backend: Backend) -> GenerationJob {
        GenerationJob::new(
            "abcd1234abcd1234".to_string(),
            "test prompt".to_string(),
            10,
            42,
            backend,
            JobPriority::Normal,
            60,
            SchedulerType::Euler,
            15.0,
            "v1".to_string(),
        )
    }

    #[test]
    fn job_ids_are_unique() {
        let a = job(Backend::MusicGen);
        let b = job(Backend::MusicGen);
        assert_ne!(a.job_id, b.job_id);
        assert_eq!(a.track_id, b.track_id);
    }

    #[test]
    fn total_steps_per_backend() {
        assert_eq!(job(Backend::MusicGen).total_steps(), 500);
        assert_eq!(job(Backend::AceStep).total_steps(), 60);
    }

    #[test]
    fn cancel_flag_is_shared() {
        let j = job(Backend::MusicGen);
        let clone = j.cancel.clone();
        assert!(!j.cancel.is_set());
        clone.set();
        assert!(j.cancel.is_set());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Rejected.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Generating.is_terminal());
    }
}
