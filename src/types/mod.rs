//! Core domain types: tracks, jobs, and model architecture records.

pub mod job;
pub mod model_config;
pub mod track;

pub use job::{CancelFlag, GenerationJob, JobPriority, JobStatus};
pub use model_config::ModelConfig;
pub use track::{compute_track_id, Track};
