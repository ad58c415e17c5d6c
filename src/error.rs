//! Error types shared across the daemon.
//!
//! Every failure the daemon can surface over RPC carries a stable string code
//! plus a numeric JSON-RPC code, so clients can branch without parsing
//! messages.

use std::fmt;

/// Stable error codes surfaced in RPC error objects and
/// `generation_error` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Required ONNX model files are missing from the asset directory.
    ModelNotFound,
    /// A model file exists but could not be loaded into a session.
    ModelLoadFailed,
    /// Asset fetch failed (network error, disk full, bad status).
    ModelDownloadFailed,
    /// Inference produced an error mid-generation.
    ModelInferenceFailed,
    /// The job queue is at its admission bound.
    QueueFull,
    /// Duration outside the selected back-end's range.
    InvalidDuration,
    /// Prompt empty or over the length limit.
    InvalidPrompt,
    /// Unknown back-end selector in the request.
    InvalidBackend,
    /// Back-end selected but its assets are not on disk.
    BackendNotInstalled,
    /// Back-end selected while its sessions are still loading.
    BackendLoading,
    /// Diffusion step count outside 1-200.
    InvalidInferenceSteps,
    /// Guidance scale outside 1.0-30.0.
    InvalidGuidanceScale,
    /// Scheduler name is not euler, heun, or pingpong.
    InvalidScheduler,
    /// Cancel referenced a track id the daemon has never seen.
    TrackNotFound,
    /// Cancel referenced a job that already reached a terminal state.
    AlreadyComplete,
    /// A download for this back-end is already running.
    DownloadInProgress,
    /// Terminal state for a cancelled job.
    Cancelled,
}

impl ErrorCode {
    /// String form used in RPC error data and notifications.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::ModelDownloadFailed => "MODEL_DOWNLOAD_FAILED",
            ErrorCode::ModelInferenceFailed => "MODEL_INFERENCE_FAILED",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::InvalidDuration => "INVALID_DURATION",
            ErrorCode::InvalidPrompt => "INVALID_PROMPT",
            ErrorCode::InvalidBackend => "INVALID_BACKEND",
            ErrorCode::BackendNotInstalled => "BACKEND_NOT_INSTALLED",
            ErrorCode::BackendLoading => "BACKEND_LOADING",
            ErrorCode::InvalidInferenceSteps => "INVALID_INFERENCE_STEPS",
            ErrorCode::InvalidGuidanceScale => "INVALID_GUIDANCE_SCALE",
            ErrorCode::InvalidScheduler => "INVALID_SCHEDULER",
            ErrorCode::TrackNotFound => "TRACK_NOT_FOUND",
            ErrorCode::AlreadyComplete => "ALREADY_COMPLETE",
            ErrorCode::DownloadInProgress => "DOWNLOAD_IN_PROGRESS",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }

    /// Numeric JSON-RPC code. Application codes live in the -32000 block,
    /// below the range reserved by the JSON-RPC 2.0 spec itself.
    pub fn as_rpc_code(&self) -> i32 {
        match self {
            ErrorCode::ModelNotFound => -32000,
            ErrorCode::ModelLoadFailed => -32001,
            ErrorCode::ModelDownloadFailed => -32002,
            ErrorCode::ModelInferenceFailed => -32003,
            ErrorCode::QueueFull => -32004,
            ErrorCode::InvalidDuration => -32005,
            ErrorCode::InvalidPrompt => -32006,
            ErrorCode::InvalidBackend => -32007,
            ErrorCode::BackendNotInstalled => -32008,
            ErrorCode::BackendLoading => -32009,
            ErrorCode::InvalidInferenceSteps => -32010,
            ErrorCode::InvalidGuidanceScale => -32011,
            ErrorCode::InvalidScheduler => -32012,
            ErrorCode::TrackNotFound => -32013,
            ErrorCode::AlreadyComplete => -32014,
            ErrorCode::DownloadInProgress => -32015,
            ErrorCode::Cancelled => -32016,
        }
    }

    /// Short hint logged alongside the error for operators.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::ModelNotFound | ErrorCode::BackendNotInstalled => {
                "run download_backend (or the daemon with network access) to fetch the model assets"
            }
            ErrorCode::ModelLoadFailed => {
                "check free memory and that the asset files are not truncated; re-download if needed"
            }
            ErrorCode::ModelDownloadFailed => {
                "check network connectivity and disk space, then retry download_backend"
            }
            ErrorCode::ModelInferenceFailed => {
                "try a shorter duration or CPU execution; restart the daemon if the provider wedged"
            }
            ErrorCode::QueueFull => "wait for queued generations to finish before submitting more",
            _ => "see the request validation table in the protocol documentation",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type used throughout the daemon.
#[derive(Debug, Clone)]
pub struct DaemonError {
    /// Which stable code this error maps to.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional extra context (path, parameter value, step count).
    pub context: Option<String>,
}

impl DaemonError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(
        code: ErrorCode,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            context: Some(context.into()),
        }
    }

    pub fn model_not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelNotFound, detail)
    }

    pub fn model_load_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelLoadFailed, detail)
    }

    pub fn model_download_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelDownloadFailed, detail)
    }

    pub fn inference(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::ModelInferenceFailed, detail)
    }

    pub fn queue_full(limit: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            format!("generation queue is full ({limit} pending jobs)"),
        )
    }

    pub fn invalid_duration(duration: u32, min: u32, max: u32) -> Self {
        Self::with_context(
            ErrorCode::InvalidDuration,
            format!("duration must be {min}-{max} seconds, got {duration}"),
            duration.to_string(),
        )
    }

    pub fn invalid_prompt(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidPrompt, reason)
    }

    pub fn invalid_backend(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::with_context(
            ErrorCode::InvalidBackend,
            format!("unknown backend \"{name}\""),
            name,
        )
    }

    pub fn backend_not_installed(name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::BackendNotInstalled,
            format!("backend \"{}\" has no model assets installed", name.into()),
        )
    }

    pub fn track_not_found(track_id: impl Into<String>) -> Self {
        let track_id = track_id.into();
        Self::with_context(
            ErrorCode::TrackNotFound,
            format!("no job or track with id {track_id}"),
            track_id,
        )
    }

    pub fn already_complete(track_id: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::AlreadyComplete,
            format!("job {} already reached a terminal state", track_id.into()),
        )
    }

    pub fn download_in_progress(name: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::DownloadInProgress,
            format!(
                "a download for backend \"{}\" is already running",
                name.into()
            ),
        )
    }

    /// Cancellation observed at a step boundary inside an engine.
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "generation cancelled")
    }

    /// Returns true if this error is the cooperative-cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({ctx})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DaemonError {}

/// Result alias used crate-wide.
pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_are_unique() {
        let codes = [
            ErrorCode::ModelNotFound,
            ErrorCode::ModelLoadFailed,
            ErrorCode::ModelDownloadFailed,
            ErrorCode::ModelInferenceFailed,
            ErrorCode::QueueFull,
            ErrorCode::InvalidDuration,
            ErrorCode::InvalidPrompt,
            ErrorCode::InvalidBackend,
            ErrorCode::BackendNotInstalled,
            ErrorCode::BackendLoading,
            ErrorCode::InvalidInferenceSteps,
            ErrorCode::InvalidGuidanceScale,
            ErrorCode::InvalidScheduler,
            ErrorCode::TrackNotFound,
            ErrorCode::AlreadyComplete,
            ErrorCode::DownloadInProgress,
            ErrorCode::Cancelled,
        ];
        let mut numeric: Vec<i32> = codes.iter().map(|c| c.as_rpc_code()).collect();
        numeric.sort_unstable();
        numeric.dedup();
        assert_eq!(numeric.len(), codes.len());
    }

    #[test]
    fn display_includes_code_and_context() {
        let err = DaemonError::invalid_duration(3, 5, 120);
        let text = err.to_string();
        assert!(text.contains("INVALID_DURATION"));
        assert!(text.contains("got 3"));
    }

    #[test]
    fn cancelled_marker() {
        assert!(DaemonError::cancelled().is_cancelled());
        assert!(!DaemonError::queue_full(10).is_cancelled());
    }
}
