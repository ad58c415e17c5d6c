//! Wire types for the line-delimited JSON-RPC 2.0 protocol.

use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::models::ace_step::{validate_guidance_scale, SchedulerType};
use crate::models::Backend;
use crate::types::JobPriority;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: integer or string per the JSON-RPC spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

/// An inbound message. Messages without an `id` are notifications.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Successful response envelope.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse<T: Serialize> {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub result: T,
}

impl<T: Serialize> JsonRpcResponse<T> {
    pub fn new(id: RequestId, result: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
        }
    }
}

/// Error response envelope.
#[derive(Debug, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn new(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error,
        }
    }
}

/// JSON-RPC error object with the daemon's stable string code attached.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonRpcErrorData>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcErrorData {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl JsonRpcError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

impl From<DaemonError> for JsonRpcError {
    fn from(err: DaemonError) -> Self {
        Self {
            code: err.code.as_rpc_code(),
            message: err.message,
            data: Some(JsonRpcErrorData {
                error_code: err.code.as_str().to_string(),
                details: err.context,
            }),
        }
    }
}

/// Notification envelope (no id).
#[derive(Debug, Serialize)]
pub struct JsonRpcNotification<T: Serialize> {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: T,
}

impl<T: Serialize> JsonRpcNotification<T> {
    pub fn new(method: &'static str, params: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// generate
// ---------------------------------------------------------------------------

fn default_duration() -> u32 {
    30
}

/// Parameters of the `generate` method.
#[derive(Debug, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,

    #[serde(default = "default_duration")]
    pub duration_sec: u32,

    /// Back-end selector; the configured default applies when absent.
    #[serde(default)]
    pub backend: Option<String>,

    /// Seed; drawn randomly when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub priority: JobPriority,

    /// Diffusion only: step count (1-200).
    #[serde(default)]
    pub inference_steps: Option<u32>,

    /// Diffusion only: euler, heun, or pingpong.
    #[serde(default)]
    pub scheduler: Option<String>,

    /// Diffusion only: guidance scale (1.0-30.0).
    #[serde(default)]
    pub guidance_scale: Option<f32>,
}

impl GenerateParams {
    /// Resolves the back-end selector, falling back to the configured
    /// default.
    pub fn resolve_backend(&self, default: Backend) -> Result<Backend, DaemonError> {
        match &self.backend {
            None => Ok(default),
            Some(name) => Backend::parse(name).ok_or_else(|| DaemonError::invalid_backend(name)),
        }
    }

    /// Validates every field against the selected back-end's table.
    /// Diffusion-only fields are ignored for the AR back-end.
    pub fn validate(&self, backend: Backend) -> Result<(), DaemonError> {
        if self.prompt.is_empty() {
            return Err(DaemonError::invalid_prompt("prompt must not be empty"));
        }
        let chars = self.prompt.chars().count();
        let limit = backend.max_prompt_chars();
        if chars > limit {
            return Err(DaemonError::invalid_prompt(format!(
                "prompt is {chars} characters, limit for {backend} is {limit}"
            )));
        }

        let (min, max) = (backend.min_duration_sec(), backend.max_duration_sec());
        if !(min..=max).contains(&self.duration_sec) {
            return Err(DaemonError::invalid_duration(self.duration_sec, min, max));
        }

        if backend == Backend::AceStep {
            if let Some(steps) = self.inference_steps {
                if !(1..=200).contains(&steps) {
                    return Err(DaemonError::new(
                        crate::error::ErrorCode::InvalidInferenceSteps,
                        format!("inference_steps must be 1-200, got {steps}"),
                    ));
                }
            }
            if let Some(scale) = self.guidance_scale {
                if let Some(reason) = validate_guidance_scale(scale) {
                    return Err(DaemonError::new(
                        crate::error::ErrorCode::InvalidGuidanceScale,
                        reason,
                    ));
                }
            }
            if let Some(name) = &self.scheduler {
                if SchedulerType::parse(name).is_none() {
                    return Err(DaemonError::new(
                        crate::error::ErrorCode::InvalidScheduler,
                        format!("scheduler must be euler, heun, or pingpong, got \"{name}\""),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Immediate status in the `generate` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Cached,
    Queued,
    Generating,
}

#[derive(Debug, Serialize)]
pub struct GenerateResult {
    pub track_id: String,
    pub status: RequestStatus,
    pub position: usize,
    pub seed: u64,
    pub backend: String,
}

// ---------------------------------------------------------------------------
// cancel / get_backends / download_backend / ping / shutdown
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub track_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResult {
    pub cancelled: bool,
    pub was_generating: bool,
}

#[derive(Debug, Serialize)]
pub struct BackendInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub status: String,
    pub min_duration_sec: u32,
    pub max_duration_sec: u32,
    pub sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GetBackendsResult {
    pub backends: Vec<BackendInfo>,
    pub default_backend: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadBackendParams {
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadBackendResult {
    pub started: bool,
    pub already_installed: bool,
}

#[derive(Debug, Serialize)]
pub struct PingResult {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ShutdownResult {
    pub status: &'static str,
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GenerationProgressParams {
    pub track_id: String,
    pub percent: u8,
    pub current_step: usize,
    pub total_steps: usize,
    pub eta_sec: f32,
}

#[derive(Debug, Serialize)]
pub struct GenerationCompleteParams {
    pub track_id: String,
    pub path: String,
    pub duration_sec: f32,
    pub sample_rate: u32,
    pub generation_time_sec: f32,
    pub backend: String,
    pub model_version: String,
}

#[derive(Debug, Serialize)]
pub struct GenerationErrorParams {
    pub track_id: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct GenerationCancelledParams {
    pub track_id: String,
    pub at_step: usize,
    pub total_steps: usize,
}

#[derive(Debug, Serialize)]
pub struct DownloadProgressParams {
    pub backend: String,
    pub component: String,
    pub component_percent: u8,
    pub overall_percent: u8,
    pub bytes_downloaded: u64,
    pub bytes_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(prompt: &str, duration: u32) -> GenerateParams {
        GenerateParams {
            prompt: prompt.to_string(),
            duration_sec: duration,
            backend: None,
            seed: None,
            priority: JobPriority::Normal,
            inference_steps: None,
            scheduler: None,
            guidance_scale: None,
        }
    }

    #[test]
    fn request_without_id_is_notification() {
        let raw = r#"{"jsonrpc":"2.0","method":"generate","params":{}}"#;
        let req: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn request_status_serializes_capitalized() {
        assert_eq!(serde_json::to_string(&RequestStatus::Cached).unwrap(), "\"Cached\"");
        assert_eq!(serde_json::to_string(&RequestStatus::Queued).unwrap(), "\"Queued\"");
        assert_eq!(
            serde_json::to_string(&RequestStatus::Generating).unwrap(),
            "\"Generating\""
        );
    }

    #[test]
    fn backend_info_uses_type_key() {
        let info = BackendInfo {
            kind: "musicgen".to_string(),
            name: "MusicGen".to_string(),
            status: "ready".to_string(),
            min_duration_sec: 5,
            max_duration_sec: 120,
            sample_rate: 32000,
            model_version: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["type"], "musicgen");
        assert!(json.get("model_version").is_none());
    }

    #[test]
    fn duration_boundaries_per_backend() {
        for (duration, ok) in [(4, false), (5, true), (120, true), (121, false)] {
            assert_eq!(
                params("x", duration).validate(Backend::MusicGen).is_ok(),
                ok,
                "musicgen duration {duration}"
            );
        }
        for (duration, ok) in [(4, false), (5, true), (240, true), (241, false)] {
            assert_eq!(
                params("x", duration).validate(Backend::AceStep).is_ok(),
                ok,
                "ace_step duration {duration}"
            );
        }
    }

    #[test]
    fn prompt_boundaries_per_backend() {
        assert!(params("", 30).validate(Backend::MusicGen).is_err());
        assert!(params(&"x".repeat(1000), 30).validate(Backend::MusicGen).is_ok());
        assert!(params(&"x".repeat(1001), 30).validate(Backend::MusicGen).is_err());
        assert!(params(&"x".repeat(512), 30).validate(Backend::AceStep).is_ok());
        assert!(params(&"x".repeat(513), 30).validate(Backend::AceStep).is_err());
    }

    #[test]
    fn prompt_limit_counts_chars_not_bytes() {
        // 400 three-byte chars: over 1000 bytes, under 1000 chars
        let prompt = "音".repeat(400);
        assert!(params(&prompt, 30).validate(Backend::MusicGen).is_ok());
    }

    #[test]
    fn inference_step_boundaries() {
        for (steps, ok) in [(0u32, false), (1, true), (200, true), (201, false)] {
            let mut p = params("x", 30);
            p.inference_steps = Some(steps);
            assert_eq!(p.validate(Backend::AceStep).is_ok(), ok, "steps {steps}");
        }
    }

    #[test]
    fn diffusion_fields_ignored_on_musicgen() {
        let mut p = params("x", 30);
        p.inference_steps = Some(0);
        p.guidance_scale = Some(99.0);
        p.scheduler = Some("bogus".to_string());
        assert!(p.validate(Backend::MusicGen).is_ok());
    }

    #[test]
    fn guidance_and_scheduler_validation() {
        let mut p = params("x", 30);
        p.guidance_scale = Some(0.5);
        assert!(p.validate(Backend::AceStep).is_err());

        let mut p = params("x", 30);
        p.scheduler = Some("pingpong".to_string());
        assert!(p.validate(Backend::AceStep).is_ok());
        p.scheduler = Some("ddim".to_string());
        assert!(p.validate(Backend::AceStep).is_err());
    }

    #[test]
    fn resolve_backend_falls_back_to_default() {
        let p = params("x", 30);
        assert_eq!(p.resolve_backend(Backend::AceStep).unwrap(), Backend::AceStep);

        let mut p = params("x", 30);
        p.backend = Some("musicgen".to_string());
        assert_eq!(p.resolve_backend(Backend::AceStep).unwrap(), Backend::MusicGen);

        let mut p = params("x", 30);
        p.backend = Some("riffusion".to_string());
        assert!(p.resolve_backend(Backend::AceStep).is_err());
    }

    #[test]
    fn daemon_error_converts_with_stable_code() {
        let rpc: JsonRpcError = DaemonError::queue_full(10).into();
        assert_eq!(rpc.code, -32004);
        assert_eq!(rpc.data.unwrap().error_code, "QUEUE_FULL");
    }
}
