//! Method handlers.
//!
//! Validation failures are synchronous RPC errors; once a job is admitted,
//! later failures travel as notifications carrying the same track id. The
//! `generate` response is always enqueued to the writer before the job is
//! handed to the queue, so a client never sees a notification for an id it
//! has not been given.

use tracing::{error, info};

use crate::error::DaemonError;
use crate::models::ace_step::SchedulerType;
use crate::models::{
    backend_version, fetch_backend_assets, is_installed, Backend, BackendStatus,
};
use crate::types::{compute_track_id, GenerationJob, JobStatus, Track};

use super::server::ServerState;
use super::types::{
    BackendInfo, CancelParams, CancelResult, DownloadBackendParams, DownloadBackendResult,
    DownloadProgressParams, GenerateParams, GenerateResult, GenerationCancelledParams,
    GenerationCompleteParams, GetBackendsResult, JsonRpcError, PingResult, RequestId,
    RequestStatus, ShutdownResult,
};

/// Routes one request and emits its response.
pub fn dispatch(method: &str, params: serde_json::Value, id: RequestId, state: &ServerState) {
    // generate controls its own emission order (response, then possibly a
    // replayed completion notification)
    if method == "generate" {
        handle_generate(params, id, state);
        return;
    }

    let result = match method {
        "cancel" => handle_cancel(params, state),
        "get_backends" => handle_get_backends(state),
        "download_backend" => handle_download_backend(params, state),
        "ping" => handle_ping(),
        "shutdown" => handle_shutdown(state),
        _ => Err(JsonRpcError::method_not_found(method)),
    };

    match result {
        Ok(value) => state.outbound.respond(id, value),
        Err(error) => state.outbound.respond_error(Some(id), error),
    }
}

fn handle_ping() -> Result<serde_json::Value, JsonRpcError> {
    to_value(PingResult {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn handle_shutdown(state: &ServerState) -> Result<serde_json::Value, JsonRpcError> {
    info!("shutdown requested over RPC");
    state.request_shutdown();
    to_value(ShutdownResult {
        status: "shutting_down",
    })
}

fn handle_generate(params: serde_json::Value, id: RequestId, state: &ServerState) {
    match prepare_generate(params, state) {
        Ok(Prepared::Cached { result, replay }) => {
            state.outbound.respond(id, result);
            state.outbound.notify("generation_complete", replay);
        }
        Ok(Prepared::Admitted { result, job }) => {
            // response first; the queue submit below is what lets the worker
            // produce notifications for this id
            state.outbound.respond(id, result);
            state.table.insert_queued(&job.track_id, job.cancel.clone());
            let track_id = job.track_id.clone();
            if let Err(e) = state.queue.submit(*job) {
                // cannot happen while this thread is the only submitter, but
                // the client still deserves a terminal event
                error!(%track_id, "admission race: {e}");
                state.outbound.notify(
                    "generation_error",
                    super::types::GenerationErrorParams {
                        track_id: track_id.clone(),
                        code: e.code.as_str().to_string(),
                        message: e.message,
                    },
                );
                state.table.set_status(&track_id, JobStatus::Failed);
            }
        }
        Ok(Prepared::Duplicate { result }) => {
            state.outbound.respond(id, result);
        }
        Err(error) => state.outbound.respond_error(Some(id), error),
    }
}

enum Prepared {
    /// The content address is already cached; replay its completion.
    Cached {
        result: GenerateResult,
        replay: GenerationCompleteParams,
    },
    /// The same tuple is already queued or generating; no new job.
    Duplicate { result: GenerateResult },
    /// A fresh job to admit.
    Admitted {
        result: GenerateResult,
        job: Box<GenerationJob>,
    },
}

fn prepare_generate(
    params: serde_json::Value,
    state: &ServerState,
) -> Result<Prepared, JsonRpcError> {
    let params: GenerateParams = serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("invalid params: {e}")))?;

    let backend = params.resolve_backend(state.config.default_backend)?;
    params.validate(backend)?;

    let model_dir = state.config.model_dir(backend);
    if !is_installed(backend, &model_dir) {
        let err = match state.backend_states.get(backend) {
            Some(BackendStatus::Downloading) => DaemonError::download_in_progress(backend.as_str()),
            _ => DaemonError::backend_not_installed(backend.as_str()),
        };
        return Err(err.into());
    }

    let seed = params.seed.unwrap_or_else(rand::random);
    let model_version = backend_version(backend, &model_dir);
    let track_id = compute_track_id(
        &params.prompt,
        seed,
        params.duration_sec,
        &model_version,
        backend,
    );

    if let Some(track) = state.store.lock().expect("store lock poisoned").get(&track_id) {
        return Ok(Prepared::Cached {
            result: GenerateResult {
                track_id: track.track_id.clone(),
                status: RequestStatus::Cached,
                position: 0,
                seed,
                backend: backend.as_str().to_string(),
            },
            replay: replay_completion(&track),
        });
    }

    // a second request for an in-flight tuple attaches to the existing job
    match state.table.status(&track_id) {
        Some(JobStatus::Queued) => {
            return Ok(Prepared::Duplicate {
                result: GenerateResult {
                    track_id: track_id.clone(),
                    status: RequestStatus::Queued,
                    position: state.queue.position_of(&track_id).unwrap_or(0),
                    seed,
                    backend: backend.as_str().to_string(),
                },
            });
        }
        Some(JobStatus::Generating) => {
            return Ok(Prepared::Duplicate {
                result: GenerateResult {
                    track_id,
                    status: RequestStatus::Generating,
                    position: 0,
                    seed,
                    backend: backend.as_str().to_string(),
                },
            });
        }
        _ => {}
    }

    if state.queue.is_full() {
        return Err(DaemonError::queue_full(state.queue.limit()).into());
    }

    let scheduler = params
        .scheduler
        .as_deref()
        .and_then(SchedulerType::parse)
        .or_else(|| SchedulerType::parse(&state.config.ace_step_default_scheduler))
        .unwrap_or_default();
    let job = GenerationJob::new(
        track_id.clone(),
        params.prompt.clone(),
        params.duration_sec,
        seed,
        backend,
        params.priority,
        params
            .inference_steps
            .unwrap_or(state.config.ace_step_default_steps),
        scheduler,
        params
            .guidance_scale
            .unwrap_or(state.config.ace_step_default_guidance),
        model_version,
    );

    // the single worker picks an empty queue's head up immediately
    let starts_now = !state.table.worker_busy() && state.queue.is_empty();
    let position = if starts_now {
        0
    } else {
        state.queue.len()
    };

    Ok(Prepared::Admitted {
        result: GenerateResult {
            track_id,
            status: if starts_now {
                RequestStatus::Generating
            } else {
                RequestStatus::Queued
            },
            position,
            seed,
            backend: backend.as_str().to_string(),
        },
        job: Box::new(job),
    })
}

fn replay_completion(track: &Track) -> GenerationCompleteParams {
    GenerationCompleteParams {
        track_id: track.track_id.clone(),
        path: track.path.to_string_lossy().into_owned(),
        duration_sec: track.duration_sec,
        sample_rate: track.sample_rate,
        generation_time_sec: 0.0,
        backend: track.backend.as_str().to_string(),
        model_version: track.model_version.clone(),
    }
}

fn handle_cancel(
    params: serde_json::Value,
    state: &ServerState,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: CancelParams = serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("invalid params: {e}")))?;
    let track_id = &params.track_id;

    let status = state
        .table
        .status(track_id)
        .ok_or_else(|| JsonRpcError::from(DaemonError::track_not_found(track_id)))?;

    match status {
        JobStatus::Queued => {
            if let Some(job) = state.queue.remove(track_id) {
                state.table.set_status(track_id, JobStatus::Cancelled);
                info!(%track_id, "cancelled while queued");
                state.outbound.notify(
                    "generation_cancelled",
                    GenerationCancelledParams {
                        track_id: track_id.clone(),
                        at_step: 0,
                        total_steps: job.total_steps(),
                    },
                );
                to_value(CancelResult {
                    cancelled: true,
                    was_generating: false,
                })
            } else {
                // the worker grabbed it between the status read and the
                // remove; fall back to the cooperative flag
                flag_active_job(state, track_id)
            }
        }
        JobStatus::Generating => flag_active_job(state, track_id),
        _ => Err(DaemonError::already_complete(track_id).into()),
    }
}

fn flag_active_job(
    state: &ServerState,
    track_id: &str,
) -> Result<serde_json::Value, JsonRpcError> {
    match state.table.cancel_flag(track_id) {
        Some(flag) => {
            flag.set();
            info!(%track_id, "cancellation flagged for active job");
            to_value(CancelResult {
                cancelled: true,
                was_generating: true,
            })
        }
        None => Err(DaemonError::track_not_found(track_id).into()),
    }
}

fn handle_get_backends(state: &ServerState) -> Result<serde_json::Value, JsonRpcError> {
    let backends = Backend::all()
        .iter()
        .map(|&backend| {
            let dir = state.config.model_dir(backend);
            let installed = is_installed(backend, &dir);
            let status = state.backend_states.get(backend).unwrap_or(if installed {
                BackendStatus::Ready
            } else {
                BackendStatus::NotInstalled
            });
            BackendInfo {
                kind: backend.as_str().to_string(),
                name: backend.display_name().to_string(),
                status: status.as_str().to_string(),
                min_duration_sec: backend.min_duration_sec(),
                max_duration_sec: backend.max_duration_sec(),
                sample_rate: backend.sample_rate(),
                model_version: installed.then(|| backend_version(backend, &dir)),
            }
        })
        .collect();

    to_value(GetBackendsResult {
        backends,
        default_backend: state.config.default_backend.as_str().to_string(),
    })
}

fn handle_download_backend(
    params: serde_json::Value,
    state: &ServerState,
) -> Result<serde_json::Value, JsonRpcError> {
    let params: DownloadBackendParams = serde_json::from_value(params)
        .map_err(|e| JsonRpcError::invalid_params(format!("invalid params: {e}")))?;
    let backend = Backend::parse(&params.backend)
        .ok_or_else(|| JsonRpcError::from(DaemonError::invalid_backend(&params.backend)))?;

    let dir = state.config.model_dir(backend);
    if is_installed(backend, &dir) {
        return to_value(DownloadBackendResult {
            started: false,
            already_installed: true,
        });
    }

    {
        let mut downloads = state.downloads.lock().expect("download set lock poisoned");
        if !downloads.insert(backend) {
            return Err(DaemonError::download_in_progress(backend.as_str()).into());
        }
    }
    state.backend_states.set(backend, BackendStatus::Downloading);

    let outbound = state.outbound.clone();
    let states = std::sync::Arc::clone(&state.backend_states);
    let downloads = std::sync::Arc::clone(&state.downloads);
    std::thread::Builder::new()
        .name(format!("fetch-{backend}"))
        .spawn(move || {
            let mut notify = |progress: &crate::models::DownloadProgress| {
                outbound.notify(
                    "download_progress",
                    DownloadProgressParams {
                        backend: backend.as_str().to_string(),
                        component: progress.component.clone(),
                        component_percent: progress.component_percent,
                        overall_percent: progress.overall_percent,
                        bytes_downloaded: progress.bytes_downloaded,
                        bytes_total: progress.bytes_total,
                    },
                );
            };
            match fetch_backend_assets(backend, &dir, &mut notify) {
                Ok(()) => {
                    info!(%backend, "assets installed");
                    states.clear(backend);
                }
                Err(e) => {
                    error!(%backend, "asset fetch failed: {e}");
                    states.set(backend, BackendStatus::Error);
                }
            }
            downloads
                .lock()
                .expect("download set lock poisoned")
                .remove(&backend);
        })
        .map_err(|e| JsonRpcError::internal_error(format!("cannot spawn fetch thread: {e}")))?;

    to_value(DownloadBackendResult {
        started: true,
        already_installed: false,
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::internal_error(format!("cannot serialize result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TrackStore;
    use crate::config::DaemonConfig;
    use crate::error::ErrorCode as Code;
    use crate::generation::{JobQueue, JobTable};
    use crate::models::loader::required_files;
    use crate::models::BackendStates;
    use crate::rpc::server::test_support::outbound_pair;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Fixture {
        state: ServerState,
        rx: std::sync::mpsc::Receiver<String>,
        root: TempDir,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let tracks = root.path().join("tracks");
        let (outbound, rx) = outbound_pair();
        let config = DaemonConfig {
            cache_path: Some(tracks.clone()),
            musicgen_model_path: Some(root.path().join("musicgen")),
            ace_step_model_path: Some(root.path().join("ace_step")),
            queue_limit: 5,
            ..DaemonConfig::default()
        };
        let store = TrackStore::open(&tracks, 1 << 30, None).unwrap();
        let state = ServerState {
            outbound,
            store: Arc::new(Mutex::new(store)),
            queue: Arc::new(JobQueue::new(config.queue_limit)),
            table: Arc::new(JobTable::new()),
            backend_states: Arc::new(BackendStates::new()),
            downloads: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        };
        Fixture { state, rx, root }
    }

    fn install_musicgen(fixture: &Fixture) {
        let dir = fixture.state.config.model_dir(Backend::MusicGen);
        std::fs::create_dir_all(&dir).unwrap();
        for file in required_files(Backend::MusicGen) {
            std::fs::write(dir.join(file), b"stub").unwrap();
        }
    }

    fn generate(fixture: &Fixture, params: serde_json::Value) -> String {
        handle_generate(params, RequestId::Integer(1), &fixture.state);
        fixture.rx.recv().unwrap()
    }

    #[test]
    fn generate_rejects_uninstalled_backend() {
        let fixture = fixture();
        let response = generate(
            &fixture,
            serde_json::json!({"prompt": "lofi beats", "duration_sec": 10}),
        );
        assert!(response.contains("BACKEND_NOT_INSTALLED"));
    }

    #[test]
    fn generate_validation_comes_before_install_check() {
        let fixture = fixture();
        let response = generate(&fixture, serde_json::json!({"prompt": "", "duration_sec": 10}));
        assert!(response.contains("INVALID_PROMPT"));
    }

    #[test]
    fn generate_admits_and_reports_generating() {
        let fixture = fixture();
        install_musicgen(&fixture);

        let response = generate(
            &fixture,
            serde_json::json!({"prompt": "lofi beats", "duration_sec": 10, "seed": 42}),
        );
        assert!(response.contains("\"Generating\""));
        assert!(response.contains("\"position\":0"));
        assert_eq!(fixture.state.queue.len(), 1);
    }

    #[test]
    fn duplicate_tuple_does_not_enqueue_twice() {
        let fixture = fixture();
        install_musicgen(&fixture);
        let params = serde_json::json!({"prompt": "lofi beats", "duration_sec": 10, "seed": 42});

        let first = generate(&fixture, params.clone());
        let second = generate(&fixture, params);

        let track_of = |s: &str| {
            let v: serde_json::Value = serde_json::from_str(s).unwrap();
            v["result"]["track_id"].as_str().unwrap().to_string()
        };
        assert_eq!(track_of(&first), track_of(&second));
        assert_eq!(fixture.state.queue.len(), 1);
    }

    #[test]
    fn queue_full_on_sixth_distinct_request() {
        let fixture = fixture();
        install_musicgen(&fixture);
        // make the worker look busy so nothing is popped
        fixture.state.table.insert_queued("busy", Default::default());
        fixture.state.table.set_active("busy");

        for i in 0..5 {
            let response = generate(
                &fixture,
                serde_json::json!({"prompt": format!("beat {i}"), "duration_sec": 10, "seed": i}),
            );
            assert!(response.contains("\"Queued\""), "request {i}: {response}");
        }
        let sixth = generate(
            &fixture,
            serde_json::json!({"prompt": "beat 5", "duration_sec": 10, "seed": 5}),
        );
        assert!(sixth.contains("QUEUE_FULL"));
    }

    #[test]
    fn cached_tuple_short_circuits_with_replay() {
        let fixture = fixture();
        install_musicgen(&fixture);

        let model_version =
            backend_version(Backend::MusicGen, &fixture.state.config.model_dir(Backend::MusicGen));
        let track_id = compute_track_id("lofi beats", 42, 10, &model_version, Backend::MusicGen);
        {
            let mut store = fixture.state.store.lock().unwrap();
            let wav = store.wav_path(&track_id);
            std::fs::write(&wav, b"RIFFstub").unwrap();
            store
                .put(Track::new(
                    track_id.clone(),
                    wav,
                    "lofi beats".to_string(),
                    10.0,
                    32000,
                    42,
                    Backend::MusicGen,
                    model_version,
                    3.0,
                ))
                .unwrap();
        }

        let response = generate(
            &fixture,
            serde_json::json!({"prompt": "lofi beats", "duration_sec": 10, "seed": 42}),
        );
        assert!(response.contains("\"Cached\""));
        assert!(response.contains(&track_id));

        // the replayed completion follows the response on the same stream
        let replay = fixture.rx.recv().unwrap();
        assert!(replay.contains("generation_complete"));
        assert!(replay.contains(&track_id));
        assert_eq!(fixture.state.queue.len(), 0);
    }

    #[test]
    fn cancel_unknown_track_is_not_found() {
        let fixture = fixture();
        let result = handle_cancel(
            serde_json::json!({"track_id": "0000000000000000"}),
            &fixture.state,
        );
        let err = result.unwrap_err();
        assert_eq!(err.code, Code::TrackNotFound.as_rpc_code());
    }

    #[test]
    fn cancel_queued_job_removes_and_notifies() {
        let fixture = fixture();
        install_musicgen(&fixture);
        fixture.state.table.insert_queued("busy", Default::default());
        fixture.state.table.set_active("busy");

        let response = generate(
            &fixture,
            serde_json::json!({"prompt": "to cancel", "duration_sec": 10, "seed": 9}),
        );
        let v: serde_json::Value = serde_json::from_str(&response).unwrap();
        let track_id = v["result"]["track_id"].as_str().unwrap().to_string();

        let result =
            handle_cancel(serde_json::json!({"track_id": track_id}), &fixture.state).unwrap();
        assert_eq!(result["cancelled"], true);
        assert_eq!(result["was_generating"], false);

        let notification = fixture.rx.recv().unwrap();
        assert!(notification.contains("generation_cancelled"));
        assert_eq!(fixture.state.queue.len(), 0);

        // a second cancel finds the job already terminal
        let again = handle_cancel(serde_json::json!({"track_id": track_id}), &fixture.state);
        assert_eq!(
            again.unwrap_err().code,
            Code::AlreadyComplete.as_rpc_code()
        );
    }

    #[test]
    fn cancel_active_job_sets_flag() {
        let fixture = fixture();
        let flag = crate::types::CancelFlag::new();
        fixture.state.table.insert_queued("deadbeef00000000", flag.clone());
        fixture.state.table.set_active("deadbeef00000000");

        let result = handle_cancel(
            serde_json::json!({"track_id": "deadbeef00000000"}),
            &fixture.state,
        )
        .unwrap();
        assert_eq!(result["was_generating"], true);
        assert!(flag.is_set());
    }

    #[test]
    fn get_backends_reports_both_with_status() {
        let fixture = fixture();
        install_musicgen(&fixture);

        let value = handle_get_backends(&fixture.state).unwrap();
        let backends = value["backends"].as_array().unwrap();
        assert_eq!(backends.len(), 2);

        let musicgen = backends.iter().find(|b| b["type"] == "musicgen").unwrap();
        assert_eq!(musicgen["status"], "ready");
        assert_eq!(musicgen["sample_rate"], 32000);
        assert_eq!(musicgen["max_duration_sec"], 120);
        assert!(musicgen["model_version"].as_str().unwrap().contains("musicgen"));

        let ace = backends.iter().find(|b| b["type"] == "ace_step").unwrap();
        assert_eq!(ace["status"], "not_installed");
        assert_eq!(ace["max_duration_sec"], 240);
        assert_eq!(value["default_backend"], "musicgen");
    }

    #[test]
    fn download_backend_already_installed() {
        let fixture = fixture();
        install_musicgen(&fixture);
        let value = handle_download_backend(
            serde_json::json!({"backend": "musicgen"}),
            &fixture.state,
        )
        .unwrap();
        assert_eq!(value["already_installed"], true);
        assert_eq!(value["started"], false);
    }

    #[test]
    fn download_backend_rejects_unknown_name() {
        let fixture = fixture();
        let err = handle_download_backend(
            serde_json::json!({"backend": "riffusion"}),
            &fixture.state,
        )
        .unwrap_err();
        assert_eq!(err.code, Code::InvalidBackend.as_rpc_code());
    }

    #[test]
    fn download_backend_marks_duplicate_requests() {
        let fixture = fixture();
        fixture
            .state
            .downloads
            .lock()
            .unwrap()
            .insert(Backend::AceStep);

        let err = handle_download_backend(
            serde_json::json!({"backend": "ace_step"}),
            &fixture.state,
        )
        .unwrap_err();
        assert_eq!(err.code, Code::DownloadInProgress.as_rpc_code());
        let _ = &fixture.root;
    }
}
