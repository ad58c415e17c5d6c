//! The generation worker.
//!
//! A single thread owns the model sessions and processes jobs strictly
//! serially. All ONNX calls happen here, never on the RPC reader. Each job
//! runs to exactly one terminal notification: `generation_complete`,
//! `generation_error`, or `generation_cancelled`. Engine failures are
//! contained; the worker moves on to the next job.

use std::cell::RefCell;
use std::fs;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::audio::{samples_to_duration, write_wav, ChannelLayout};
use crate::cache::TrackStore;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::models::{load_backend, BackendStates, BackendStatus, GenerateSpec, LoadedModels};
use crate::rpc::server::Outbound;
use crate::rpc::types::{
    GenerationCancelledParams, GenerationCompleteParams, GenerationErrorParams,
    GenerationProgressParams,
};
use crate::types::{GenerationJob, JobStatus, Track};

use super::progress::ProgressTracker;
use super::queue::JobQueue;
use super::table::JobTable;

/// Starts the worker thread. It exits after the queue closes and the job in
/// flight (if any) has finished.
pub fn spawn(
    config: DaemonConfig,
    queue: Arc<JobQueue>,
    table: Arc<JobTable>,
    store: Arc<Mutex<TrackStore>>,
    states: Arc<BackendStates>,
    outbound: Outbound,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("generation-worker".to_string())
        .spawn(move || {
            let mut models = LoadedModels::None;
            while let Some(job) = queue.pop_blocking() {
                process_job(&config, &table, &store, &states, &outbound, &mut models, job);
            }
            info!("worker exiting");
        })
        .expect("cannot spawn worker thread")
}

fn process_job(
    config: &DaemonConfig,
    table: &JobTable,
    store: &Mutex<TrackStore>,
    states: &BackendStates,
    outbound: &Outbound,
    models: &mut LoadedModels,
    job: GenerationJob,
) {
    let track_id = job.track_id.clone();
    table.set_active(&track_id);

    // cancel may have landed between pop and here
    if job.cancel.is_set() {
        outbound.notify(
            "generation_cancelled",
            GenerationCancelledParams {
                track_id: track_id.clone(),
                at_step: 0,
                total_steps: job.total_steps(),
            },
        );
        table.finish_active(&track_id, JobStatus::Cancelled);
        return;
    }

    if models.backend() != Some(job.backend) {
        states.set(job.backend, BackendStatus::Loading);
        match load_backend(job.backend, config) {
            Ok(loaded) => {
                *models = loaded;
                states.clear(job.backend);
            }
            Err(e) => {
                error!(backend = %job.backend, "model load failed: {e}");
                states.set(job.backend, BackendStatus::Error);
                fail_job(table, outbound, &track_id, &e);
                return;
            }
        }
    }

    let spec = GenerateSpec {
        prompt: job.prompt.clone(),
        duration_sec: job.duration_sec,
        seed: job.seed,
        inference_steps: job.inference_steps,
        scheduler: job.scheduler,
        guidance_scale: job.guidance_scale,
    };

    info!(
        %track_id,
        backend = %job.backend,
        duration = job.duration_sec,
        seed = job.seed,
        "generation started"
    );
    let started = Instant::now();

    // the engine callback runs on this thread; RefCell is enough
    let tracker = RefCell::new(ProgressTracker::new(job.total_steps()));
    let result = models.generate(&spec, &job.cancel, &|done, total| {
        let mut tracker = tracker.borrow_mut();
        tracker.update(done);
        if let Some(percent) = tracker.should_notify() {
            outbound.notify(
                "generation_progress",
                GenerationProgressParams {
                    track_id: track_id.clone(),
                    percent,
                    current_step: done,
                    total_steps: total,
                    eta_sec: tracker.eta_sec(),
                },
            );
        }
    });

    match result {
        Ok(samples) => {
            finish_job(table, store, outbound, &job, started, samples);
        }
        Err(e) if e.is_cancelled() => {
            let tracker = tracker.borrow();
            info!(%track_id, at_step = tracker.done(), "generation cancelled");
            remove_partials(store, &track_id);
            outbound.notify(
                "generation_cancelled",
                GenerationCancelledParams {
                    track_id: track_id.clone(),
                    at_step: tracker.done(),
                    total_steps: tracker.total(),
                },
            );
            table.finish_active(&track_id, JobStatus::Cancelled);
        }
        Err(e) => {
            error!(%track_id, "generation failed: {e} (hint: {})", e.code.recovery_hint());
            remove_partials(store, &track_id);
            fail_job(table, outbound, &track_id, &e);
        }
    }
}

/// Writes the WAV, publishes the cache entry, and emits the completion
/// notification.
fn finish_job(
    table: &JobTable,
    store: &Mutex<TrackStore>,
    outbound: &Outbound,
    job: &GenerationJob,
    started: Instant,
    samples: Vec<f32>,
) {
    let track_id = job.track_id.clone();
    let sample_rate = job.backend.sample_rate();
    let duration = samples_to_duration(samples.len(), sample_rate);

    let (temp_path, final_path) = {
        let store = store.lock().expect("store lock poisoned");
        (store.temp_wav_path(&track_id), store.wav_path(&track_id))
    };

    let written = write_wav(&samples, &temp_path, sample_rate, ChannelLayout::Mono)
        .and_then(|()| {
            fs::rename(&temp_path, &final_path)
                .map_err(|e| DaemonError::inference(format!("cannot publish audio file: {e}")))
        });
    if let Err(e) = written {
        fs::remove_file(&temp_path).ok();
        fail_job(table, outbound, &track_id, &e);
        return;
    }

    let generation_time = started.elapsed().as_secs_f32();
    let track = Track::new(
        track_id.clone(),
        final_path.clone(),
        job.prompt.clone(),
        duration,
        sample_rate,
        job.seed,
        job.backend,
        job.model_version.clone(),
        generation_time,
    );

    {
        let mut store = store.lock().expect("store lock poisoned");
        match store.put(track) {
            Ok(evicted) => {
                for old in evicted {
                    info!(track_id = %old.track_id, "evicted to respect cache limits");
                }
            }
            Err(e) => warn!(%track_id, "cache index write failed: {e}"),
        }
    }

    info!(
        %track_id,
        seconds = duration,
        took = generation_time,
        "generation complete"
    );
    outbound.notify(
        "generation_complete",
        GenerationCompleteParams {
            track_id: track_id.clone(),
            path: final_path.to_string_lossy().into_owned(),
            duration_sec: duration,
            sample_rate,
            generation_time_sec: generation_time,
            backend: job.backend.as_str().to_string(),
            model_version: job.model_version.clone(),
        },
    );
    table.finish_active(&track_id, JobStatus::Complete);
}

/// Marks the job failed and emits `generation_error`.
fn fail_job(table: &JobTable, outbound: &Outbound, track_id: &str, error: &DaemonError) {
    outbound.notify(
        "generation_error",
        GenerationErrorParams {
            track_id: track_id.to_string(),
            code: error.code.as_str().to_string(),
            message: error.message.clone(),
        },
    );
    table.finish_active(track_id, JobStatus::Failed);
}

/// A failed or cancelled job never leaves artifacts behind.
fn remove_partials(store: &Mutex<TrackStore>, track_id: &str) {
    let (temp_path, final_path, sidecar) = {
        let store = store.lock().expect("store lock poisoned");
        (
            store.temp_wav_path(track_id),
            store.wav_path(track_id),
            store.sidecar_path(track_id),
        )
    };
    fs::remove_file(temp_path).ok();
    // the final paths only exist if a previous run completed; a re-run of
    // the same id would have been a cache hit, so these are stale partials
    if !sidecar.exists() {
        fs::remove_file(final_path).ok();
    }
}
