//! JSON-RPC server over stdin/stdout.
//!
//! One reader (the calling thread) parses inbound lines and dispatches
//! methods. One writer thread owns stdout: responses and server-initiated
//! notifications all funnel through its channel, so no two JSON documents
//! ever interleave on a line. Inference runs on the worker thread and never
//! touches the streams directly.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::TrackStore;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, ErrorCode, Result};
use crate::generation::{worker, JobQueue, JobTable};
use crate::models::{Backend, BackendStates};

use super::methods::dispatch;
use super::types::{JsonRpcError, JsonRpcErrorResponse, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Handle for enqueueing outbound protocol lines.
///
/// Cloned freely across the reader, worker, and download threads; the
/// single consumer guarantees write ordering equals enqueue ordering.
#[derive(Clone)]
pub struct Outbound {
    tx: Sender<String>,
}

impl Outbound {
    pub fn respond<T: Serialize>(&self, id: RequestId, result: T) {
        match serde_json::to_string(&JsonRpcResponse::new(id, result)) {
            Ok(line) => self.send_line(line),
            Err(e) => error!("cannot serialize response: {e}"),
        }
    }

    pub fn respond_error(&self, id: Option<RequestId>, error: JsonRpcError) {
        match serde_json::to_string(&JsonRpcErrorResponse::new(id, error)) {
            Ok(line) => self.send_line(line),
            Err(e) => error!("cannot serialize error response: {e}"),
        }
    }

    pub fn notify<T: Serialize>(&self, method: &'static str, params: T) {
        match serde_json::to_string(&JsonRpcNotification::new(method, params)) {
            Ok(line) => self.send_line(line),
            Err(e) => error!("cannot serialize {method} notification: {e}"),
        }
    }

    fn send_line(&self, line: String) {
        // the receiver only disappears during shutdown; drops are harmless
        let _ = self.tx.send(line);
    }
}

/// Spawns the stdout writer. The thread exits when the last `Outbound`
/// clone is dropped.
fn spawn_writer() -> (Outbound, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<String>();
    let handle = std::thread::Builder::new()
        .name("rpc-writer".to_string())
        .spawn(move || {
            let stdout = io::stdout();
            for line in rx {
                let mut out = stdout.lock();
                if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
                    // client hung up; keep draining so senders never block
                }
            }
        })
        .expect("cannot spawn writer thread");
    (Outbound { tx }, handle)
}

/// Shared state visible to every method handler.
pub struct ServerState {
    pub config: DaemonConfig,
    pub outbound: Outbound,
    pub store: Arc<Mutex<TrackStore>>,
    pub queue: Arc<JobQueue>,
    pub table: Arc<JobTable>,
    pub backend_states: Arc<BackendStates>,
    /// Back-ends with a fetch thread currently running.
    pub downloads: Arc<Mutex<HashSet<Backend>>>,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl ServerState {
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Runs the daemon until stdin EOF or a `shutdown` request.
///
/// Exit is graceful: the active generation finishes, queued jobs are
/// dropped, and the writer drains before the function returns.
pub fn run(config: DaemonConfig) -> Result<()> {
    let store = TrackStore::open(
        &config.tracks_dir(),
        config.cache_max_bytes(),
        config.cache_max_tracks,
    )
    .map_err(|e| {
        DaemonError::with_context(
            ErrorCode::ModelLoadFailed,
            format!("cache root is unusable: {}", e.message),
            config.tracks_dir().display().to_string(),
        )
    })?;

    let (outbound, writer) = spawn_writer();
    let state = ServerState {
        outbound: outbound.clone(),
        store: Arc::new(Mutex::new(store)),
        queue: Arc::new(JobQueue::new(config.queue_limit)),
        table: Arc::new(JobTable::new()),
        backend_states: Arc::new(BackendStates::new()),
        downloads: Arc::new(Mutex::new(HashSet::new())),
        shutdown: Arc::new(AtomicBool::new(false)),
        config,
    };

    let worker_handle = worker::spawn(
        state.config.clone(),
        Arc::clone(&state.queue),
        Arc::clone(&state.table),
        Arc::clone(&state.store),
        Arc::clone(&state.backend_states),
        outbound.clone(),
    );

    info!("daemon listening on stdio");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        handle_line(&line, &state);

        if state.shutdown_requested() {
            break;
        }
    }

    info!("shutting down: draining active job");
    let dropped = state.queue.close();
    if !dropped.is_empty() {
        info!(count = dropped.len(), "dropped queued jobs");
    }
    if worker_handle.join().is_err() {
        error!("worker thread panicked during shutdown");
    }

    drop(outbound);
    drop(state);
    if writer.join().is_err() {
        error!("writer thread panicked during shutdown");
    }
    Ok(())
}

/// Parses and dispatches one inbound line.
fn handle_line(line: &str, state: &ServerState) {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            state
                .outbound
                .respond_error(None, JsonRpcError::parse_error(format!("invalid JSON: {e}")));
            return;
        }
    };

    if request.jsonrpc != super::types::JSONRPC_VERSION {
        state.outbound.respond_error(
            request.id,
            JsonRpcError::invalid_request("expected jsonrpc \"2.0\""),
        );
        return;
    }

    let Some(id) = request.id else {
        // inbound notifications are not part of this protocol; drop them
        return;
    };

    dispatch(&request.method, request.params, id, state);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Outbound;
    use std::sync::mpsc::{self, Receiver};

    /// An `Outbound` whose lines land in a channel instead of stdout.
    pub(crate) fn outbound_pair() -> (Outbound, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        (Outbound { tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_state() -> (ServerState, std::sync::mpsc::Receiver<String>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let (tx, rx) = mpsc::channel();
        let config = DaemonConfig {
            cache_path: Some(dir.path().to_path_buf()),
            ..DaemonConfig::default()
        };
        let store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
        let state = ServerState {
            outbound: Outbound { tx },
            store: Arc::new(Mutex::new(store)),
            queue: Arc::new(JobQueue::new(config.queue_limit)),
            table: Arc::new(JobTable::new()),
            backend_states: Arc::new(BackendStates::new()),
            downloads: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        };
        (state, rx, dir)
    }

    #[test]
    fn malformed_json_yields_parse_error() {
        let (state, rx, _dir) = test_state();
        handle_line("this is not json", &state);
        let response = rx.recv().unwrap();
        assert!(response.contains("-32700"));
        assert!(response.contains("\"id\":null"));
    }

    #[test]
    fn wrong_version_yields_invalid_request() {
        let (state, rx, _dir) = test_state();
        handle_line(r#"{"jsonrpc":"1.0","method":"ping","id":1}"#, &state);
        let response = rx.recv().unwrap();
        assert!(response.contains("-32600"));
    }

    #[test]
    fn unknown_method_yields_method_not_found() {
        let (state, rx, _dir) = test_state();
        handle_line(r#"{"jsonrpc":"2.0","method":"transmogrify","id":7}"#, &state);
        let response = rx.recv().unwrap();
        assert!(response.contains("-32601"));
        assert!(response.contains("\"id\":7"));
    }

    #[test]
    fn unknown_notification_is_dropped() {
        let (state, rx, _dir) = test_state();
        handle_line(r#"{"jsonrpc":"2.0","method":"transmogrify"}"#, &state);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ping_round_trip() {
        let (state, rx, _dir) = test_state();
        handle_line(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#, &state);
        let response = rx.recv().unwrap();
        assert!(response.contains("\"status\":\"ok\""));
        assert!(response.contains("\"version\""));
    }

    #[test]
    fn shutdown_sets_flag_and_responds() {
        let (state, rx, _dir) = test_state();
        handle_line(r#"{"jsonrpc":"2.0","method":"shutdown","id":2}"#, &state);
        assert!(state.shutdown_requested());
        let response = rx.recv().unwrap();
        assert!(response.contains("shutting_down"));
    }
}
