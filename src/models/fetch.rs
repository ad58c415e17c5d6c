//! One-time model asset fetcher.
//!
//! Streams each missing file over HTTP into a `.part` temp file and renames
//! it into place when complete. Interrupted downloads resume with a ranged
//! GET from the partial file's length. Progress callbacks are throttled so
//! the notification stream stays light.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tracing::{info, warn};

use crate::error::{DaemonError, Result};

use super::backend::Backend;
use super::loader::asset_urls;

const CHUNK: usize = 64 * 1024;
const THROTTLE_PERCENT: u8 = 5;
const THROTTLE_INTERVAL: Duration = Duration::from_millis(200);

/// Snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// File currently transferring.
    pub component: String,
    /// Percent of the current file.
    pub component_percent: u8,
    /// Percent across all files, equally weighted.
    pub overall_percent: u8,
    /// Bytes of the current file on disk.
    pub bytes_downloaded: u64,
    /// Expected size of the current file (0 when the server does not say).
    pub bytes_total: u64,
}

/// Rate limiter for progress callbacks: one event per 5% step, or per
/// 200 ms while the percentage is moving.
struct Throttle {
    last_percent: u8,
    last_emit: Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_percent: 0,
            last_emit: Instant::now(),
        }
    }

    fn ready(&mut self, percent: u8) -> bool {
        let stepped = percent >= self.last_percent.saturating_add(THROTTLE_PERCENT);
        let aged = self.last_emit.elapsed() >= THROTTLE_INTERVAL && percent > self.last_percent;
        if stepped || aged {
            self.last_percent = percent;
            self.last_emit = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Downloads every missing asset of `backend` into `dir`.
///
/// Files already present are skipped. The callback fires on throttled
/// per-file progress and once per completed file.
pub fn fetch_backend_assets(
    backend: Backend,
    dir: &Path,
    notify: &mut dyn FnMut(&DownloadProgress),
) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        DaemonError::model_download_failed(format!(
            "cannot create asset directory {}: {e}",
            dir.display()
        ))
    })?;

    let urls = asset_urls(backend);
    let total_files = urls.len();

    let client = Client::builder()
        .timeout(Duration::from_secs(3600))
        .build()
        .map_err(|e| DaemonError::model_download_failed(format!("cannot build HTTP client: {e}")))?;

    for (index, (name, url)) in urls.iter().enumerate() {
        let target = dir.join(name);
        if target.exists() {
            continue;
        }

        info!(backend = %backend, file = name, "fetching asset");
        fetch_one(&client, url, &target, |done, total| {
            let component_percent = percent(done, total);
            let overall = ((index as u64 * 100) + component_percent as u64) / total_files as u64;
            DownloadProgress {
                component: name.to_string(),
                component_percent,
                overall_percent: overall as u8,
                bytes_downloaded: done,
                bytes_total: total,
            }
        }, notify)?;

        notify(&DownloadProgress {
            component: name.to_string(),
            component_percent: 100,
            overall_percent: (((index + 1) * 100) / total_files) as u8,
            bytes_downloaded: fs::metadata(&target).map(|m| m.len()).unwrap_or(0),
            bytes_total: fs::metadata(&target).map(|m| m.len()).unwrap_or(0),
        });
    }

    info!(backend = %backend, "all assets present");
    Ok(())
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done * 100 / total) as u8).min(100)
}

/// Downloads one file with resume support.
fn fetch_one(
    client: &Client,
    url: &str,
    target: &Path,
    snapshot: impl Fn(u64, u64) -> DownloadProgress,
    notify: &mut dyn FnMut(&DownloadProgress),
) -> Result<()> {
    let part = target.with_extension("part");
    let mut resume_from = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);

    let mut request = client.get(url);
    if resume_from > 0 {
        request = request.header(RANGE, format!("bytes={resume_from}-"));
    }
    let mut response = request
        .send()
        .map_err(|e| DaemonError::model_download_failed(format!("GET {url} failed: {e}")))?;

    // the partial already covers the whole file
    if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && resume_from > 0 {
        fs::rename(&part, target)
            .map_err(|e| DaemonError::model_download_failed(format!("cannot publish file: {e}")))?;
        return Ok(());
    }

    let mut file = match response.status() {
        StatusCode::PARTIAL_CONTENT if resume_from > 0 => OpenOptions::new()
            .append(true)
            .open(&part)
            .map_err(|e| DaemonError::model_download_failed(format!("cannot reopen {}: {e}", part.display()))),
        status if status.is_success() => {
            // server ignored the range; restart from scratch
            if resume_from > 0 {
                warn!(url, "server does not support resume, refetching");
                resume_from = 0;
            }
            fs::File::create(&part).map_err(|e| {
                DaemonError::model_download_failed(format!("cannot create {}: {e}", part.display()))
            })
        }
        status => Err(DaemonError::model_download_failed(format!(
            "HTTP {status} for {url}"
        ))),
    }?;

    let remaining = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let expected_total = resume_from + remaining;

    // a partial larger than the server's file is corrupt; start over
    if remaining == 0 && resume_from > 0 {
        warn!(url, "partial file inconsistent with server, refetching");
        drop(file);
        fs::remove_file(&part).ok();
        return fetch_one(client, url, target, snapshot, notify);
    }

    let mut downloaded = resume_from;
    let mut throttle = Throttle::new();
    let mut buffer = [0u8; CHUNK];
    loop {
        let read = response
            .read(&mut buffer)
            .map_err(|e| DaemonError::model_download_failed(format!("read from {url} failed: {e}")))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .map_err(|e| DaemonError::model_download_failed(format!("write failed: {e}")))?;
        downloaded += read as u64;

        if throttle.ready(percent(downloaded, expected_total)) {
            notify(&snapshot(downloaded, expected_total));
        }
    }

    file.sync_all()
        .map_err(|e| DaemonError::model_download_failed(format!("sync failed: {e}")))?;
    drop(file);

    if expected_total > 0 && downloaded != expected_total {
        fs::remove_file(&part).ok();
        return Err(DaemonError::model_download_failed(format!(
            "size mismatch for {url}: got {downloaded}, expected {expected_total}"
        )));
    }

    fs::rename(&part, target)
        .map_err(|e| DaemonError::model_download_failed(format!("cannot publish file: {e}")))?;
    Ok(())
}
