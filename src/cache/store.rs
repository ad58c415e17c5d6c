//! Content-addressed track store.
//!
//! Each entry is a WAV file plus a JSON sidecar holding the full [`Track`]
//! metadata, both named by the track id. The in-memory index is rebuilt on
//! startup by scanning the sidecars; writes go through a temp file and a
//! rename so concurrent readers never observe a half-written entry.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::{DaemonError, ErrorCode, Result};
use crate::types::Track;

struct StoreEntry {
    track: Track,
    bytes: u64,
    last_accessed: SystemTime,
}

/// On-disk track cache with LRU eviction.
pub struct TrackStore {
    dir: PathBuf,
    max_bytes: u64,
    max_tracks: Option<usize>,
    entries: HashMap<String, StoreEntry>,
}

impl TrackStore {
    /// Opens (or creates) the store at `dir` and rebuilds the index from the
    /// sidecar files found there. Broken sidecars and sidecars without an
    /// audio file are skipped.
    pub fn open(dir: &Path, max_bytes: u64, max_tracks: Option<usize>) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            DaemonError::with_context(
                ErrorCode::ModelLoadFailed,
                format!("cannot create cache directory: {e}"),
                dir.display().to_string(),
            )
        })?;

        let mut entries = HashMap::new();
        let listing = fs::read_dir(dir).map_err(|e| {
            DaemonError::with_context(
                ErrorCode::ModelLoadFailed,
                format!("cannot read cache directory: {e}"),
                dir.display().to_string(),
            )
        })?;

        for item in listing.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let track: Track = match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
            {
                Some(track) => track,
                None => {
                    warn!(sidecar = %path.display(), "skipping unreadable cache sidecar");
                    continue;
                }
            };
            let audio = match fs::metadata(&track.path) {
                Ok(meta) => meta,
                Err(_) => {
                    debug!(track_id = %track.track_id, "sidecar without audio file, ignoring");
                    continue;
                }
            };
            let last_accessed = item
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or_else(|_| SystemTime::now());
            entries.insert(
                track.track_id.clone(),
                StoreEntry {
                    bytes: audio.len(),
                    last_accessed,
                    track,
                },
            );
        }

        debug!(entries = entries.len(), dir = %dir.display(), "track store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes,
            max_tracks,
            entries,
        })
    }

    /// Final audio path for a track id.
    pub fn wav_path(&self, track_id: &str) -> PathBuf {
        self.dir.join(format!("{track_id}.wav"))
    }

    /// Sidecar metadata path for a track id.
    pub fn sidecar_path(&self, track_id: &str) -> PathBuf {
        self.dir.join(format!("{track_id}.json"))
    }

    /// Scratch path the worker writes audio to before the final rename.
    pub fn temp_wav_path(&self, track_id: &str) -> PathBuf {
        self.dir.join(format!(".{track_id}.wav.tmp"))
    }

    /// Looks up a track, refreshing its access time for LRU. Entries whose
    /// audio file disappeared on disk are treated as a miss and dropped.
    pub fn get(&mut self, track_id: &str) -> Option<Track> {
        let entry = self.entries.get_mut(track_id)?;
        if !entry.track.path.exists() {
            warn!(track_id, "cached audio file missing, dropping index entry");
            self.entries.remove(track_id);
            let _ = fs::remove_file(self.dir.join(format!("{track_id}.json")));
            return None;
        }
        entry.last_accessed = SystemTime::now();
        Some(entry.track.clone())
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.entries.contains_key(track_id)
    }

    /// Records a finished track. The audio file must already sit at
    /// [`wav_path`](Self::wav_path); this writes the sidecar atomically and
    /// runs eviction.
    pub fn put(&mut self, track: Track) -> Result<Vec<Track>> {
        let sidecar = self.sidecar_path(&track.track_id);
        let tmp = self.dir.join(format!(".{}.json.tmp", track.track_id));

        let payload = serde_json::to_vec_pretty(&track)
            .map_err(|e| DaemonError::inference(format!("cannot serialize sidecar: {e}")))?;
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| DaemonError::inference(format!("cannot create sidecar: {e}")))?;
            file.write_all(&payload)
                .map_err(|e| DaemonError::inference(format!("cannot write sidecar: {e}")))?;
            file.sync_all()
                .map_err(|e| DaemonError::inference(format!("cannot sync sidecar: {e}")))?;
        }
        fs::rename(&tmp, &sidecar)
            .map_err(|e| DaemonError::inference(format!("cannot publish sidecar: {e}")))?;

        let bytes = fs::metadata(&track.path).map(|m| m.len()).unwrap_or(0);
        self.entries.insert(
            track.track_id.clone(),
            StoreEntry {
                bytes,
                last_accessed: SystemTime::now(),
                track,
            },
        );

        Ok(self.evict())
    }

    /// Evicts least-recently-accessed entries until the size and count
    /// ceilings hold. Returns the evicted tracks.
    pub fn evict(&mut self) -> Vec<Track> {
        let mut evicted = Vec::new();
        loop {
            let over_bytes = self.total_bytes() > self.max_bytes;
            let over_count = self
                .max_tracks
                .map(|limit| self.entries.len() > limit)
                .unwrap_or(false);
            if !(over_bytes || over_count) || self.entries.len() <= 1 {
                break;
            }

            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(id, _)| id.clone());
            let Some(id) = oldest else { break };
            if let Some(track) = self.remove(&id) {
                debug!(track_id = %track.track_id, "evicted from track cache");
                evicted.push(track);
            }
        }
        evicted
    }

    /// Removes an entry and deletes its files.
    pub fn remove(&mut self, track_id: &str) -> Option<Track> {
        let entry = self.entries.remove(track_id)?;
        let _ = fs::remove_file(&entry.track.path);
        let _ = fs::remove_file(self.sidecar_path(track_id));
        Some(entry.track)
    }

    /// Removes every entry and its files.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total audio bytes currently indexed.
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Backend;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn put_track(store: &mut TrackStore, id: &str, bytes: usize) -> Track {
        let wav = store.wav_path(id);
        fs::write(&wav, vec![0u8; bytes]).unwrap();
        let track = Track::new(
            id.to_string(),
            wav,
            format!("prompt {id}"),
            10.0,
            32000,
            42,
            Backend::MusicGen,
            "v1".to_string(),
            5.0,
        );
        store.put(track.clone()).unwrap();
        track
    }

    #[test]
    fn put_then_get() {
        let dir = tempdir().unwrap();
        let mut store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();

        put_track(&mut store, "aaaa000000000001", 128);
        let got = store.get("aaaa000000000001").unwrap();
        assert_eq!(got.prompt, "prompt aaaa000000000001");
        assert!(store.get("ffff000000000000").is_none());
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempdir().unwrap();
        {
            let mut store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
            put_track(&mut store, "aaaa000000000001", 64);
            put_track(&mut store, "aaaa000000000002", 64);
        }
        let mut store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("aaaa000000000002").is_some());
    }

    #[test]
    fn broken_sidecar_is_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bogus.json"), b"{ not json").unwrap();
        let store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn sidecar_without_audio_is_a_miss() {
        let dir = tempdir().unwrap();
        {
            let mut store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
            let track = put_track(&mut store, "aaaa000000000001", 64);
            fs::remove_file(&track.path).unwrap();
        }
        let store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn count_ceiling_evicts_lru() {
        let dir = tempdir().unwrap();
        let mut store = TrackStore::open(dir.path(), 1 << 20, Some(2)).unwrap();

        put_track(&mut store, "aaaa000000000001", 16);
        thread::sleep(Duration::from_millis(5));
        put_track(&mut store, "aaaa000000000002", 16);
        thread::sleep(Duration::from_millis(5));

        // touch the first entry so the second becomes LRU
        store.get("aaaa000000000001").unwrap();
        thread::sleep(Duration::from_millis(5));
        put_track(&mut store, "aaaa000000000003", 16);

        assert_eq!(store.len(), 2);
        assert!(store.contains("aaaa000000000001"));
        assert!(!store.contains("aaaa000000000002"));
        assert!(store.contains("aaaa000000000003"));
    }

    #[test]
    fn size_ceiling_evicts_until_under() {
        let dir = tempdir().unwrap();
        let mut store = TrackStore::open(dir.path(), 1024, None).unwrap();

        put_track(&mut store, "aaaa000000000001", 600);
        thread::sleep(Duration::from_millis(5));
        put_track(&mut store, "aaaa000000000002", 600);

        assert_eq!(store.len(), 1);
        assert!(store.contains("aaaa000000000002"));
        assert!(store.total_bytes() <= 1024);
    }

    #[test]
    fn eviction_deletes_files() {
        let dir = tempdir().unwrap();
        let mut store = TrackStore::open(dir.path(), 1 << 20, Some(1)).unwrap();

        let first = put_track(&mut store, "aaaa000000000001", 16);
        thread::sleep(Duration::from_millis(5));
        put_track(&mut store, "aaaa000000000002", 16);

        assert!(!first.path.exists());
        assert!(!store.sidecar_path("aaaa000000000001").exists());
    }

    #[test]
    fn clear_empties_directory_index() {
        let dir = tempdir().unwrap();
        let mut store = TrackStore::open(dir.path(), 1 << 20, None).unwrap();
        put_track(&mut store, "aaaa000000000001", 16);
        store.clear();
        assert!(store.is_empty());
        assert!(!store.wav_path("aaaa000000000001").exists());
    }
}
