// SPDX-License-Identifier: Apache-2.0

//! Durable mapping from file identity to byte offset.
//!
//! The identity is `devHex-inoHex`: a rotated or renamed file keeps its
//! offset exactly as long as its inode is unchanged, which defeats
//! path-based tracking across rotation. A background flusher rewrites the
//! position file in whole on a fixed interval and once more on `stop()`.

use std::collections::HashMap;
use std::fs::{self, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error};

use crate::tailer::error::{Result, TailError};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const POSITION_FILE_MODE: u32 = 0o600;

/// Render the `(device, inode)` pair of a metadata record as the persistent
/// identity key: two lowercase hex numbers joined by `-`.
pub fn identity_from_metadata(meta: &Metadata) -> String {
    format!("{:x}-{:x}", meta.dev(), meta.ino())
}

/// Stat `path` and compute its identity.
pub fn file_identity(path: &Path) -> io::Result<String> {
    let meta = fs::metadata(path)?;
    Ok(identity_from_metadata(&meta))
}

/// Many readers of offsets, a single writer per identity. `stop()` drains
/// into one final synchronous flush and is idempotent.
pub trait PositionStore: Send + Sync {
    /// Returns 0 for an unknown identity.
    fn get(&self, identity: &str) -> u64;
    fn set(&self, identity: &str, offset: u64);
    fn del(&self, identity: &str);
    fn stop(&self);
}

/// File-backed position store. The on-disk form is a JSON dictionary with
/// identity keys and integer byte offsets, rewritten atomically in whole.
#[derive(Debug)]
pub struct FilePositionStore {
    path: PathBuf,
    offsets: Arc<RwLock<HashMap<String, u64>>>,
    done: flume::Sender<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl FilePositionStore {
    /// Load the position file and start the background flusher.
    ///
    /// A missing or empty file is an empty map. A present, non-empty file
    /// that fails to parse is a startup error, never a silent reset.
    pub fn open(path: impl Into<PathBuf>, sync_interval: Duration) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    TailError::unspecified(format!(
                        "create position file directory {} failed",
                        parent.display()
                    ))
                    .with_cause(e)
                })?;
            }
        }

        let buf = match fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(
                    TailError::unspecified(format!("read position file {} failed", path.display()))
                        .with_cause(e),
                )
            }
        };

        let offsets: HashMap<String, u64> = if buf.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_slice(&buf).map_err(|e| {
                TailError::unspecified(format!(
                    "parse position file {} failed: {}",
                    path.display(),
                    e
                ))
            })?
        };

        let offsets = Arc::new(RwLock::new(offsets));
        let (done_tx, done_rx) = flume::bounded::<()>(1);

        let flusher = {
            let path = path.clone();
            let offsets = offsets.clone();
            std::thread::Builder::new()
                .name("tailmet-position".into())
                .spawn(move || loop {
                    match done_rx.recv_timeout(sync_interval) {
                        Err(flume::RecvTimeoutError::Timeout) => {
                            sync_to_disk(&path, &offsets);
                        }
                        // stop() fired or the store was dropped: one final flush
                        _ => {
                            sync_to_disk(&path, &offsets);
                            return;
                        }
                    }
                })
                .map_err(|e| {
                    TailError::unspecified("spawn position flusher failed")
                        .with_cause(io::Error::other(e))
                })?
        };

        Ok(Self {
            path,
            offsets,
            done: done_tx,
            flusher: Mutex::new(Some(flusher)),
            stopped: AtomicBool::new(false),
        })
    }

    #[cfg(test)]
    pub(crate) fn flush_now(&self) {
        sync_to_disk(&self.path, &self.offsets);
    }
}

/// Rewrite the whole position file: open write|create|truncate with mode
/// 0600, serialize, write, close. Failure is reported to the logger and does
/// not terminate the flusher. The map lock is released before any I/O.
fn sync_to_disk(path: &Path, offsets: &RwLock<HashMap<String, u64>>) {
    let buf = {
        let map = match offsets.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        match serde_json::to_vec(&*map) {
            Ok(buf) => buf,
            Err(e) => {
                error!(error = %e, "serialize positions failed");
                return;
            }
        }
    };

    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(POSITION_FILE_MODE);

    let mut file = match opts.open(path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "open position file failed");
            return;
        }
    };
    if let Err(e) = file.write_all(&buf) {
        error!(path = %path.display(), error = %e, "write position file failed");
        return;
    }
    debug!(path = %path.display(), "positions flushed");
}

impl PositionStore for FilePositionStore {
    fn get(&self, identity: &str) -> u64 {
        let map = match self.offsets.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(identity).copied().unwrap_or(0)
    }

    fn set(&self, identity: &str, offset: u64) {
        let mut map = match self.offsets.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(identity.to_string(), offset);
    }

    fn del(&self, identity: &str) {
        let mut map = match self.offsets.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(identity);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done.send(());
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FilePositionStore {
    fn drop(&mut self) {
        self.stop();
    }
}

/// In-memory variant for inputs where durability is not meaningful
/// (stdin, webhook).
#[derive(Default)]
pub struct MemoryPositionStore {
    offsets: RwLock<HashMap<String, u64>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn get(&self, identity: &str) -> u64 {
        let map = self.offsets.read().unwrap();
        map.get(identity).copied().unwrap_or(0)
    }

    fn set(&self, identity: &str, offset: u64) {
        self.offsets
            .write()
            .unwrap()
            .insert(identity.to_string(), offset);
    }

    fn del(&self, identity: &str) {
        self.offsets.write().unwrap().remove(identity);
    }

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_at(dir: &TempDir) -> (PathBuf, FilePositionStore) {
        let path = dir.path().join("position.json");
        let store = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap();
        (path, store)
    }

    #[test]
    fn unknown_identity_is_zero() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_at(&dir);
        assert_eq!(store.get("ab-cd"), 0);
    }

    #[test]
    fn set_get_del() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_at(&dir);

        store.set("ab-cd", 42);
        assert_eq!(store.get("ab-cd"), 42);

        store.set("ab-cd", 128);
        assert_eq!(store.get("ab-cd"), 128);

        store.del("ab-cd");
        assert_eq!(store.get("ab-cd"), 0);
    }

    #[test]
    fn offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("position.json");

        {
            let store = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap();
            store.set("1a-2b", 12);
            store.set("1a-2c", 99);
            store.stop();
        }

        let store = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap();
        assert_eq!(store.get("1a-2b"), 12);
        assert_eq!(store.get("1a-2c"), 99);
    }

    #[test]
    fn missing_or_empty_file_is_empty_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("position.json");

        let store = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap();
        assert_eq!(store.get("x-y"), 0);
        store.stop();

        fs::write(&path, b"").unwrap();
        let store = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap();
        assert_eq!(store.get("x-y"), 0);
    }

    #[test]
    fn corrupt_file_is_a_startup_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("position.json");
        fs::write(&path, b"not json at all").unwrap();

        let err = FilePositionStore::open(&path, Duration::from_secs(3600)).unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_, store) = store_at(&dir);
        store.set("aa-bb", 7);
        store.stop();
        store.stop();
    }

    #[cfg(unix)]
    #[test]
    fn position_file_mode_is_0600() {
        let dir = TempDir::new().unwrap();
        let (path, store) = store_at(&dir);
        store.set("aa-bb", 7);
        store.flush_now();

        let mode = fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn identity_format_is_hex_pair() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, "x").unwrap();

        let id = file_identity(&file).unwrap();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(u64::from_str_radix(parts[0], 16).is_ok());
        assert!(u64::from_str_radix(parts[1], 16).is_ok());
    }

    #[test]
    fn identity_stable_across_rename() {
        let dir = TempDir::new().unwrap();
        let before = dir.path().join("a.log");
        let after = dir.path().join("a.log.1");
        fs::write(&before, "x").unwrap();

        let id_before = file_identity(&before).unwrap();
        fs::rename(&before, &after).unwrap();
        let id_after = file_identity(&after).unwrap();

        assert_eq!(id_before, id_after);
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryPositionStore::new();
        assert_eq!(store.get("a-b"), 0);
        store.set("a-b", 5);
        assert_eq!(store.get("a-b"), 5);
        store.del("a-b");
        assert_eq!(store.get("a-b"), 0);
        store.stop();
    }
}
