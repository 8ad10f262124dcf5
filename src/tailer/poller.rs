// SPDX-License-Identifier: Apache-2.0

//! Polling tailer: periodically re-lists the watched directories and drains
//! every matching file to EOF.
//!
//! Correctness over efficiency: each tick rebuilds the reader set from the
//! directory listing, so appearance, disappearance, and rotation all fall out
//! of the relist. An identity change under an unchanged path re-seeks
//! implicitly through the position store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender, SendOrStop};
use crate::tailer::error::{Result, TailError};
use crate::tailer::glob::{expand_globs, match_any, Glob};
use crate::tailer::position::{file_identity, PositionStore};
use crate::tailer::reader::{FileReader, ReadOutcome};
use crate::tailer::{Line, Tail, LINES_CHANNEL_CAPACITY, ERRORS_CHANNEL_CAPACITY};

#[derive(Clone)]
pub struct PollConfig {
    pub include: Vec<Glob>,
    pub exclude: Vec<Glob>,
    pub poll_interval: Duration,
    pub fail_on_missing_file: bool,
}

pub struct PollingTailer {
    lines: BoundedReceiver<Line>,
    errors: BoundedReceiver<TailError>,
    done: flume::Sender<()>,
    terminated: flume::Receiver<()>,
    closed: AtomicBool,
}

/// Validate the glob base directories and start the poller actor.
pub fn run_polling_tailer(
    config: PollConfig,
    store: Arc<dyn PositionStore>,
) -> Result<PollingTailer> {
    let dirs = expand_globs(&config.include)?;

    let (lines_tx, lines_rx) = bounded::<Line>(LINES_CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = bounded::<TailError>(ERRORS_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = flume::bounded::<()>(1);
    let (terminated_tx, terminated_rx) = flume::bounded::<()>(1);

    info!(
        include = ?config.include.iter().map(Glob::as_str).collect::<Vec<_>>(),
        poll_interval = ?config.poll_interval,
        "starting polling tailer"
    );

    let poller = Poller {
        config,
        dirs,
        store,
        readers: HashMap::new(),
        lines: lines_tx,
        errors: errors_tx,
        done: done_rx,
    };

    std::thread::Builder::new()
        .name("tailmet-poller".into())
        .spawn(move || poller.run(terminated_tx))
        .map_err(|e| {
            TailError::unspecified("spawn poller failed").with_cause(std::io::Error::other(e))
        })?;

    Ok(PollingTailer {
        lines: lines_rx,
        errors: errors_rx,
        done: done_tx,
        terminated: terminated_rx,
        closed: AtomicBool::new(false),
    })
}

impl Tail for PollingTailer {
    fn lines(&self) -> BoundedReceiver<Line> {
        self.lines.clone()
    }

    fn errors(&self) -> BoundedReceiver<TailError> {
        self.errors.clone()
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done.send(());
        let _ = self.terminated.recv();
    }
}

impl Drop for PollingTailer {
    fn drop(&mut self) {
        self.close();
    }
}

struct Poller {
    config: PollConfig,
    dirs: HashSet<PathBuf>,
    store: Arc<dyn PositionStore>,
    readers: HashMap<PathBuf, FileReader>,
    lines: BoundedSender<Line>,
    errors: BoundedSender<TailError>,
    done: flume::Receiver<()>,
}

impl Poller {
    fn run(mut self, terminated: flume::Sender<()>) {
        loop {
            match self.done.recv_timeout(self.config.poll_interval) {
                Err(flume::RecvTimeoutError::Timeout) => {
                    if self.sync().is_break() {
                        break;
                    }
                }
                // close() fired or the handle was dropped
                _ => break,
            }
        }
        debug!("poller terminated");
        drop(self.lines);
        drop(self.errors);
        let _ = terminated.send(());
    }

    /// One tick: re-list every watched directory, reconcile the reader set,
    /// then drain each reader to EOF. Break means a stop was observed while
    /// emitting.
    fn sync(&mut self) -> ControlFlow<()> {
        let mut current: HashMap<PathBuf, FileReader> = HashMap::new();

        for dir in self.dirs.clone() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    let err = TailError::unspecified(format!("read dir {} failed", dir.display()))
                        .with_cause(e)
                        .with_field("component", "poller")
                        .with_field("dir", dir.display().to_string());
                    self.report(err)?;
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !match_any(&path, &self.config.include, &self.config.exclude) {
                    continue;
                }
                if !fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
                    continue;
                }

                // Keep the open reader when the inode is unchanged; a swapped
                // file under the same name gets a fresh reader (and a fresh
                // seek through the position store).
                if let Some(reader) = self.readers.remove(&path) {
                    let same = file_identity(&path)
                        .map(|id| id == reader.identity())
                        .unwrap_or(false);
                    if same {
                        current.insert(path, reader);
                        continue;
                    }
                }

                match FileReader::open(&path, self.store.clone()) {
                    Ok(reader) => {
                        current.insert(path, reader);
                    }
                    Err(e) => {
                        let err =
                            TailError::from_open(&path, e, self.config.fail_on_missing_file)
                                .with_field("component", "poller")
                                .with_field("path", path.display().to_string());
                        self.report(err)?;
                    }
                }
            }
        }

        self.readers = current;

        let mut failed: Vec<PathBuf> = Vec::new();
        let paths: Vec<PathBuf> = self.readers.keys().cloned().collect();
        for path in paths {
            let mut drained = Ok(());
            if let Some(reader) = self.readers.get_mut(&path) {
                drained = drain_reader(reader, &self.lines, &self.done);
            }
            match drained {
                Ok(()) => {}
                Err(DrainStop::Stopped) => return ControlFlow::Break(()),
                Err(DrainStop::ReadError(e)) => {
                    let err =
                        TailError::unspecified(format!("read file {} failed", path.display()))
                            .with_cause(e)
                            .with_field("component", "poller")
                            .with_field("path", path.display().to_string());
                    failed.push(path);
                    self.report(err)?;
                }
            }
        }
        for path in failed {
            self.readers.remove(&path);
        }

        ControlFlow::Continue(())
    }

    fn report(&self, err: TailError) -> ControlFlow<()> {
        match self.errors.send_or_stop(err, &self.done) {
            SendOrStop::Sent => ControlFlow::Continue(()),
            _ => ControlFlow::Break(()),
        }
    }
}

enum DrainStop {
    Stopped,
    ReadError(std::io::Error),
}

fn drain_reader(
    reader: &mut FileReader,
    lines: &BoundedSender<Line>,
    done: &flume::Receiver<()>,
) -> std::result::Result<(), DrainStop> {
    if let Err(e) = reader.reseek_if_truncated() {
        return Err(DrainStop::ReadError(e));
    }
    loop {
        match reader.read_line() {
            Ok(ReadOutcome::Line(line)) => match lines.send_or_stop(line, done) {
                SendOrStop::Sent => {}
                _ => return Err(DrainStop::Stopped),
            },
            Ok(ReadOutcome::Eof) => return Ok(()),
            Err(e) => return Err(DrainStop::ReadError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailer::glob::globs_from_patterns;
    use crate::tailer::position::MemoryPositionStore;
    use std::io::Write;
    use tempfile::TempDir;

    const TICK: Duration = Duration::from_millis(25);
    const WAIT: Duration = Duration::from_secs(5);

    fn start(
        dir: &TempDir,
        store: Arc<dyn PositionStore>,
    ) -> PollingTailer {
        let include = globs_from_patterns(&[format!("{}/*.log", dir.path().display())]).unwrap();
        run_polling_tailer(
            PollConfig {
                include,
                exclude: vec![],
                poll_interval: TICK,
                fail_on_missing_file: false,
            },
            store,
        )
        .unwrap()
    }

    fn append(path: &std::path::Path, content: &[u8]) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(content).unwrap();
    }

    #[test]
    fn picks_up_new_file_and_emits_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let mut tailer = start(&dir, store.clone());
        let lines = tailer.lines();

        let path = dir.path().join("a.log");
        append(&path, b"hello\nworld\n");

        let first = lines.recv_timeout(WAIT).unwrap();
        assert_eq!(first.text, "hello");
        assert_eq!(first.path, path);
        let second = lines.recv_timeout(WAIT).unwrap();
        assert_eq!(second.text, "world");

        let identity = file_identity(&path).unwrap();
        assert_eq!(store.get(&identity), 12);

        tailer.close();
    }

    #[test]
    fn restart_resumes_without_replay() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let path = dir.path().join("a.log");
        append(&path, b"hello\nworld\n");

        {
            let mut tailer = start(&dir, store.clone());
            let lines = tailer.lines();
            lines.recv_timeout(WAIT).unwrap();
            lines.recv_timeout(WAIT).unwrap();
            tailer.close();
        }

        append(&path, b"again\n");

        let mut tailer = start(&dir, store.clone());
        let lines = tailer.lines();
        let line = lines.recv_timeout(WAIT).unwrap();
        assert_eq!(line.text, "again");
        // no replay of the first two lines
        assert!(lines.recv_timeout(Duration::from_millis(200)).is_none());
        tailer.close();
    }

    #[test]
    fn replaced_file_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let path = dir.path().join("a.log");
        append(&path, b"one\n");

        let mut tailer = start(&dir, store.clone());
        let lines = tailer.lines();
        assert_eq!(lines.recv_timeout(WAIT).unwrap().text, "one");

        // rotate away and write a brand new file under the same name
        fs::rename(&path, dir.path().join("a.old")).unwrap();
        append(&path, b"two\n");

        assert_eq!(lines.recv_timeout(WAIT).unwrap().text, "two");
        tailer.close();
    }

    #[test]
    fn close_is_idempotent_and_closes_channels() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let mut tailer = start(&dir, store);
        let lines = tailer.lines();
        let errors = tailer.errors();

        tailer.close();
        tailer.close();

        assert!(lines.recv_timeout(Duration::from_millis(200)).is_none());
        assert!(errors.try_recv().is_none());
        assert!(lines.is_closed());
    }

    #[test]
    fn missing_base_directory_is_a_startup_error() {
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let include = globs_from_patterns(&["/no/such/dir/*.log".to_string()]).unwrap();
        let err = run_polling_tailer(
            PollConfig {
                include,
                exclude: vec![],
                poll_interval: TICK,
                fail_on_missing_file: false,
            },
            store,
        )
        .err()
        .unwrap();
        assert_eq!(
            err.kind(),
            crate::tailer::error::ErrorKind::DirectoryNotFound
        );
    }

    #[test]
    fn excluded_files_are_not_tailed() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new());
        let include = globs_from_patterns(&[format!("{}/*.log", dir.path().display())]).unwrap();
        let exclude =
            globs_from_patterns(&[format!("{}/skip.log", dir.path().display())]).unwrap();

        let mut tailer = run_polling_tailer(
            PollConfig {
                include,
                exclude,
                poll_interval: TICK,
                fail_on_missing_file: false,
            },
            store,
        )
        .unwrap();
        let lines = tailer.lines();

        append(&dir.path().join("skip.log"), b"ignored\n");
        append(&dir.path().join("keep.log"), b"kept\n");

        let line = lines.recv_timeout(WAIT).unwrap();
        assert_eq!(line.text, "kept");
        assert!(lines.recv_timeout(Duration::from_millis(200)).is_none());
        tailer.close();
    }
}
