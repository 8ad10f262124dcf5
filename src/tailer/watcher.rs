// SPDX-License-Identifier: Apache-2.0

//! Event-driven tailer: subscribes to kernel file-system notifications on the
//! watched directories and starts/stops reader actors as files appear,
//! disappear, or go quiet.
//!
//! Event decoding contract:
//! - CREATE: start a reader when the path matches the globs
//! - CHMOD:  probe open-for-read; stop the reader on permission denied
//! - RENAME: stop the reader, keep its persisted offset
//! - REMOVE: stop the reader, delete its persisted offset
//!
//! Readers follow their file by polling at EOF (see `reader.rs`), so content
//! appearing behind a previously dangling symlink is still picked up.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender, SendOrStop};
use crate::tailer::error::{Result, TailError};
use crate::tailer::glob::{expand_globs, match_any, Glob};
use crate::tailer::position::PositionStore;
use crate::tailer::reader::{spawn_reader, FileReader, ReaderContext, ReaderHandle};
use crate::tailer::{Line, Tail, ERRORS_CHANNEL_CAPACITY, LINES_CHANNEL_CAPACITY};

#[derive(Clone)]
pub struct WatchConfig {
    pub include: Vec<Glob>,
    pub exclude: Vec<Glob>,
    /// Cadence at which readers re-check their file after EOF.
    pub follow_interval: Duration,
    /// Readers quiet for this long are stopped, offset preserved. Zero
    /// disables the sweep.
    pub idle_timeout: Duration,
    pub fail_on_missing_file: bool,
}

pub struct WatchTailer {
    lines: BoundedReceiver<Line>,
    errors: BoundedReceiver<TailError>,
    done: flume::Sender<()>,
    terminated: flume::Receiver<()>,
    closed: AtomicBool,
}

/// Validate the glob base directories, subscribe to file-system events on
/// them, and start the watcher actor. Failure to construct the event source
/// is a startup error.
pub fn run_file_tailer(config: WatchConfig, store: Arc<dyn PositionStore>) -> Result<WatchTailer> {
    let dirs = expand_globs(&config.include)?;

    let (event_tx, event_rx) = flume::unbounded::<notify::Result<notify::Event>>();
    let mut fs_watcher = notify::recommended_watcher(move |res| {
        let _ = event_tx.send(res);
    })
    .map_err(|e| {
        TailError::unspecified("create file-system watcher failed")
            .with_cause(io::Error::other(e))
    })?;

    for dir in &dirs {
        fs_watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                TailError::unspecified(format!("watch dir {} failed", dir.display()))
                    .with_cause(io::Error::other(e))
            })?;
    }

    let (lines_tx, lines_rx) = bounded::<Line>(LINES_CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = bounded::<TailError>(ERRORS_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = flume::bounded::<()>(1);
    let (terminated_tx, terminated_rx) = flume::bounded::<()>(1);

    info!(
        include = ?config.include.iter().map(Glob::as_str).collect::<Vec<_>>(),
        idle_timeout = ?config.idle_timeout,
        "starting file tailer"
    );

    let watcher = Watcher {
        config,
        dirs,
        store,
        readers: HashMap::new(),
        lines: lines_tx,
        errors: errors_tx,
        done: done_rx,
        event_rx,
        _event_hold: None,
        _fs_watcher: fs_watcher,
    };

    std::thread::Builder::new()
        .name("tailmet-watcher".into())
        .spawn(move || watcher.run(terminated_tx))
        .map_err(|e| {
            TailError::unspecified("spawn watcher failed").with_cause(io::Error::other(e))
        })?;

    Ok(WatchTailer {
        lines: lines_rx,
        errors: errors_rx,
        done: done_tx,
        terminated: terminated_rx,
        closed: AtomicBool::new(false),
    })
}

impl Tail for WatchTailer {
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

impl Drop for WatchTailer {
    fn drop(&mut self) {
        self.close();
    }
}

enum Wake {
    Event(notify::Result<notify::Event>),
    EventsGone,
    Done,
}

struct Watcher {
    config: WatchConfig,
    dirs: HashSet<PathBuf>,
    store: Arc<dyn PositionStore>,
    readers: HashMap<PathBuf, ReaderHandle>,
    lines: BoundedSender<Line>,
    errors: BoundedSender<TailError>,
    done: flume::Receiver<()>,
    event_rx: flume::Receiver<notify::Result<notify::Event>>,
    /// Keeps a replacement channel alive after the notify backend dies, so
    /// the select below parks instead of spinning on a disconnected channel.
    _event_hold: Option<flume::Sender<notify::Result<notify::Event>>>,
    _fs_watcher: RecommendedWatcher,
}

impl Watcher {
    fn run(mut self, terminated: flume::Sender<()>) {
        if self.scan_existing().is_break() {
            return self.shutdown(terminated);
        }

        let sweep_enabled = !self.config.idle_timeout.is_zero();
        let mut next_sweep = Instant::now() + self.config.idle_timeout;

        loop {
            let wake = {
                let selector = flume::Selector::new()
                    .recv(&self.event_rx, |r| match r {
                        Ok(ev) => Wake::Event(ev),
                        Err(_) => Wake::EventsGone,
                    })
                    .recv(&self.done, |_| Wake::Done);
                if sweep_enabled {
                    let timeout = next_sweep.saturating_duration_since(Instant::now());
                    selector.wait_timeout(timeout).ok()
                } else {
                    Some(selector.wait())
                }
            };

            match wake {
                Some(Wake::Done) => break,
                Some(Wake::Event(Ok(event))) => {
                    debug!(?event, "received fs event");
                    if self.handle_event(event).is_break() {
                        break;
                    }
                }
                Some(Wake::Event(Err(e))) => {
                    let err = TailError::unspecified("file-system watcher error")
                        .with_cause(io::Error::other(e))
                        .with_field("component", "watcher");
                    if self.report(err).is_break() {
                        break;
                    }
                }
                Some(Wake::EventsGone) => {
                    warn!("file-system event stream closed; continuing with followers only");
                    let (hold_tx, hold_rx) = flume::unbounded();
                    self.event_rx = hold_rx;
                    self._event_hold = Some(hold_tx);
                }
                // sweep tick
                None => {
                    self.sweep_idle();
                    next_sweep = Instant::now() + self.config.idle_timeout;
                }
            }
        }

        self.shutdown(terminated)
    }

    /// Stop every reader (two-phase), close the output channels, confirm.
    fn shutdown(mut self, terminated: flume::Sender<()>) {
        for (_, mut handle) in self.readers.drain() {
            handle.stop(false);
        }
        debug!("watcher terminated");
        drop(self.lines);
        drop(self.errors);
        let _ = terminated.send(());
    }

    /// Seed readers for the files already present in the watched directories.
    fn scan_existing(&mut self) -> ControlFlow<()> {
        for dir in self.dirs.clone() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    let err = TailError::unspecified(format!("read dir {} failed", dir.display()))
                        .with_cause(e)
                        .with_field("component", "watcher")
                        .with_field("dir", dir.display().to_string());
                    self.report(err)?;
                    continue;
                }
            };
            for entry in entries.flatten() {
                self.maybe_watch(&entry.path())?;
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: notify::Event) -> ControlFlow<()> {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.maybe_watch(path)?;
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {
                for path in &event.paths {
                    self.probe_readable(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::From => {
                    if let Some(path) = event.paths.first() {
                        self.unwatch(path, false);
                    }
                }
                RenameMode::To => {
                    if let Some(path) = event.paths.first() {
                        self.maybe_watch(path)?;
                    }
                }
                RenameMode::Both => {
                    if let [from, to, ..] = event.paths.as_slice() {
                        self.unwatch(from, false);
                        self.maybe_watch(to)?;
                    }
                }
                _ => {
                    for path in &event.paths {
                        if path.exists() {
                            self.maybe_watch(path)?;
                        } else {
                            self.unwatch(path, false);
                        }
                    }
                }
            },
            // Data writes on a path we stopped tracking (idle sweep) bring
            // the reader back; for tracked paths this is a no-op.
            EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                for path in &event.paths {
                    self.maybe_watch(path)?;
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.unwatch(path, true);
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    /// Start a reader for `path` unless it is filtered out, already tracked,
    /// or its identity is already served by another reader.
    fn maybe_watch(&mut self, path: &Path) -> ControlFlow<()> {
        if !match_any(path, &self.config.include, &self.config.exclude) {
            return ControlFlow::Continue(());
        }
        if self.readers.contains_key(path) {
            return ControlFlow::Continue(());
        }
        if !fs::metadata(path).map(|m| m.is_file()).unwrap_or(false) {
            return ControlFlow::Continue(());
        }

        let reader = match FileReader::open(path, self.store.clone()) {
            Ok(reader) => reader,
            Err(e) => {
                let err = TailError::from_open(path, e, self.config.fail_on_missing_file)
                    .with_field("component", "watcher")
                    .with_field("path", path.display().to_string());
                return self.report(err);
            }
        };

        if self
            .readers
            .values()
            .any(|h| h.identity() == reader.identity())
        {
            debug!(path = %path.display(), identity = %reader.identity(), "identity already tailed, skipping");
            return ControlFlow::Continue(());
        }

        info!(path = %path.display(), offset = reader.offset(), "tailing new file");
        match spawn_reader(
            reader,
            ReaderContext {
                lines: self.lines.clone(),
                errors: self.errors.clone(),
                follow_interval: self.config.follow_interval,
            },
        ) {
            Ok(handle) => {
                self.readers.insert(path.to_path_buf(), handle);
                ControlFlow::Continue(())
            }
            Err(e) => {
                let err = TailError::unspecified(format!(
                    "start reader for {} failed",
                    path.display()
                ))
                .with_cause(e)
                .with_field("component", "watcher");
                self.report(err)
            }
        }
    }

    /// CHMOD probe: a file that can no longer be opened for reading loses its
    /// reader; the persisted offset stays.
    fn probe_readable(&mut self, path: &Path) {
        if !match_any(path, &self.config.include, &self.config.exclude) {
            return;
        }
        if !self.readers.contains_key(path) {
            return;
        }
        if let Err(e) = File::open(path) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                info!(path = %path.display(), "file no longer readable");
                self.unwatch(path, false);
            }
        }
    }

    fn unwatch(&mut self, path: &Path, delete_position: bool) {
        if let Some(mut handle) = self.readers.remove(path) {
            info!(path = %path.display(), delete_position, "unwatch file");
            handle.stop(delete_position);
        }
    }

    /// Stop readers whose last read is older than the idle timeout. Offsets
    /// are preserved; a later write re-opens the file at the stored offset.
    fn sweep_idle(&mut self) {
        let idle_timeout = self.config.idle_timeout;
        let idle: Vec<PathBuf> = self
            .readers
            .iter()
            .filter(|(_, h)| h.idle_for() >= idle_timeout)
            .map(|(p, _)| p.clone())
            .collect();
        for path in idle {
            if let Some(mut handle) = self.readers.remove(&path) {
                info!(path = %path.display(), "unwatch idle file");
                handle.stop(false);
            }
        }
    }

    fn report(&self, err: TailError) -> ControlFlow<()> {
        match self.errors.send_or_stop(err, &self.done) {
            SendOrStop::Sent => ControlFlow::Continue(()),
            _ => ControlFlow::Break(()),
        }
    }
}
