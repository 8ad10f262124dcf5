// SPDX-License-Identifier: Apache-2.0

//! Per-file reader: opens one file at its stored offset, assembles lines,
//! and keeps the position store current.
//!
//! In the event-driven tailer each reader is an actor on a dedicated thread
//! that follows the file by polling at EOF. Edge-triggered notification alone
//! loses content for the "dangling symlink, then target appears" sequence,
//! so the inner follower always polls regardless of how the file was
//! discovered.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bounded_channel::{BoundedSender, SendOrStop};
use crate::tailer::error::TailError;
use crate::tailer::position::{identity_from_metadata, PositionStore};
use crate::tailer::Line;

/// Result of one `read_line` call.
pub enum ReadOutcome {
    Line(Line),
    /// No complete line is available. A trailing fragment without a newline
    /// is left unread until its newline arrives.
    Eof,
}

pub struct FileReader {
    reader: BufReader<File>,
    path: PathBuf,
    identity: String,
    offset: u64,
    store: Arc<dyn PositionStore>,
}

impl FileReader {
    /// Stat the path, compute its identity, open it, and seek to the stored
    /// offset. An offset beyond the current file length means the file was
    /// truncated while we were away; reading restarts from 0.
    pub fn open(path: &Path, store: Arc<dyn PositionStore>) -> io::Result<FileReader> {
        let meta = fs::metadata(path)?;
        let identity = identity_from_metadata(&meta);
        let file = File::open(path)?;

        let mut offset = store.get(&identity);
        if offset > meta.len() {
            offset = 0;
            store.set(&identity, 0);
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        debug!(path = %path.display(), identity = %identity, offset, "opened file");

        Ok(FileReader {
            reader,
            path: path.to_path_buf(),
            identity,
            offset,
            store,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete line. Multi-chunk reads are joined; the
    /// emitted text has trailing `\n` and `\r` stripped. On success the
    /// current offset is recorded in the position store.
    pub fn read_line(&mut self) -> io::Result<ReadOutcome> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(ReadOutcome::Eof);
        }
        if buf.last() != Some(&b'\n') {
            // Partial final line: rewind and wait for the newline.
            self.reader.seek_relative(-(n as i64))?;
            return Ok(ReadOutcome::Eof);
        }

        self.offset += n as u64;
        self.store.set(&self.identity, self.offset);

        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        let text = String::from_utf8_lossy(&buf).into_owned();
        Ok(ReadOutcome::Line(Line {
            path: self.path.clone(),
            text,
        }))
    }

    /// Detect truncation below the current offset and re-seek to 0.
    pub fn reseek_if_truncated(&mut self) -> io::Result<bool> {
        let len = self.reader.get_ref().metadata()?.len();
        if len < self.offset {
            debug!(path = %self.path.display(), offset = self.offset, len, "file truncated, rewinding");
            self.reader.seek(SeekFrom::Start(0))?;
            self.offset = 0;
            self.store.set(&self.identity, 0);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Channel ends a reader actor emits into, plus its control signals.
pub(crate) struct ReaderContext {
    pub lines: BoundedSender<Line>,
    pub errors: BoundedSender<TailError>,
    pub follow_interval: Duration,
}

/// Controller for a reader actor thread. Owned by the tailer that started it.
pub(crate) struct ReaderHandle {
    identity: String,
    store: Arc<dyn PositionStore>,
    last_read_at: Arc<Mutex<Instant>>,
    done: flume::Sender<bool>,
    terminated: flume::Receiver<()>,
    thread: Option<JoinHandle<()>>,
    stopped: AtomicBool,
}

impl ReaderHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Time since the actor last emitted a line.
    pub fn idle_for(&self) -> Duration {
        self.last_read_at.lock().unwrap().elapsed()
    }

    /// Signal the actor to stop and wait for its confirmation. Only the
    /// first call performs work; the file is closed on the actor's exit
    /// path.
    pub fn stop(&mut self, delete_position: bool) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done.send(delete_position);
        let _ = self.terminated.recv();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        // The actor may have exited on its own before the signal landed
        // (channel teardown); the deletion must hold either way, and `del`
        // is idempotent.
        if delete_position {
            self.store.del(&self.identity);
        }
    }
}

/// Start a reader actor on a dedicated thread.
pub(crate) fn spawn_reader(reader: FileReader, ctx: ReaderContext) -> io::Result<ReaderHandle> {
    let (done_tx, done_rx) = flume::bounded::<bool>(1);
    let (terminated_tx, terminated_rx) = flume::bounded::<()>(1);
    let last_read_at = Arc::new(Mutex::new(Instant::now()));

    let handle_identity = reader.identity.clone();
    let handle_store = reader.store.clone();
    let read_stamp = last_read_at.clone();

    let thread = std::thread::Builder::new()
        .name("tailmet-reader".into())
        .spawn(move || run_reader(reader, ctx, done_rx, terminated_tx, read_stamp))?;

    Ok(ReaderHandle {
        identity: handle_identity,
        store: handle_store,
        last_read_at,
        done: done_tx,
        terminated: terminated_rx,
        thread: Some(thread),
        stopped: AtomicBool::new(false),
    })
}

/// Actor body: Reading until EOF, Waiting on {new data, stop}, then the
/// finalize edge: close the file, optionally delete the offset, confirm
/// termination.
fn run_reader(
    mut reader: FileReader,
    ctx: ReaderContext,
    done: flume::Receiver<bool>,
    terminated: flume::Sender<()>,
    last_read_at: Arc<Mutex<Instant>>,
) {
    let identity = reader.identity.clone();
    let store = reader.store.clone();

    let mut delete_position = false;
    loop {
        match reader.read_line() {
            Ok(ReadOutcome::Line(line)) => {
                *last_read_at.lock().unwrap() = Instant::now();
                match ctx.lines.send_or_stop(line, &done) {
                    SendOrStop::Sent => {}
                    SendOrStop::Stopped(del) => {
                        delete_position = del;
                        break;
                    }
                    SendOrStop::Disconnected => break,
                }
            }
            Ok(ReadOutcome::Eof) => match done.recv_timeout(ctx.follow_interval) {
                Ok(del) => {
                    delete_position = del;
                    break;
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
                Err(flume::RecvTimeoutError::Timeout) => {
                    if let Err(e) = reader.reseek_if_truncated() {
                        let err = TailError::unspecified(format!(
                            "stat file {} failed",
                            reader.path.display()
                        ))
                        .with_cause(e)
                        .with_field("component", "reader")
                        .with_field("path", reader.path.display().to_string());
                        match ctx.errors.send_or_stop(err, &done) {
                            SendOrStop::Sent => {}
                            SendOrStop::Stopped(del) => {
                                delete_position = del;
                                break;
                            }
                            SendOrStop::Disconnected => break,
                        }
                    }
                }
            },
            Err(e) => {
                let err = TailError::unspecified(format!(
                    "read file {} failed",
                    reader.path.display()
                ))
                .with_cause(e)
                .with_field("component", "reader")
                .with_field("path", reader.path.display().to_string());
                match ctx.errors.send_or_stop(err, &done) {
                    SendOrStop::Sent => {
                        // Throttle retries to the follow interval.
                        match done.recv_timeout(ctx.follow_interval) {
                            Ok(del) => {
                                delete_position = del;
                                break;
                            }
                            Err(flume::RecvTimeoutError::Disconnected) => break,
                            Err(flume::RecvTimeoutError::Timeout) => {}
                        }
                    }
                    SendOrStop::Stopped(del) => {
                        delete_position = del;
                        break;
                    }
                    SendOrStop::Disconnected => break,
                }
            }
        }
    }

    drop(reader); // closes the file handle
    if delete_position {
        store.del(&identity);
    }
    let _ = terminated.send(());
}
