// SPDX-License-Identifier: Apache-2.0

//! Tailing subsystem.
//!
//! A tailer discovers inputs (glob-matched files, stdin, or an HTTP webhook),
//! owns one reader actor per input, and multiplexes everything into a single
//! `lines` stream next to an `errors` stream. Offsets are persisted per file
//! identity (device + inode) so a restart neither re-ingests nor skips.
//!
//! Shutdown is two-phase everywhere: `close()` signals `done`, waits for each
//! actor's confirmation, then closes the output channels.

pub mod buffered;
pub mod error;
pub mod glob;
pub mod line_buffer;
pub mod poller;
pub mod position;
pub mod reader;
pub mod stdin;
pub mod watcher;
pub mod webhook;

use std::path::PathBuf;

use crate::bounded_channel::BoundedReceiver;

pub use buffered::{BufferObserver, BufferedTailer, NoopObserver};
pub use error::{ErrorKind, TailError};
pub use glob::Glob;
pub use line_buffer::LineBuffer;
pub use poller::{run_polling_tailer, PollConfig, PollingTailer};
pub use position::{FilePositionStore, MemoryPositionStore, PositionStore};
pub use stdin::{run_stdin_tailer, StdinTailer};
pub use watcher::{run_file_tailer, WatchConfig, WatchTailer};
pub use webhook::{WebhookFormat, WebhookHandler, WebhookTailer};

pub(crate) const LINES_CHANNEL_CAPACITY: usize = 1024;
pub(crate) const ERRORS_CHANNEL_CAPACITY: usize = 64;

/// One log line, labeled with the path through which it was observed (which
/// may differ from the canonical path after a rename). The text carries no
/// trailing `\n` or `\r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub path: PathBuf,
    pub text: String,
}

/// Capability set common to every tailer variant.
///
/// The receivers are clonable handles onto the tailer's output channels;
/// after `close()` returns both channels are closed and no reader thread
/// remains runnable.
pub trait Tail: Send {
    fn lines(&self) -> BoundedReceiver<Line>;
    fn errors(&self) -> BoundedReceiver<TailError>;
    /// Blocking and idempotent.
    fn close(&mut self);
}
