// SPDX-License-Identifier: Apache-2.0

//! Stdin tailer: a single reader over standard input. No position tracking
//! and no identity; lines are labeled with the pseudo-path `-`.

use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::bounded_channel::{bounded, BoundedReceiver, SendOrStop};
use crate::tailer::error::TailError;
use crate::tailer::{Line, Tail, ERRORS_CHANNEL_CAPACITY, LINES_CHANNEL_CAPACITY};

pub struct StdinTailer {
    lines: BoundedReceiver<Line>,
    errors: BoundedReceiver<TailError>,
    done: flume::Sender<()>,
    terminated: flume::Receiver<()>,
    closed: AtomicBool,
}

pub fn run_stdin_tailer() -> StdinTailer {
    run_input_tailer(io::stdin(), "-")
}

/// Tail any byte stream. Split out from stdin so tests can drive it with an
/// in-memory reader.
pub fn run_input_tailer<R>(input: R, label: &str) -> StdinTailer
where
    R: Read + Send + 'static,
{
    let (lines_tx, lines_rx) = bounded::<Line>(LINES_CHANNEL_CAPACITY);
    let (errors_tx, errors_rx) = bounded::<TailError>(ERRORS_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = flume::bounded::<()>(1);
    let (terminated_tx, terminated_rx) = flume::bounded::<()>(1);

    let path = PathBuf::from(label);
    std::thread::Builder::new()
        .name("tailmet-stdin".into())
        .spawn(move || {
            let mut reader = BufReader::new(input);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break, // EOF: the stream is finished, not growing
                    Ok(_) => {
                        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                            buf.pop();
                        }
                        let line = Line {
                            path: path.clone(),
                            text: String::from_utf8_lossy(&buf).into_owned(),
                        };
                        match lines_tx.send_or_stop(line, &done_rx) {
                            SendOrStop::Sent => {}
                            _ => break,
                        }
                    }
                    Err(e) => {
                        let err = TailError::unspecified("read stdin failed")
                            .with_cause(e)
                            .with_field("component", "stdin");
                        match errors_tx.send_or_stop(err, &done_rx) {
                            SendOrStop::Sent => {}
                            _ => break,
                        }
                        break;
                    }
                }
            }
            debug!("stdin tailer terminated");
            drop(lines_tx);
            drop(errors_tx);
            let _ = terminated_tx.send(());
        })
        .expect("spawn stdin tailer");

    StdinTailer {
        lines: lines_rx,
        errors: errors_rx,
        done: done_tx,
        terminated: terminated_rx,
        closed: AtomicBool::new(false),
    }
}

impl Tail for StdinTailer {
    fn lines(&self) -> BoundedReceiver<Line> {
        self.lines.clone()
    }

    fn errors(&self) -> BoundedReceiver<TailError> {
        self.errors.clone()
    }

    /// A thread parked inside a blocking stdin read cannot be interrupted
    /// portably; it observes the stop signal at its next read return. The
    /// wait here is therefore bounded instead of unconditional.
    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.done.try_send(());
        let _ = self.terminated.recv_timeout(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::Path;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn emits_lines_with_dash_path() {
        let mut tailer = run_input_tailer(Cursor::new(b"one\ntwo\r\n".to_vec()), "-");
        let lines = tailer.lines();

        let line = lines.recv_timeout(WAIT).unwrap();
        assert_eq!(line.text, "one");
        assert_eq!(line.path, Path::new("-"));
        assert_eq!(lines.recv_timeout(WAIT).unwrap().text, "two");

        tailer.close();
    }

    #[test]
    fn final_unterminated_line_is_emitted_at_stream_end() {
        let mut tailer = run_input_tailer(Cursor::new(b"done\ntail".to_vec()), "-");
        let lines = tailer.lines();

        assert_eq!(lines.recv_timeout(WAIT).unwrap().text, "done");
        assert_eq!(lines.recv_timeout(WAIT).unwrap().text, "tail");
        // stream ended: channel closes
        assert!(lines.recv_timeout(WAIT).is_none());

        tailer.close();
    }

    #[test]
    fn close_is_idempotent() {
        let mut tailer = run_input_tailer(Cursor::new(Vec::new()), "-");
        tailer.close();
        tailer.close();
        assert!(tailer.lines().recv_timeout(WAIT).is_none());
    }
}
