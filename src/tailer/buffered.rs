// SPDX-License-Identifier: Apache-2.0

//! Fan-in wrapper: a dedicated pump thread drains a tailer's line channel
//! into the [`LineBuffer`]; downstream consumers pop from the buffer. The
//! buffer's depth is published to an observer for metric reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::bounded_channel::BoundedReceiver;
use crate::tailer::error::TailError;
use crate::tailer::line_buffer::LineBuffer;
use crate::tailer::{Line, Tail};

const PUMP_TICK: Duration = Duration::from_millis(200);

/// Receives the buffer depth after every push and pop.
pub trait BufferObserver: Send + Sync {
    fn record(&self, len: usize);
}

/// Observer for tailers that do not report metrics.
pub struct NoopObserver;

impl BufferObserver for NoopObserver {
    fn record(&self, _len: usize) {}
}

pub struct BufferedTailer {
    upstream: Mutex<Box<dyn Tail>>,
    buffer: Arc<LineBuffer>,
    observer: Arc<dyn BufferObserver>,
    errors: BoundedReceiver<TailError>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BufferedTailer {
    /// Capacity 0 keeps the buffer unbounded; a positive capacity makes the
    /// pump (and transitively every reader) block when the consumer falls
    /// behind.
    pub fn new(
        upstream: Box<dyn Tail>,
        capacity: usize,
        observer: Arc<dyn BufferObserver>,
    ) -> Self {
        let buffer = Arc::new(LineBuffer::new(capacity));
        let errors = upstream.errors();
        let lines = upstream.lines();

        let pump = {
            let buffer = buffer.clone();
            let observer = observer.clone();
            std::thread::Builder::new()
                .name("tailmet-buffer".into())
                .spawn(move || {
                    // The periodic wake keeps the pump joinable even for
                    // upstreams whose channel cannot disconnect promptly
                    // (a thread parked in a blocking stdin read).
                    loop {
                        if buffer.is_closed() {
                            break;
                        }
                        match lines.recv_timeout(PUMP_TICK) {
                            Some(line) => {
                                buffer.push(line);
                                observer.record(buffer.len());
                            }
                            None => {
                                if lines.is_closed() {
                                    // upstream finished: the drain is complete
                                    buffer.close();
                                    break;
                                }
                            }
                        }
                    }
                    debug!("line buffer pump terminated");
                })
                .expect("spawn buffer pump")
        };

        Self {
            upstream: Mutex::new(upstream),
            buffer,
            observer,
            errors,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait for the next line; `None` once the tailer has been closed and
    /// the buffer has drained.
    pub fn pop(&self) -> Option<Line> {
        let line = self.buffer.blocking_pop();
        self.observer.record(self.buffer.len());
        line
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn errors(&self) -> BoundedReceiver<TailError> {
        self.errors.clone()
    }

    /// Close the upstream tailer first (stops all readers), then the buffer
    /// (wakes consumers and a possibly blocked pump), then join the pump.
    /// Blocking and idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.upstream.lock().unwrap().close();
        self.buffer.close();
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
    }
}

impl Drop for BufferedTailer {
    fn drop(&mut self) {
        self.close();
    }
}
