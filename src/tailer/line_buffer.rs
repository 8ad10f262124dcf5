// SPDX-License-Identifier: Apache-2.0

//! Thread-safe FIFO draining a tailer's output into downstream consumers.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::tailer::Line;

struct Inner {
    queue: VecDeque<Line>,
    closed: bool,
}

/// Closable line queue. Capacity 0 means unbounded; with a finite capacity
/// `push` blocks until space is available, which is what applies
/// back-pressure to the producing readers.
pub struct LineBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append a line, blocking while the buffer is full. A push after
    /// `close()` is a no-op.
    pub fn push(&self, line: Line) {
        let mut inner = self.inner.lock().unwrap();
        if self.capacity > 0 {
            while !inner.closed && inner.queue.len() >= self.capacity {
                inner = self.not_full.wait(inner).unwrap();
            }
        }
        if !inner.closed {
            inner.queue.push_back(line);
            self.not_empty.notify_one();
        }
    }

    /// Wait for the next line. Once `close()` has been called the remaining
    /// queue drains first, then every popper observes `None`; lines already
    /// accepted are never dropped.
    pub fn blocking_pop(&self) -> Option<Line> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(line) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Some(line);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        self.not_full.notify_all();
    }

    /// Wake every blocked pusher and popper; poppers observe `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.closed = true;
            self.not_empty.notify_all();
            self.not_full.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn line(text: &str) -> Line {
        Line {
            path: PathBuf::from("/var/log/a.log"),
            text: text.to_string(),
        }
    }

    #[test]
    fn fifo_order() {
        let buf = LineBuffer::new(0);
        buf.push(line("one"));
        buf.push(line("two"));
        buf.push(line("three"));

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.blocking_pop().unwrap().text, "one");
        assert_eq!(buf.blocking_pop().unwrap().text, "two");
        assert_eq!(buf.blocking_pop().unwrap().text, "three");
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn close_wakes_blocked_popper() {
        let buf = Arc::new(LineBuffer::new(0));
        let popper = {
            let buf = buf.clone();
            std::thread::spawn(move || buf.blocking_pop())
        };

        std::thread::sleep(Duration::from_millis(50));
        buf.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn queued_lines_drain_before_close_is_observed() {
        let buf = LineBuffer::new(0);
        buf.push(line("queued"));
        buf.close();
        assert_eq!(buf.blocking_pop().unwrap().text, "queued");
        assert!(buf.blocking_pop().is_none());
    }

    #[test]
    fn push_after_close_is_noop() {
        let buf = LineBuffer::new(0);
        buf.close();
        buf.push(line("dropped"));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn bounded_push_blocks_until_pop() {
        let buf = Arc::new(LineBuffer::new(2));
        buf.push(line("a"));
        buf.push(line("b"));

        let pusher = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                buf.push(line("c"));
            })
        };

        // Producer is blocked while the buffer is at capacity.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(buf.len(), 2);

        assert_eq!(buf.blocking_pop().unwrap().text, "a");
        pusher.join().unwrap();
        assert_eq!(buf.blocking_pop().unwrap().text, "b");
        assert_eq!(buf.blocking_pop().unwrap().text, "c");
    }

    #[test]
    fn close_releases_blocked_pusher() {
        let buf = Arc::new(LineBuffer::new(1));
        buf.push(line("a"));

        let pusher = {
            let buf = buf.clone();
            std::thread::spawn(move || {
                buf.push(line("b"));
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        buf.close();
        pusher.join().unwrap();
    }

    #[test]
    fn clear_empties_queue() {
        let buf = LineBuffer::new(0);
        buf.push(line("a"));
        buf.push(line("b"));
        buf.clear();
        assert!(buf.is_empty());
    }
}
