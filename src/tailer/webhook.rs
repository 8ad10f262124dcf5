// SPDX-License-Identifier: Apache-2.0

//! Webhook tailer: a foreign-driven pusher. The HTTP server mounts the
//! handler at the configured path; each acceptable request body is converted
//! to lines and delivered through the standard channels, with the channel
//! bound providing back-pressure to the HTTP client.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::tailer::error::TailError;
use crate::tailer::{Line, Tail, ERRORS_CHANNEL_CAPACITY, LINES_CHANNEL_CAPACITY};

/// How a request body maps to lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    /// The whole body is one line.
    TextSingle,
    /// The body is split on newlines.
    TextBulk,
}

#[derive(Clone)]
struct Senders {
    lines: BoundedSender<Line>,
    errors: BoundedSender<TailError>,
}

/// Converts request bodies to lines. Clonable; the HTTP server owns a copy.
#[derive(Clone)]
pub struct WebhookHandler {
    format: WebhookFormat,
    label: PathBuf,
    senders: Arc<RwLock<Option<Senders>>>,
}

impl WebhookHandler {
    /// Deliver a request body. Returns the number of lines accepted; an
    /// error when the body is not UTF-8 or the tailer has been closed.
    pub async fn accept(&self, body: &[u8]) -> Result<usize, TailError> {
        // Clone the senders out so the lock is not held across a send.
        let senders = match self.senders.read().unwrap().clone() {
            Some(senders) => senders,
            None => return Err(TailError::unspecified("webhook tailer is closed")),
        };

        let text = match std::str::from_utf8(body) {
            Ok(text) => text,
            Err(e) => {
                let _ = senders
                    .errors
                    .send(
                        TailError::unspecified("webhook body is not valid UTF-8")
                            .with_field("component", "webhook")
                            .with_field("detail", e.to_string()),
                    )
                    .await;
                return Err(TailError::unspecified("webhook body is not valid UTF-8"));
            }
        };

        let mut accepted = 0;
        match self.format {
            WebhookFormat::TextSingle => {
                let text = text.trim_end_matches(['\n', '\r']);
                if !text.is_empty() {
                    self.deliver(&senders, text).await?;
                    accepted = 1;
                }
            }
            WebhookFormat::TextBulk => {
                for line in text.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    self.deliver(&senders, line).await?;
                    accepted += 1;
                }
            }
        }
        Ok(accepted)
    }

    async fn deliver(&self, senders: &Senders, text: &str) -> Result<(), TailError> {
        let line = Line {
            path: self.label.clone(),
            text: text.trim_end_matches('\r').to_string(),
        };
        senders
            .lines
            .send(line)
            .await
            .map_err(|_| TailError::unspecified("webhook line channel closed"))
    }
}

pub struct WebhookTailer {
    lines: BoundedReceiver<Line>,
    errors: BoundedReceiver<TailError>,
    handler: WebhookHandler,
    closed: AtomicBool,
}

impl WebhookTailer {
    /// `mount_path` doubles as the `path` label on emitted lines.
    pub fn new(mount_path: &str, format: WebhookFormat) -> Self {
        let (lines_tx, lines_rx) = bounded::<Line>(LINES_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = bounded::<TailError>(ERRORS_CHANNEL_CAPACITY);

        let handler = WebhookHandler {
            format,
            label: PathBuf::from(mount_path),
            senders: Arc::new(RwLock::new(Some(Senders {
                lines: lines_tx,
                errors: errors_tx,
            }))),
        };

        Self {
            lines: lines_rx,
            errors: errors_rx,
            handler,
            closed: AtomicBool::new(false),
        }
    }

    /// The request handler to be mounted at the configured path.
    pub fn handler(&self) -> WebhookHandler {
        self.handler.clone()
    }
}

impl Tail for WebhookTailer {
    fn lines(&self) -> BoundedReceiver<Line> {
        self.lines.clone()
    }

    fn errors(&self) -> BoundedReceiver<TailError> {
        self.errors.clone()
    }

    /// Dropping the senders disconnects both channels; in-flight requests
    /// fail and later ones are rejected.
    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.senders.write().unwrap().take();
    }
}
