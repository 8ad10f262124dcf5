// SPDX-License-Identifier: Apache-2.0

//! Bounded channel usable from both dedicated OS threads and async tasks.
//!
//! Reader actors run on plain threads and must pair every send with their
//! stop signal; the consumer side of the same channel is polled from the
//! tokio runtime. flume supports blocking and async operation on one channel,
//! so no bridge thread is needed.

use flume::{Receiver, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

/// Outcome of a send paired with a stop signal.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOrStop<S> {
    /// The item was delivered.
    Sent,
    /// All receivers are gone; the item was dropped.
    Disconnected,
    /// The stop signal fired before the item could be delivered.
    Stopped(S),
}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send - blocks until there is capacity in the channel.
    /// Use this from non-async contexts (e.g., dedicated OS threads).
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        match self.tx.send(item) {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Blocking send paired with a stop signal: waits on whichever of
    /// {delivery, stop} happens first. Every suspension point of a reader
    /// actor goes through here so that shutdown is prompt even when the
    /// consumer has stalled.
    pub fn send_or_stop<S>(&self, item: T, stop: &Receiver<S>) -> SendOrStop<S> {
        flume::Selector::new()
            .send(&self.tx, item, |res| match res {
                Ok(()) => SendOrStop::Sent,
                Err(_) => SendOrStop::Disconnected,
            })
            .recv(stop, |res| match res {
                Ok(signal) => SendOrStop::Stopped(signal),
                // The stop controller is gone; treat it as a plain stop so
                // the actor can still wind down.
                Err(_) => SendOrStop::Disconnected,
            })
            .wait()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Blocking receive - blocks until an item is available.
    /// Use this from non-async contexts (e.g., dedicated OS threads).
    pub fn recv_blocking(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with timeout - blocks until an item is available or timeout.
    /// Returns None if timeout expires or channel is disconnected.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// True once every sender is gone and the buffer has drained.
    pub fn is_closed(&self) -> bool {
        self.rx.is_disconnected() && self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}
