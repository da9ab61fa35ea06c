//! Non-blocking event emitter.
//!
//! `emit()` uses `try_send` on a bounded crossbeam channel. When the buffer
//! is full or the drain has gone away the event is dropped and counted; the
//! caller's mutation is never slowed down or failed by auditing.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::types::ProgressEvent;

pub struct EventEmitter {
    sender: Sender<ProgressEvent>,

    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
}

impl EventEmitter {
    /// Create a new emitter with the given buffer size.
    ///
    /// Returns the emitter and a receiver for the drain task. A zero size is
    /// raised to 1; a rendezvous channel would drop every `try_send`.
    pub fn new(buffer_size: usize) -> (Self, EventReceiver) {
        let (sender, receiver) = bounded(buffer_size.max(1));

        let emitter = Self {
            sender,
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        };

        let receiver = EventReceiver {
            receiver,
            disconnected: Arc::new(AtomicBool::new(false)),
        };

        (emitter, receiver)
    }

    /// Emit an event. Never blocks, never fails.
    #[inline]
    pub fn emit(&self, event: ProgressEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.events_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            emitted: self.events_emitted.load(Ordering::Relaxed),
            dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    /// Events accepted by the channel
    pub emitted: u64,
    /// Events dropped (buffer full or receiver disconnected)
    pub dropped: u64,
}

impl EmitterStats {
    pub fn drop_rate(&self) -> f64 {
        let total = self.emitted + self.dropped;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }
}

/// Receiving half, held by the drain task only.
#[derive(Clone)]
pub struct EventReceiver {
    receiver: Receiver<ProgressEvent>,
    disconnected: Arc<AtomicBool>,
}

impl EventReceiver {
    /// Returns `None` if the channel is empty.
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.disconnected.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    /// Up to `max` events without blocking.
    pub fn try_recv_batch(&self, max: usize) -> Vec<ProgressEvent> {
        let mut batch = Vec::with_capacity(max.min(64));
        while batch.len() < max {
            match self.try_recv() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// True once a receive found the buffer empty with every emitter dropped.
    pub fn is_closed(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }
}

pub type SharedEmitter = Arc<EventEmitter>;

/// Emit through an optional emitter.
pub(crate) fn emit_to(emitter: Option<&SharedEmitter>, event: ProgressEvent) {
    if let Some(emitter) = emitter {
        emitter.emit(event);
    }
}
