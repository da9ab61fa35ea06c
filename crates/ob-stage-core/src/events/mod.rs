//! Best-effort audit events.
//!
//! Reconciliation and action execution emit events through a bounded
//! channel. Emission never blocks and never fails; a background drain owns
//! all I/O.

mod emitter;
mod types;

pub use emitter::{EmitterStats, EventEmitter, EventReceiver, SharedEmitter};
pub use types::{EventPayload, ProgressEvent};
pub(crate) use emitter::emit_to;
