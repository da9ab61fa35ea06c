//! Background drain from the event channel to the audit log.
//!
//! Runs on its own tokio task so emission never waits on I/O. Write
//! failures are logged and dropped.

use std::time::Duration;

use ob_stage_core::EventReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::event_log::EventLog;

pub struct EventDrain {
    receiver: EventReceiver,
    log: EventLog,
    batch_size: usize,
    flush_interval: Duration,
}

impl EventDrain {
    pub fn new(receiver: EventReceiver, log: EventLog, config: &DrainConfig) -> Self {
        Self {
            receiver,
            log,
            batch_size: config.batch_size.max(1),
            // tokio intervals panic on a zero period
            flush_interval: config.flush_interval().max(Duration::from_millis(1)),
        }
    }

    /// Drain until `shutdown` flips to true (or its sender is dropped), then
    /// write whatever is still buffered and flush.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut flush_timer = interval(self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        flush_timer.tick().await;

        info!(
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            path = %self.log.path().display(),
            "Event drain started"
        );

        let mut total = 0u64;
        loop {
            tokio::select! {
                _ = flush_timer.tick() => {
                    total += self.drain_available().await;
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        total += self.drain_available().await;
        self.flush().await;
        info!(events = total, "Event drain stopped");
        total
    }

    /// Drain batches until the channel is empty.
    async fn drain_available(&self) -> u64 {
        let mut drained = 0u64;
        loop {
            let count = self.drain_batch().await;
            drained += count as u64;
            if count < self.batch_size {
                break;
            }
        }
        if drained > 0 {
            debug!(events = drained, "Drained events to audit log");
        }
        drained
    }

    async fn drain_batch(&self) -> usize {
        let batch = self.receiver.try_recv_batch(self.batch_size);
        let count = batch.len();

        for event in batch {
            if let Err(e) = self.log.append(&event).await {
                warn!(
                    error = %e,
                    event_type = event.payload.event_type_str(),
                    "Audit log write failed (non-fatal)"
                );
            }
        }
        count
    }

    async fn flush(&self) {
        if let Err(e) = self.log.flush().await {
            warn!(error = %e, "Audit log flush failed (non-fatal)");
        }
    }
}

/// Handle to a spawned drain.
pub struct DrainHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl DrainHandle {
    /// Signal shutdown and wait for the final flush. Returns events written.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(total) => total,
            Err(e) => {
                warn!(error = %e, "Event drain task failed");
                0
            }
        }
    }
}

pub fn spawn_drain(receiver: EventReceiver, log: EventLog, config: &DrainConfig) -> DrainHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let drain = EventDrain::new(receiver, log, config);
    DrainHandle {
        shutdown,
        task: tokio::spawn(drain.run(shutdown_rx)),
    }
}
