//! Periodic conclusion of due groups.
//!
//! Groups that stop receiving events would never be concluded by
//! [`AggregateProcessor::execute`] alone; the scheduler runs a conclusion
//! pass on a fixed interval and forwards whatever it produces.

use std::sync::Arc;
use std::time::Duration;

use tally_core::Event;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::processor::AggregateProcessor;

/// Drives `conclude_due` on a timer until told to stop.
pub struct ConclusionScheduler {
    processor: Arc<AggregateProcessor>,
    interval: Duration,
    output_tx: mpsc::Sender<Vec<Event>>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ConclusionScheduler {
    /// Create a scheduler and the sender that stops it.
    pub fn new(
        processor: Arc<AggregateProcessor>,
        interval: Duration,
        output_tx: mpsc::Sender<Vec<Event>>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let scheduler = Self {
            processor,
            interval,
            output_tx,
            shutdown_rx,
        };
        (scheduler, shutdown_tx)
    }

    /// Run until shutdown or until the output channel closes. Returns the
    /// concluded events that could not be delivered.
    pub async fn run(&mut self) -> Vec<Event> {
        info!(interval_ms = self.interval.as_millis(), "conclusion scheduler starting");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut undelivered = Vec::new();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("conclusion scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let events = self.processor.conclude_due();
                    if events.is_empty() {
                        continue;
                    }
                    debug!(count = events.len(), "concluded due groups");
                    let permit = tokio::select! {
                        permit = self.output_tx.reserve() => permit,
                        _ = self.shutdown_rx.recv() => {
                            info!(pending = events.len(), "shutdown while output is full");
                            undelivered = events;
                            break;
                        }
                    };
                    match permit {
                        Ok(permit) => permit.send(events),
                        Err(_) => {
                            warn!("conclusion output channel closed");
                            undelivered = events;
                            break;
                        }
                    }
                }
            }
        }

        info!(undelivered = undelivered.len(), "conclusion scheduler stopped");
        undelivered
    }
}
