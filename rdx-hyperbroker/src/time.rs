//! The master clock that stands in for a host runtime's frame loop.

use crate::config::ClockResolution;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// One beat of the `SystemClock`.
#[derive(Debug, Clone)]
pub struct TickEvent {
    /// Monotonic tick counter, starting at 1.
    pub tick_count: u64,
    /// When the tick was scheduled to fire.
    pub timestamp: Instant,
}

/// Emits a `TickEvent` at the configured resolution until told to stop.
pub struct SystemClock {
    resolution: ClockResolution,
    tick_sender: broadcast::Sender<Arc<TickEvent>>,
}

impl SystemClock {
    pub fn new(resolution: ClockResolution, tick_sender: broadcast::Sender<Arc<TickEvent>>) -> Self {
        Self {
            resolution,
            tick_sender,
        }
    }

    /// Ticks until a message (or a closed channel) arrives on `shutdown_rx`.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.resolution.tick_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick_count: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                timestamp = interval.tick() => {
                    tick_count += 1;
                    let tick = Arc::new(TickEvent { tick_count, timestamp });
                    if self.tick_sender.send(tick).is_err() {
                        trace!("Tick #{} had no receivers.", tick_count);
                    }
                }
            }
        }
        debug!("SystemClock stopped after {} ticks.", tick_count);
    }
}
