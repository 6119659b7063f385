//! The engine that stands in for a host runtime's update loop.
//!
//! It owns a `Broker`, installs a `TickDispatcher` on it, and drives that
//! dispatcher once per `SystemClock` tick until shut down.

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::dispatch::{TickDispatcher, TickReport};
use crate::error::BrokerError;
use crate::events::SystemEvent;
use crate::time::{SystemClock, TickEvent};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// The main broker engine.
///
/// This struct is the central point of control. It holds the configuration,
/// the broker and the dispatcher that executes raised channels. The engine
/// is designed to be cloned and shared across tasks; every clone is a handle
/// to the same running instance.
#[derive(Clone)]
pub struct BrokerEngine {
    config: Arc<BrokerConfig>,
    broker: Broker,
    dispatcher: TickDispatcher,
    tick_sender: broadcast::Sender<Arc<TickEvent>>,
    system_event_sender: broadcast::Sender<SystemEvent>,
}

// Core implementation block for internal logic.
impl BrokerEngine {
    /// Creates an engine with a fresh broker holding the declared channels.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let broker = Broker::from_config(&config)?;
        Ok(Self::with_broker(config, broker))
    }

    /// Creates an engine around an existing broker.
    ///
    /// The engine's dispatcher replaces whatever dispatcher the broker had.
    pub fn with_broker(config: BrokerConfig, broker: Broker) -> Self {
        const TICK_CAPACITY: usize = 256;
        let (tick_sender, _) = broadcast::channel(TICK_CAPACITY);
        let (system_event_sender, _) = broadcast::channel(config.event_capacity.max(1));

        let dispatcher = TickDispatcher::new(config.dispatch_policy);
        broker.set_dispatcher(dispatcher.as_dispatch());

        Self {
            config: Arc::new(config),
            broker,
            dispatcher,
            tick_sender,
            system_event_sender,
        }
    }

    /// Runs the engine until Ctrl+C is received.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Press Ctrl+C to shut down.");
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Runs the engine until `shutdown` resolves.
    ///
    /// This method will:
    /// 1. Spawn the `SystemClock` task.
    /// 2. Spawn the dispatch task that ticks the dispatcher on every clock tick.
    /// 3. Wait for `shutdown`, then stop both tasks.
    ///
    /// An error from `shutdown` is returned after the tasks have stopped.
    pub async fn run_until<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = std::io::Result<()>>,
    {
        info!("BrokerEngine starting up...");
        let (shutdown_tx, _) = broadcast::channel(1);

        let clock = SystemClock::new(self.config.resolution.clone(), self.tick_sender.clone());
        let clock_task = tokio::spawn(clock.run(shutdown_tx.subscribe()));

        let engine = self.clone();
        let tick_rx = self.tick_sender.subscribe();
        let dispatch_task = tokio::spawn(engine.dispatch_loop(tick_rx, shutdown_tx.subscribe()));

        info!(
            "Engine running at {:?} with {:?} dispatch.",
            self.config.resolution, self.config.dispatch_policy
        );
        let signal = shutdown.await;

        info!("Shutdown signal received. Broadcasting to all tasks...");
        if shutdown_tx.send(()).is_err() {
            error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
        }
        clock_task.await?;
        dispatch_task.await?;

        let pending = self.dispatcher.pending_callbacks();
        if pending > 0 {
            warn!(pending, "callbacks still queued at shutdown");
        }
        self.system_event_sender
            .send(SystemEvent::EngineShutdown)
            .ok();
        info!("BrokerEngine has shut down.");
        signal?;
        Ok(())
    }

    #[doc(hidden)]
    async fn dispatch_loop(
        self,
        mut tick_rx: broadcast::Receiver<Arc<TickEvent>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        self.system_event_sender
            .send(SystemEvent::EngineStarted {
                timestamp: Instant::now(),
                started_at: Utc::now(),
            })
            .ok();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                tick = tick_rx.recv() => match tick {
                    Ok(tick) => self.process_tick(&tick),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "dispatch loop fell behind the clock");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    #[doc(hidden)]
    fn process_tick(&self, tick: &TickEvent) {
        trace!("Tick #{} received.", tick.tick_count);
        let report = self.dispatcher.tick();
        if report.invoked > 0 {
            debug!(
                tick = tick.tick_count,
                invoked = report.invoked,
                panicked = report.panicked,
                pending = report.pending,
                "tick drained"
            );
            self.system_event_sender
                .send(SystemEvent::TickDrained {
                    tick_count: tick.tick_count,
                    report,
                })
                .ok();
        }
    }
}

// Public API implementation block.
impl BrokerEngine {
    /// The broker this engine dispatches for.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The dispatcher installed on the broker.
    pub fn dispatcher(&self) -> &TickDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Advances the dispatcher by one tick without the clock.
    pub fn step(&self) -> TickReport {
        self.dispatcher.tick()
    }

    /// Runs every pending callback now.
    pub fn drain(&self) -> TickReport {
        self.dispatcher.drain()
    }

    /// Subscribes to the `SystemEvent` stream.
    pub fn subscribe_system_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.system_event_sender.subscribe()
    }

    /// Subscribes to the raw tick stream.
    pub fn subscribe_tick_events(&self) -> broadcast::Receiver<Arc<TickEvent>> {
        self.tick_sender.subscribe()
    }
}
