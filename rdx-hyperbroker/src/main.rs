use anyhow::Result;
use hyperbroker::components::trigger_toggle::{Material, TriggerToggle};
use hyperbroker::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the configuration: an optional TOML path, then HYPERBROKER__* overrides.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BrokerConfig::load(config_path.as_deref())?;

    // 3. Create the engine. It installs its dispatcher on the broker.
    let engine = BrokerEngine::new(config)?;

    // 4. Spawn tasks that log the broker and engine event streams.
    spawn_event_listeners(&engine);

    // 5. Wake two toggles that share the example channel.
    let mut toggles = vec![
        TriggerToggle::new("cube-a", true, Material::new("glow"), Material::new("matte")),
        TriggerToggle::new("cube-b", false, Material::new("glow"), Material::new("matte")),
    ];
    for toggle in toggles.iter_mut() {
        toggle.awake(engine.broker())?;
    }
    tokio::spawn(simulate_collisions(toggles));

    // 6. Run the engine.
    engine.run().await?;

    Ok(())
}

/// Spawns tasks, each subscribing to a different event stream.
fn spawn_event_listeners(engine: &BrokerEngine) {
    let mut broker_rx = engine.broker().subscribe_broker_events();
    tokio::spawn(async move {
        while let Ok(event) = broker_rx.recv().await {
            info!("[BROKER] => {:?}", event);
        }
    });

    let mut system_rx = engine.subscribe_system_events();
    tokio::spawn(async move {
        while let Ok(event) = system_rx.recv().await {
            info!("[SYSTEM] => {:?}", event);
        }
    });
}

/// Stands in for the physics step: every two seconds a ball enters one of
/// the toggles, alternating between them.
async fn simulate_collisions(toggles: Vec<TriggerToggle>) {
    let mut interval = tokio::time::interval(Duration::from_secs(2));
    interval.tick().await;
    for round in 0usize.. {
        interval.tick().await;
        let toggle = &toggles[round % toggles.len()];
        toggle.on_trigger_enter("ball");
        for toggle in &toggles {
            info!(
                "[SCENE] {} shows {:?}, next publish {}",
                toggle.label(),
                toggle.material().map(|m| m.name().to_string()),
                toggle.flag()
            );
        }
    }
}
