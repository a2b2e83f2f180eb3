// =============================================================================
// Helix — Main Entry Point
// =============================================================================
//
// Thin wiring only: load config, build the orchestrator, run until Ctrl+C.
// Venue credentials come from the config file; missing venue blocks simply
// leave that venue out of the session.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use helix_arb::config::RuntimeConfig;
use helix_arb::orchestrator::UnifiedOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("HELIX_CONFIG").unwrap_or_else(|_| "helix_config.json".to_string());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        symbols = ?config.symbols,
        venues = ?config.venues.keys().collect::<Vec<_>>(),
        "helix starting"
    );

    let orchestrator: Arc<UnifiedOrchestrator> = UnifiedOrchestrator::new(config);
    orchestrator.start().await?;

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    orchestrator.stop().await;
    info!("helix shut down complete");
    Ok(())
}
