//! Pipeline Runtime - one catch-up pass over the tracked entities
//!
//! - Resolves the catch-up window from the most liquid entities
//! - Creates missing analytics tables and evicts expired rows
//! - Computes missing rows in parallel workers and imports them
//! - Optionally compacts the analytics store afterwards
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! Environment variables (see `PipelineConfig::from_env` for the full list):
//!   ITEMFLOW_SOURCE_DB - raw feed store (default: data/timeseries.db)
//!   ITEMFLOW_ANALYTICS_DB - analytics store (default: data/analytics.db)
//!   TRACKED_ENTITIES - comma-separated entity ids (required)
//!   WORKER_COUNT - computation workers (default: 3)
//!   HANDOFF_BACKEND - channel | file (default: channel)

use dotenv::dotenv;
use env_logger::{Builder, Env, Target};
use itemflow::pipeline::{config::ConfigError, Pipeline, PipelineConfig};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    info!("🚀 Pipeline Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;
    if config.tracked_entities.is_empty() {
        error!("❌ No entities to track (set TRACKED_ENTITIES)");
        return Err(ConfigError::MissingVariable("TRACKED_ENTITIES").into());
    }

    let pipeline = Pipeline::new(config);
    let cancel = pipeline.cancel_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️  Received CTRL+C, finishing current rows...");
                cancel.cancel();
            }
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
    });

    let report = pipeline.run().await?;
    println!("{}", report);

    if report.cancelled {
        info!("🛑 Stopped early, the next run resumes where this one left off");
    }
    info!("✅ Pipeline runtime stopped");
    Ok(())
}
