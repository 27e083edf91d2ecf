//! VM annotator daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;

mod asset;
mod config;
mod discovery;
mod history;
mod inventory;
mod lifecycle;
mod publish;
mod store;
mod types;

use asset::AssetClient;
use config::Config;
use inventory::VcenterInventory;
use lifecycle::Annotator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting VM annotator with config: {:?}", cfg);

    // Collaborators
    let inventory = VcenterInventory::new(
        &cfg.vcenter_url,
        cfg.vcenter_user.clone(),
        cfg.vcenter_password.clone(),
        cfg.verify_tls,
    );
    let sink = AssetClient::new(&cfg.asset_url, cfg.api_credentials()?, cfg.verify_tls)?;

    let mut annotator = Annotator::new(
        Arc::new(inventory),
        Arc::new(sink),
        (&cfg).into(),
        (&cfg).into(),
        cfg.history_capacity,
    );
    annotator.start();

    // Graceful Shutdown
    let outcome = tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            Ok(())
        }
        res = annotator.wait_discovery() => {
            if let Err(e) = &res {
                error!("Discovery stopped: {}", e);
            }
            res
        }
    };

    annotator
        .shutdown(Duration::from_secs(cfg.shutdown_timeout_secs))
        .await;
    for entry in annotator.history().entries() {
        info!("Published {} at {}", entry.message, entry.timestamp);
    }

    info!("Shutdown complete.");
    outcome.map_err(Into::into)
}
