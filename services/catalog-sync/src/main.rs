//!
//! src/main.rs
//!
//! Wires configuration, logging, storage, the catalog clients and the
//! scheduler together and runs until ctrl-c. Also holds the live http
//! testbenches against the real Spotify endpoints.
//!
//!

mod config;
mod errors;
mod logging;
mod types;
mod wire;

mod credentials;
mod fetch;
mod mapper;
mod persistent;
mod reconciler;
mod scheduler;
mod editor;

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::SyncError;

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    let cfgs    = config::load_config()?;
    let _logger = logging::init_logging(&cfgs.logging)?;

    info!(
        service = env!("CARGO_PKG_NAME"),
        version = %env!("CARGO_PKG_VERSION"),
        artists = cfgs.catalog.artist_ids.len(),
        on_vanished = cfgs.sync.on_vanished.as_str(),
        "starting"
    );

    let db = Arc::new(persistent::Persistent::init(&cfgs.persistence.db_url).await?);

    let spotify     = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
    let credentials = Arc::new(credentials::CredentialCache::new(spotify.clone()));
    let catalog     = Arc::new(fetch::CatalogFetcher::new(spotify, credentials, &cfgs.catalog));

    let pipeline = Arc::new(scheduler::Pipeline::new(
        catalog,
        db.clone(),
        db,
        cfgs.sync.on_vanished
    ));
    let scheduler = scheduler::Scheduler::new(pipeline, &cfgs.sync);

    let shutdown = scheduler.shutdown();
    let trigger = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(msg = "shutting sync daemon down", "scheduler.signal");
            shutdown.cancel();
        }
    });

    let () = scheduler.run().await?;
    trigger.abort();

    Ok(())
}
