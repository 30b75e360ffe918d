//! `hubsync hub`: serve runners until Ctrl-C

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;

use hubsync_core::{Config, Hub, HubServer, HubSettings, SyncTables};

use super::open_store;
use crate::output::Output;

pub async fn run(config: &Config, output: &Output) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let settings = HubSettings::from_config(config);
    let hub = Hub::new(store, SyncTables::default(), settings);

    let server = HubServer::bind(hub, &config.hub.listen_addr).await?;
    output.message(&format!("Hub listening on ws://{}", server.local_addr()?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    output.success("Hub stopped");
    Ok(())
}
