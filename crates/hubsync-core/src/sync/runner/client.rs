//! Persistent hub connection
//!
//! Keeps a runner connected to its hub over WebSocket. Every connection
//! starts with catch-up and then serves pulls until it drops; reconnects use
//! exponential backoff. A schema mismatch stops the loop for good.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{HubStatus, HubSyncState, Runner, SessionEnd};
use crate::config::Config;
use crate::store::RecordStore;
use crate::sync::transport;

/// Commands sent to the client task
#[derive(Debug, Clone)]
pub enum RunnerCommand {
    /// Drop the current connection and stop
    Shutdown,
}

/// Handle to control the client task
pub struct RunnerClientHandle {
    /// Send commands to the client task
    pub command_tx: mpsc::Sender<RunnerCommand>,
    /// Watch the hub connection state
    pub status_rx: watch::Receiver<HubSyncState>,
    /// Completes when the client task exits
    pub task: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Clone)]
pub struct RunnerClientConfig {
    /// Hub WebSocket URL, without the `host_id` parameter
    pub url: String,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for RunnerClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

impl RunnerClientConfig {
    pub fn from_config(config: &Config) -> Option<Self> {
        let url = config.runner.hub_url.clone()?;
        Some(Self {
            url,
            initial_reconnect_delay: Duration::from_millis(
                config.runner.initial_reconnect_delay_ms.max(1),
            ),
            max_reconnect_delay: Duration::from_millis(config.runner.max_reconnect_delay_ms.max(1)),
        })
    }
}

/// Spawn the reconnecting client task
pub fn spawn_runner_client<S: RecordStore + 'static>(
    config: RunnerClientConfig,
    runner: Runner<S>,
) -> RunnerClientHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let status_rx = runner.subscribe();

    let task = tokio::spawn(client_loop(config, runner, command_rx));

    RunnerClientHandle {
        command_tx,
        status_rx,
        task,
    }
}

async fn client_loop<S: RecordStore + 'static>(
    config: RunnerClientConfig,
    runner: Runner<S>,
    mut command_rx: mpsc::Receiver<RunnerCommand>,
) {
    let url = match connection_url(&config.url, runner.host_id()) {
        Ok(url) => url,
        Err(e) => {
            error!(url = %config.url, "Invalid hub URL: {:#}", e);
            runner.set_status(HubStatus::Disabled);
            return;
        }
    };
    let mut reconnect_delay = config.initial_reconnect_delay;

    loop {
        match connect_and_serve(&url, &runner, &mut command_rx).await {
            Ok(Some(SessionEnd::SchemaMismatch)) => {
                error!("Schema version differs from hub, not reconnecting");
                return;
            }
            Ok(Some(SessionEnd::Closed)) => {
                info!("Hub connection closed");
                reconnect_delay = config.initial_reconnect_delay;
            }
            Ok(None) => {
                runner.set_status(HubStatus::Disabled);
                info!("Runner client stopped");
                return;
            }
            Err(e) => {
                warn!("Hub connection failed: {}", e);
                if runner.state().status != HubStatus::InternalError {
                    runner.set_status(HubStatus::Disconnected);
                }
            }
        }

        // Wait before reconnecting, but check for shutdown
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
            }
            cmd = command_rx.recv() => {
                match cmd {
                    Some(RunnerCommand::Shutdown) | None => {
                        runner.set_status(HubStatus::Disabled);
                        info!("Runner client stopped");
                        return;
                    }
                }
            }
        }
    }
}

/// Connect once and serve the session
///
/// Returns `None` when a shutdown command arrived.
async fn connect_and_serve<S: RecordStore + 'static>(
    url: &str,
    runner: &Runner<S>,
    command_rx: &mut mpsc::Receiver<RunnerCommand>,
) -> Result<Option<SessionEnd>> {
    debug!("Connecting to {}", url);
    let (ws, _response) = connect_async(url).await?;
    info!(host_id = runner.host_id(), "Connected to hub");

    let (link, inbound) = transport::attach(ws);
    let session = runner.run_session(link.clone(), inbound);
    tokio::pin!(session);

    tokio::select! {
        end = &mut session => Ok(Some(end)),
        _ = command_rx.recv() => {
            link.close();
            // Let the session observe the close and settle its status
            session.await;
            Ok(None)
        }
    }
}

/// Append this runner's identity to the hub URL
///
/// The host id is form-encoded, so ids containing `&`, `=` or spaces
/// arrive at the hub unchanged.
fn connection_url(base: &str, host_id: &str) -> Result<String> {
    let mut url = Url::parse(base).with_context(|| format!("Invalid hub URL '{}'", base))?;
    url.query_pairs_mut().append_pair("host_id", host_id);
    Ok(url.into())
}
