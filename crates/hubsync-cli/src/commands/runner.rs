//! `hubsync runner`: stay connected to the hub until Ctrl-C

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use hubsync_core::sync::{spawn_runner_client, HubStatus, RunnerClientConfig, RunnerCommand};
use hubsync_core::{Config, Runner, RunnerSettings, SyncTables};

use super::open_store;
use crate::output::Output;

pub async fn run(config: &Config, output: &Output) -> Result<()> {
    if !config.runner.enabled {
        bail!("Sync is disabled. Enable it with: hubsync config set runner.enabled true");
    }
    let Some(client_config) = RunnerClientConfig::from_config(config) else {
        bail!("No hub configured. Set one with: hubsync config set runner.hub_url ws://hub:7400");
    };

    let host_id = config.resolve_host_id()?;
    let store = Arc::new(open_store(config)?);
    let runner = Runner::new(
        store,
        SyncTables::default(),
        RunnerSettings::from_config(config, host_id.clone()),
    )?;

    output.message(&format!(
        "Runner {} syncing with {}",
        host_id, client_config.url
    ));
    let mut handle = spawn_runner_client(client_config, runner);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                let _ = handle.command_tx.send(RunnerCommand::Shutdown).await;
                break;
            }
            changed = handle.status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = handle.status_rx.borrow_and_update().clone();
                output.message(&format!("Hub status: {}", state.status));
                if let Some(error) = &state.last_error {
                    info!("Last hub error: {}: {}", error.error, error.message);
                }
            }
            _ = &mut handle.task => {
                break;
            }
        }
    }

    if !handle.task.is_finished() {
        (&mut handle.task).await.ok();
    }

    let state = handle.status_rx.borrow().clone();
    if state.status == HubStatus::SchemaMismatch {
        let detail = state
            .last_error
            .map(|e| e.message)
            .unwrap_or_else(|| "versions differ".to_string());
        bail!("Hub rejected this runner's schema version: {}", detail);
    }

    output.success("Runner stopped");
    Ok(())
}
