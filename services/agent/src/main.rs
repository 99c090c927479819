//! hostd Agent
//!
//! Assembles the agent from its parts and runs until interrupted:
//!
//! - **Action log**: loaded once at start; a recorded unenroll keeps the
//!   agent idle
//! - **Check-in gateway**: polls the controller and dispatches actions
//! - **Unenroll handler**: stops routed work, acks or records, ends loops

use std::sync::Arc;

use anyhow::{Context, Result};
use hostd_agent::actions::{ActionKind, CloserSet};
use hostd_agent::config::Config;
use hostd_agent::gateway::{self, CheckinGateway, GatewayConfig};
use hostd_agent::{
    ActionDispatcher, ActionLog, DiskStore, HttpAcker, RoutingTable, UnenrollHandler,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostd agent");

    let config = Config::from_env()?;
    info!(
        agent_id = %config.agent_id,
        controller_url = %config.controller_url,
        data_dir = %config.data_dir,
        "Configuration loaded"
    );

    let store = DiskStore::new(config.action_store_path(), config.state_file_mode);
    let action_log = Arc::new(
        ActionLog::open(store).context("Failed to load action store")?,
    );

    let routing = Arc::new(RoutingTable::new());
    spawn_routing_observer(&routing);

    if gateway::unenrolled(&action_log) {
        info!("Agent was unenrolled, not checking in; waiting for shutdown");
        tokio::signal::ctrl_c().await?;
        info!("Agent shutdown complete");
        return Ok(());
    }

    let client = Arc::new(
        hostd_agent::client::ControllerClient::new(&config)
            .context("Failed to build controller client")?,
    );
    let acker = Arc::new(HttpAcker::new(Arc::clone(&client)));

    let gateway_token = CancellationToken::new();
    let unenroll = UnenrollHandler::new(
        routing.clone(),
        CloserSet::new([gateway_token.clone()]),
        Some(Arc::clone(&action_log)),
    );

    let mut dispatcher = ActionDispatcher::new();
    dispatcher.register(ActionKind::Unenroll, Arc::new(unenroll));

    let gateway = CheckinGateway::new(
        client,
        Arc::new(dispatcher),
        acker,
        Arc::clone(&action_log),
        GatewayConfig::from(&config),
    );
    let gateway_handle = tokio::spawn({
        let token = gateway_token.clone();
        async move { gateway.run(token).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            gateway_token.cancel();
        }
        result = gateway_handle => {
            match result {
                Ok(()) => info!("Check-in loop ended, agent is idle"),
                Err(e) => error!(error = %e, "Check-in task panicked"),
            }
        }
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Log every desired-state change. Starting and stopping programs belongs
/// to the program supervisor, which subscribes the same way.
fn spawn_routing_observer(routing: &RoutingTable) {
    let mut rx = routing.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let desired = rx.borrow_and_update().clone();
            if let Some(desired) = desired {
                info!(
                    action_id = %desired.action_id,
                    programs = desired.program_count(),
                    "Routing changed"
                );
            }
        }
    });
}
