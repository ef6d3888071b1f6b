//! WhatsApp History - records WhatsApp chats into a SQL database and serves
//! them over a small HTTP API.
//!
//! The WhatsApp Web protocol is handled by a bridge subprocess (wa-bridge);
//! communication happens via JSON-lines over stdio.

mod audio;
mod bridge;
mod cli;
mod display;
mod error;
mod events;
mod history;
mod media;
mod storage;
mod web;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bridge::{BridgeConfig, BridgeEvent, BridgeProcess};
use cli::Args;
use display::{print_error, print_info};
use events::{EventContext, EventRouter};
use storage::MessageStore;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    init_logging(args.verbose);

    let data_dir = match args.data_dir.clone() {
        Some(dir) => dir,
        None => bridge::default_data_dir()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    info!("Using data directory: {:?}", data_dir);

    let bridge_path = match args.bridge_path.clone() {
        Some(path) => path,
        None => bridge::find_bridge_binary()?,
    };
    info!("Using bridge binary: {:?}", bridge_path);

    let database = args.database_config(&data_dir);
    let store = MessageStore::open(&database).context("Failed to open message store")?;
    let (messages, chats) = store.stats()?;
    info!("Message store holds {} messages in {} chats", messages, chats);

    let state = Arc::new(AppState::new(store, data_dir.clone()));

    // The API outlives bridge restarts
    let server_state = state.clone();
    let host = args.host.clone();
    let port = args.port;
    tokio::spawn(async move {
        if let Err(e) = web::start_server(server_state, &host, port).await {
            error!("Web server error: {}", e);
        }
    });

    let config = BridgeConfig {
        binary_path: bridge_path,
        data_dir,
        verbose: args.verbose,
    };
    run_bridge(config, state, args.request_history).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Keep a bridge running until Ctrl+C, restarting it whenever it exits
async fn run_bridge(config: BridgeConfig, state: Arc<AppState>, request_history: bool) -> Result<()> {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        let _ = shutdown_tx.send(());
    });

    let router = EventRouter::new();

    loop {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<BridgeEvent>();

        print_info("Starting WhatsApp bridge...");
        let bridge = match BridgeProcess::spawn(config.clone(), event_tx).await {
            Ok(b) => b,
            Err(e) => {
                print_error(&format!("Failed to start bridge: {}", e));
                tokio::time::sleep(tokio::time::Duration::from_secs(3)).await;
                continue;
            }
        };

        state.set_bridge(bridge.client()).await;
        let ctx = EventContext::new(state.clone(), bridge.client(), request_history);

        let should_exit = loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    print_info("Shutting down...");
                    let _ = bridge.shutdown().await;
                    break true;
                }

                event = event_rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = router.dispatch(&ctx, event).await {
                                error!("Error handling event: {:#}", e);
                            }
                        }
                        None => {
                            info!("Bridge process terminated, restarting...");
                            state.set_connected(false, None, None).await;
                            break false;
                        }
                    }
                }
            }
        };

        if should_exit {
            break;
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    Ok(())
}
