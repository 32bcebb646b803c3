/// markban server: config loading, store/broadcaster/history wiring, file
/// watcher forwarding, heartbeat and the HTTP + WebSocket surface.
pub mod api;
pub mod config;
pub mod server;
pub mod state;
pub mod ws;

use std::sync::{Arc, Mutex};

use markban_core::events::{spawn_heartbeat, Broadcaster};
use markban_core::history::HistoryRecorder;
use markban_core::storage::local::CardStore;
use markban_core::watcher::engine::WatchEvent;
use markban_core::watcher::file_watcher::FileWatcher;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::state::AppState;

/// A started server and the background tasks it owns.
pub struct RunningServer {
    pub port: u16,
    pub state: AppState,
    shutdown_tx: watch::Sender<bool>,
    watcher: Option<FileWatcher>,
    background: Vec<JoinHandle<()>>,
}

impl RunningServer {
    /// Stop serving, stop the watcher, flush history.
    pub async fn shutdown(mut self) {
        log::info!("[markban.shutdown] Cancelling background tasks");
        let _ = self.shutdown_tx.send(true);
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        for task in self.background.drain(..) {
            let _ = task.await;
        }
        self.state.history.shutdown().await;
    }
}

/// Build every service, start the watcher and bind the HTTP server.
pub async fn start(config: ServerConfig) -> Result<RunningServer, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.workspace)?;
    log::info!("[markban.start] Workspace {}", config.workspace.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState {
        store: Arc::new(CardStore::new(&config.workspace)),
        broadcaster: Arc::new(Broadcaster::new()),
        history: HistoryRecorder::new(&config.workspace, config.history.clone()),
        bind_address: config.bind_address.clone(),
        live_port: Arc::new(Mutex::new(config.port)),
    };

    let mut background = Vec::new();
    let watcher = match FileWatcher::start(state.store.clone(), config.watcher.clone()) {
        Ok((watcher, event_rx)) => {
            background.push(spawn_forwarder(state.clone(), event_rx, shutdown_rx.clone()));
            Some(watcher)
        }
        Err(e) => {
            log::warn!("[markban.watcher] Failed to create file watcher: {}", e);
            None
        }
    };
    if let Some(heartbeat) =
        spawn_heartbeat(state.broadcaster.clone(), &config.heartbeat, shutdown_rx.clone())
    {
        background.push(heartbeat);
    }

    let port = server::spawn_server(state.clone(), config.port, shutdown_rx).await?;
    log::info!("Server started on port {}", port);

    Ok(RunningServer {
        port,
        state,
        shutdown_tx,
        watcher,
        background,
    })
}

/// Run until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = start(config).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}

/// Publish watcher events the same way API mutations are published.
fn spawn_forwarder(
    state: AppState,
    mut event_rx: broadcast::Receiver<WatchEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = event_rx.recv() => {
                    match result {
                        Ok(WatchEvent { project, event }) => {
                            state.publish(&project, event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("[markban.events] Lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            log::info!("[markban.events] Event channel closed");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    log::info!("[markban.events] Shutdown signal received");
                    break;
                }
            }
        }
    })
}
