/// HTTP server: spawns axum on a background tokio task.
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::api::api_router;
use crate::state::AppState;
use crate::ws::ws_router;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api_router()
        .merge(ws_router())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until `shutdown` flips. Returns the bound port.
pub async fn spawn_server(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u16, Box<dyn std::error::Error>> {
    let bind_addr = state.bind_address.clone();
    let live_port = state.live_port.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind_addr, port)).await?;
    let actual_port = listener.local_addr()?.port();
    if let Ok(mut lp) = live_port.lock() {
        *lp = actual_port;
    }

    log::info!(
        "HTTP server listening on http://{}:{}",
        bind_addr,
        actual_port
    );

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            log::error!("HTTP server exited with error: {}", e);
        }
    });

    Ok(actual_port)
}
