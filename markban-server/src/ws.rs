/// WebSocket event channel.
///
/// Protocol:
///   Client sends {"type":"subscribe","projectSlug":...} to follow a project.
///   Server acks with {"type":"subscribed",...} and then pushes every board
///   event for that project. {"type":"unsubscribe"} and {"type":"ping"} are
///   answered with "unsubscribed" and "pong". Bad input yields {"type":"error"}.
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use markban_core::events::{ClientId, ClientMessage, Outbound, ServerAck};
use tokio::sync::mpsc;

use crate::state::AppState;

pub fn ws_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client_id = state.broadcaster.next_client_id();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    state.broadcaster.register_client(client_id, out_tx);
    log::info!("[markban.ws] Client {} connected", client_id);

    // Write task: forward queued frames to the socket
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Outbound::Text(text) => Message::Text(text.as_ref().into()),
                Outbound::Ping => Message::Ping(Default::default()),
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Read task: handle subscribe / unsubscribe / ping
    let state_read = state.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => handle_text(&state_read, client_id, &text).await,
                Message::Pong(_) => state_read.broadcaster.mark_alive(client_id),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut write_task => { read_task.abort(); }
        _ = &mut read_task => { write_task.abort(); }
    }

    state.broadcaster.unregister_client(client_id);
    log::info!("[markban.ws] Client {} disconnected", client_id);
}

async fn handle_text(state: &AppState, client_id: ClientId, text: &str) {
    let ack = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { project_slug }) => {
            match state.store.get_project(&project_slug).await {
                Ok(_) => {
                    state.broadcaster.subscribe(client_id, &project_slug);
                    log::debug!("[markban.ws] Client {} subscribed to {}", client_id, project_slug);
                    ServerAck::Subscribed { project_slug }
                }
                Err(e) => ServerAck::Error {
                    message: e.to_string(),
                },
            }
        }
        Ok(ClientMessage::Unsubscribe { project_slug }) => {
            state.broadcaster.unsubscribe(client_id, &project_slug);
            ServerAck::Unsubscribed { project_slug }
        }
        Ok(ClientMessage::Ping) => {
            state.broadcaster.mark_alive(client_id);
            ServerAck::Pong
        }
        Err(e) => {
            log::warn!("[markban.ws] Client {} sent invalid message: {}", client_id, e);
            ServerAck::Error {
                message: format!("Invalid message: {}", e),
            }
        }
    };
    send_ack(state, client_id, &ack);
}

fn send_ack(state: &AppState, client_id: ClientId, ack: &ServerAck) {
    match serde_json::to_string(ack) {
        Ok(json) => {
            state.broadcaster.send_to(client_id, Outbound::Text(json.into()));
        }
        Err(e) => log::error!("[markban.ws] Cannot serialize ack: {}", e),
    }
}
