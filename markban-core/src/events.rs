/// Board events and their fan-out to subscribed WebSocket clients.
///
/// Wire shape of every event:
///   { "type": "card:moved", "projectSlug": "...", "timestamp": "...", "data": {...} }
///
/// The hub itself is transport-agnostic: each client is an unbounded channel
/// of [`Outbound`] frames that the connection task drains into its socket.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::HeartbeatSettings;
use crate::history::HistoryEntry;
use crate::types::{now_iso, CardSummary, Project};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum BoardEvent {
    #[serde(rename = "card:created")]
    CardCreated { card: CardSummary },

    #[serde(rename = "card:updated")]
    CardUpdated { card: CardSummary },

    #[serde(rename = "card:moved")]
    CardMoved {
        slug: String,
        from_lane: String,
        to_lane: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        card: Option<CardSummary>,
    },

    #[serde(rename = "card:deleted")]
    CardDeleted { slug: String, lane: String },

    #[serde(rename = "task:toggled")]
    TaskToggled {
        slug: String,
        index: usize,
        checked: bool,
        card: CardSummary,
    },

    #[serde(rename = "task:added")]
    TaskAdded {
        slug: String,
        index: usize,
        text: String,
        card: CardSummary,
    },

    #[serde(rename = "lane:reordered")]
    LaneReordered { lane: String, order: Vec<String> },

    #[serde(rename = "project:updated")]
    ProjectUpdated { project: Project },

    #[serde(rename = "history:event")]
    HistoryEvent { entry: HistoryEntry },
}

impl BoardEvent {
    /// Wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            BoardEvent::CardCreated { .. } => "card:created",
            BoardEvent::CardUpdated { .. } => "card:updated",
            BoardEvent::CardMoved { .. } => "card:moved",
            BoardEvent::CardDeleted { .. } => "card:deleted",
            BoardEvent::TaskToggled { .. } => "task:toggled",
            BoardEvent::TaskAdded { .. } => "task:added",
            BoardEvent::LaneReordered { .. } => "lane:reordered",
            BoardEvent::ProjectUpdated { .. } => "project:updated",
            BoardEvent::HistoryEvent { .. } => "history:event",
        }
    }
}

/// An event addressed to one project's subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(flatten)]
    pub event: BoardEvent,
    pub project_slug: String,
    pub timestamp: String,
}

impl EventMessage {
    pub fn new(project: impl Into<String>, event: BoardEvent) -> Self {
        Self {
            event,
            project_slug: project.into(),
            timestamp: now_iso(),
        }
    }
}

/// Messages a client may send over the socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { project_slug: String },
    Unsubscribe { project_slug: String },
    Ping,
}

/// Acknowledgements sent back to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerAck {
    Subscribed { project_slug: String },
    Unsubscribed { project_slug: String },
    Pong,
    Error { message: String },
}

/// A frame queued for one client's socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Ping,
    Close,
}

pub type ClientId = u64;

struct Client {
    sender: mpsc::UnboundedSender<Outbound>,
    /// Cleared by each ping, set again by the pong.
    alive: bool,
}

#[derive(Default)]
struct Hub {
    clients: HashMap<ClientId, Client>,
    subscriptions: HashMap<String, HashSet<ClientId>>,
}

/// Tracks connected clients and which projects each one follows.
#[derive(Default)]
pub struct Broadcaster {
    hub: Mutex<Hub>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn register_client(&self, id: ClientId, sender: mpsc::UnboundedSender<Outbound>) {
        self.hub().clients.insert(
            id,
            Client {
                sender,
                alive: true,
            },
        );
        log::debug!("[markban.ws] Client {} registered", id);
    }

    /// Forget a client and drop it from every subscription set.
    pub fn unregister_client(&self, id: ClientId) {
        let mut hub = self.hub();
        hub.clients.remove(&id);
        hub.subscriptions.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
        log::debug!("[markban.ws] Client {} unregistered", id);
    }

    /// Returns false when the client is not registered.
    pub fn subscribe(&self, id: ClientId, project: &str) -> bool {
        let mut hub = self.hub();
        if !hub.clients.contains_key(&id) {
            return false;
        }
        hub.subscriptions
            .entry(project.to_string())
            .or_default()
            .insert(id);
        true
    }

    pub fn unsubscribe(&self, id: ClientId, project: &str) {
        let mut hub = self.hub();
        if let Some(ids) = hub.subscriptions.get_mut(project) {
            ids.remove(&id);
            if ids.is_empty() {
                hub.subscriptions.remove(project);
            }
        }
    }

    /// Send an event to every subscriber of its project. Serializes once;
    /// a client whose channel is gone is logged and skipped. Returns the
    /// number of clients reached.
    pub fn broadcast(&self, message: &EventMessage) -> usize {
        let hub = self.hub();
        let Some(ids) = hub.subscriptions.get(&message.project_slug) else {
            return 0;
        };
        let payload: Arc<str> = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                log::error!(
                    "[markban.ws.broadcast] Cannot serialize {}: {}",
                    message.event.kind(),
                    e
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for id in ids {
            let Some(client) = hub.clients.get(id) else {
                continue;
            };
            match client.sender.send(Outbound::Text(payload.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => log::warn!(
                    "[markban.ws.broadcast] Client {} unreachable, skipping {}",
                    id,
                    message.event.kind()
                ),
            }
        }
        delivered
    }

    /// Send a direct message to one client.
    pub fn send_to(&self, id: ClientId, frame: Outbound) -> bool {
        self.hub()
            .clients
            .get(&id)
            .is_some_and(|c| c.sender.send(frame).is_ok())
    }

    /// Record a pong (or any sign of life) from a client.
    pub fn mark_alive(&self, id: ClientId) {
        if let Some(client) = self.hub().clients.get_mut(&id) {
            client.alive = true;
        }
    }

    /// Ping every client and mark it unresponsive until it answers.
    pub fn ping_all(&self) {
        for client in self.hub().clients.values_mut() {
            client.alive = false;
            let _ = client.sender.send(Outbound::Ping);
        }
    }

    /// Close and forget every client that did not answer the last ping.
    pub fn reap_unresponsive(&self) -> usize {
        let dead: Vec<ClientId> = {
            let hub = self.hub();
            hub.clients
                .iter()
                .filter(|(_, c)| !c.alive)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &dead {
            self.send_to(*id, Outbound::Close);
            self.unregister_client(*id);
            log::info!("[markban.ws.heartbeat] Closed unresponsive client {}", id);
        }
        dead.len()
    }

    pub fn client_count(&self) -> usize {
        self.hub().clients.len()
    }

    pub fn subscriber_count(&self, project: &str) -> usize {
        self.hub().subscriptions.get(project).map_or(0, HashSet::len)
    }
}

/// Periodically ping clients and drop the ones that stay silent for
/// `pong_timeout`. Returns `None` when the heartbeat is disabled.
pub fn spawn_heartbeat(
    hub: Arc<Broadcaster>,
    settings: &HeartbeatSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if !settings.enabled {
        log::info!("[markban.ws.heartbeat] Disabled");
        return None;
    }
    let interval = settings.interval();
    let pong_timeout = settings.pong_timeout();

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            hub.ping_all();
            tokio::select! {
                _ = tokio::time::sleep(pong_timeout) => {}
                _ = shutdown.changed() => break,
            }
            hub.reap_unresponsive();
        }
        log::debug!("[markban.ws.heartbeat] Stopped");
    }))
}
