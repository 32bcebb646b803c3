/// Shared application state passed to axum handlers.
use std::sync::{Arc, Mutex};

use markban_core::events::{BoardEvent, Broadcaster, EventMessage};
use markban_core::history::HistoryRecorder;
use markban_core::storage::local::CardStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<CardStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub history: HistoryRecorder,
    pub bind_address: String,
    /// Port actually bound (differs from the configured one when it was 0).
    pub live_port: Arc<Mutex<u16>>,
}

impl AppState {
    /// Fan an event out to the project's subscribers and record it in the
    /// project's history, announcing the new history entry as well.
    pub async fn publish(&self, project: &str, event: BoardEvent) {
        let entry = self.history.record_event(project, &event).await;
        self.broadcaster.broadcast(&EventMessage::new(project, event));
        if let Some(entry) = entry {
            self.broadcaster
                .broadcast(&EventMessage::new(project, BoardEvent::HistoryEvent { entry }));
        }
    }
}
