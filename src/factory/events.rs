use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::models::ProjectEvent;

/// Number of events retained per project for replay.
pub const HISTORY_LIMIT: usize = 500;

/// A live subscription to one project's event stream.
///
/// `history` holds the events retained at subscribe time; everything
/// published afterwards arrives on `receiver`. The two never overlap.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub project_id: String,
    pub history: Vec<ProjectEvent>,
    pub receiver: mpsc::UnboundedReceiver<ProjectEvent>,
}

#[derive(Default)]
struct ProjectChannel {
    history: VecDeque<ProjectEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<ProjectEvent>>,
}

#[derive(Default)]
struct BusState {
    next_subscriber_id: u64,
    channels: HashMap<String, ProjectChannel>,
}

/// In-process publish/subscribe broker with bounded per-project replay.
///
/// History append, fan-out and subscriber registration all happen under one
/// mutex, so a subscribe racing a publish sees each event exactly once. No
/// I/O or await happens while the lock is held; subscriber queues are
/// unbounded and `send` never blocks.
pub struct EventBus {
    state: Mutex<BusState>,
    history_limit: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber and snapshot the retained history.
    pub fn subscribe(&self, project_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_subscriber_id += 1;
        let id = state.next_subscriber_id;
        let channel = state.channels.entry(project_id.to_string()).or_default();
        let history = channel.history.iter().cloned().collect();
        channel.subscribers.insert(id, tx);
        tracing::debug!(project_id, subscriber_id = id, "subscriber registered");
        Subscription {
            id,
            project_id: project_id.to_string(),
            history,
            receiver: rx,
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, project_id: &str, subscriber_id: u64) {
        let mut state = self.lock();
        if let Some(channel) = state.channels.get_mut(project_id)
            && channel.subscribers.remove(&subscriber_id).is_some()
        {
            tracing::debug!(project_id, subscriber_id, "subscriber removed");
        }
    }

    /// Append to the project's history and deliver to current subscribers.
    pub fn publish(&self, event: ProjectEvent) {
        let mut state = self.lock();
        let channel = state.channels.entry(event.project_id.clone()).or_default();
        channel.history.push_back(event.clone());
        while channel.history.len() > self.history_limit {
            channel.history.pop_front();
        }
        // Receivers dropped by disconnected clients are pruned here.
        channel
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Copy of the retained history for a project.
    pub fn history(&self, project_id: &str) -> Vec<ProjectEvent> {
        self.lock()
            .channels
            .get(project_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.lock()
            .channels
            .get(project_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Drop every subscription and all history. Outstanding receivers see
    /// their channel close.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let channels = state.channels.len();
        state.channels.clear();
        tracing::info!(channels, "event bus shut down");
    }
}
