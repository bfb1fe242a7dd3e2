use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Proof that a caller owns the run slot for a project.
///
/// Only the holder of the current ticket may attach a handle to the slot
/// or release it, so a finished run can never clear a newer claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket(u64);

struct RunSlot {
    ticket: RunTicket,
    handle: Option<JoinHandle<()>>,
}

/// Supervises the background generation task of every project.
///
/// At most one slot exists per project id. A slot is claimed before the
/// task is spawned, so two concurrent `start_run` calls cannot both win.
pub struct RunRegistry {
    slots: Mutex<HashMap<String, RunSlot>>,
    next_ticket: AtomicU64,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Reserve the slot for `project_id`. Returns `None` if a run already holds it.
    pub async fn try_claim(&self, project_id: &str) -> Option<RunTicket> {
        let mut slots = self.slots.lock().await;
        if slots.contains_key(project_id) {
            return None;
        }
        let ticket = RunTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        slots.insert(
            project_id.to_string(),
            RunSlot {
                ticket,
                handle: None,
            },
        );
        Some(ticket)
    }

    /// Give up a slot without having spawned anything.
    pub async fn release(&self, project_id: &str, ticket: RunTicket) {
        let mut slots = self.slots.lock().await;
        if slots.get(project_id).is_some_and(|s| s.ticket == ticket) {
            slots.remove(project_id);
        }
    }

    /// Spawn `run` into a claimed slot. The slot is released when `run` finishes.
    pub async fn spawn<F>(self: &Arc<Self>, project_id: &str, ticket: RunTicket, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Holding the lock across spawn keeps the task from releasing the
        // slot before its handle is attached.
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(project_id).filter(|s| s.ticket == ticket) else {
            tracing::warn!(project_id, "run slot lost before spawn, dropping run");
            return;
        };
        let registry = Arc::clone(self);
        let key = project_id.to_string();
        slot.handle = Some(tokio::spawn(async move {
            run.await;
            registry.release(&key, ticket).await;
        }));
    }

    pub async fn is_active(&self, project_id: &str) -> bool {
        self.slots.lock().await.contains_key(project_id)
    }

    pub async fn active_count(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Abort the run for `project_id` and wait for its task to unwind.
    ///
    /// The slot stays claimed until the task is gone, so no new run can
    /// start while the old one is still finishing a poll. Returns whether
    /// a slot was held.
    pub async fn abort(&self, project_id: &str) -> bool {
        let (ticket, handle) = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(project_id) else {
                return false;
            };
            (slot.ticket, slot.handle.take())
        };
        if let Some(handle) = handle {
            join_aborted(project_id, handle).await;
        }
        self.release(project_id, ticket).await;
        tracing::info!(project_id, "generation run aborted");
        true
    }

    /// Abort every run and wait for each task to unwind.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, RunSlot)> = self.slots.lock().await.drain().collect();
        for (project_id, slot) in drained {
            let Some(handle) = slot.handle else { continue };
            tracing::info!(project_id = %project_id, "shutting down generation run");
            join_aborted(&project_id, handle).await;
        }
    }
}

async fn join_aborted(project_id: &str, handle: JoinHandle<()>) {
    handle.abort();
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => {
            tracing::warn!(project_id, error = %e, "generation run panicked");
        }
    }
}
