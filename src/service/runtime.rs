//! Process-wide runtime state shared by the service, its workers and the
//! status surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::context::{ContextSnapshot, ScraperContext};

pub struct RuntimeState {
    active: Mutex<HashMap<String, Arc<ScraperContext>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        RuntimeState {
            active: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Track a context for the duration of its task. Returns `false` when the
    /// match is already being scraped.
    pub fn register(&self, ctx: Arc<ScraperContext>) -> bool {
        let mut active = self.lock();
        if active.contains_key(&ctx.match_id) {
            return false;
        }
        active.insert(ctx.match_id.clone(), ctx);
        true
    }

    pub fn unregister(&self, match_id: &str) -> Option<Arc<ScraperContext>> {
        self.lock().remove(match_id)
    }

    pub fn active_matches(&self) -> usize {
        self.lock().len()
    }

    pub fn contexts(&self) -> Vec<Arc<ScraperContext>> {
        self.lock().values().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<ContextSnapshot> {
        let mut snaps: Vec<ContextSnapshot> = self.lock().values().map(|c| c.snapshot()).collect();
        snaps.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        snaps
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ScraperContext>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once shutdown has been signalled (or the sender is gone).
pub async fn shutdown_signalled(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
