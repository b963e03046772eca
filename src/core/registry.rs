//! Administrative introspection and the kill switch tests use to simulate a
//! crash originating from a *different* stage than the one running the
//! user callback (for example, a consumer's `handle_batch` killing its own
//! batcher). Mirrors the name→handle lookup pattern `liminal`'s own
//! `registry.rs` reaches for, but keyed to `AbortHandle`s instead of
//! message senders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::AbortHandle;

#[derive(Clone, Default)]
pub struct StageRegistry {
    handles: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handle: AbortHandle) {
        self.handles.lock().unwrap().insert(name.into(), handle);
    }

    pub fn names(&self) -> Vec<String> {
        self.handles.lock().unwrap().keys().cloned().collect()
    }

    /// Aborts the named stage's current incarnation. Its owning supervisor
    /// observes the abort as an unexpected exit and applies its restart
    /// policy exactly as it would for a panic. Returns `false` if no stage
    /// is registered under that name.
    pub fn kill(&self, name: &str) -> bool {
        match self.handles.lock().unwrap().get(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}
