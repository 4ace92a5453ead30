use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;

use pairspeed_types::Envelope;

/// Backlog of undelivered frames per session.
pub const SESSION_QUEUE: usize = 100;

/// Session identifiers are drawn from `1..ID_SPACE`.
pub const ID_SPACE: u64 = 1 << 22;

/// Routes relayed payloads between live sessions.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    sessions: RwLock<HashMap<u64, mpsc::Sender<Envelope>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh random identifier. Returns the
    /// identifier and the receiving end of its delivery queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let mut sessions = self.inner.sessions.write();
        let mut rng = rand::rng();
        let id = loop {
            let candidate = rng.random_range(1..ID_SPACE);
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(id, tx);
        debug!(id, live = sessions.len(), "session registered");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        let mut sessions = self.inner.sessions.write();
        if sessions.remove(&id).is_some() {
            debug!(id, live = sessions.len(), "session unregistered");
        }
    }

    /// Queue `datab64` for `dest`. Returns whether `dest` is a live session.
    /// Waits while the destination's queue is full.
    pub async fn send_to(&self, src: u64, dest: u64, datab64: String) -> bool {
        let Some(tx) = self.inner.sessions.read().get(&dest).cloned() else {
            return false;
        };
        tx.send(Envelope::delivery(src, dest, datab64)).await.is_ok()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.inner.sessions.read().contains_key(&id)
    }
}
