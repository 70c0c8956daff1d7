//! Registry of active listeners, used for orderly shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::handler::HandlerError;

/// Identifier handed out by [`ConnectionManager::add`]. Ids are positive
/// and never reused within a process lifetime.
pub type ConnId = u64;

/// Anything the manager can shut down.
pub trait Closer: Send + Sync {
    fn close(&self) -> Result<(), HandlerError>;
}

#[derive(Default)]
pub struct ConnectionManager {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_conn_id: ConnId,
    closers: HashMap<ConnId, Arc<dyn Closer>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        // The critical sections below are plain map operations; recover the
        // guard so the registry keeps working if a holder ever panicked.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a closer and return its id.
    pub fn add(&self, closer: Arc<dyn Closer>) -> ConnId {
        let mut inner = self.locked();
        inner.next_conn_id += 1;
        let id = inner.next_conn_id;
        inner.closers.insert(id, closer);
        id
    }

    /// Remove an entry. Missing ids are not an error.
    pub fn del(&self, id: ConnId) {
        self.locked().closers.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.locked().closers.len()
    }

    /// Close every registered handler. Shutdown is best-effort: individual
    /// close errors are ignored. The map is not cleared here; receive tasks
    /// delete their own entry as they exit, so there is no double-delete.
    pub fn close_all(&self) {
        let inner = self.locked();
        for closer in inner.closers.values() {
            let _ = closer.close();
        }
    }
}
