//! The global supervisor table: at most one supervisor per client name.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::watch;

use warden_protocol::HandoffState;

use crate::{
    error::{Error, Result},
    supervisor::{Shared, Supervisor, SupervisorDeps, SupervisorHandle, SupervisorState},
};

struct Entry {
    id: u64,
    handle: SupervisorHandle,
}

#[derive(Clone)]
pub struct SupervisorTable {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
    count: Arc<watch::Sender<usize>>,
    next_id: Arc<AtomicU64>,
}

impl Default for SupervisorTable {
    fn default() -> Self {
        Self {
            entries: Arc::default(),
            count: Arc::new(watch::channel(0).0),
            next_id: Arc::default(),
        }
    }
}

/// Removes a supervisor's entry when its task ends, however it ends.
struct EntryGuard {
    table: SupervisorTable,
    name: String,
    id: u64,
    shared: Arc<Shared>,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.shared.state.send_replace(SupervisorState::Terminated);
        let mut entries = self.table.write();
        if entries.get(&self.name).is_some_and(|e| e.id == self.id) {
            entries.remove(&self.name);
        }
        self.table.count.send_replace(entries.len());
    }
}

impl SupervisorTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a supervisor for `name`, resuming `resume` if given.
    pub fn start(
        &self,
        name: &str,
        deps: SupervisorDeps,
        resume: Option<HandoffState>,
    ) -> Result<SupervisorHandle> {
        let mut entries = self.write();
        if entries.contains_key(name) {
            return Err(Error::already_running(name));
        }
        let (handle, supervisor) = Supervisor::new(name, deps, resume);
        let guard = EntryGuard {
            table: self.clone(),
            name: name.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&handle.shared),
        };
        let id = guard.id;
        let task = tokio::spawn(async move {
            let _guard = guard;
            supervisor.run().await;
        });
        handle.set_abort(task.abort_handle());
        entries.insert(name.to_string(), Entry {
            id,
            handle: handle.clone(),
        });
        self.count.send_replace(entries.len());
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<SupervisorHandle> {
        self.read().get(name).map(|e| e.handle.clone())
    }

    pub fn handles(&self) -> Vec<SupervisorHandle> {
        self.read().values().map(|e| e.handle.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every supervisor to stop.
    pub fn stop_all(&self, reason: &str) {
        for handle in self.handles() {
            handle.stop(reason);
        }
    }

    /// Resolves once no supervisor is left.
    pub async fn wait_empty(&self) {
        let mut count = self.count.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}
