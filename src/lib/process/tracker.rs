use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};

use super::types::{ProcessHandle, ProcessTracker, SupervisorError, SupervisorResult, TrackedCounts};

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ProcessHandle>>> {
        match self.processes.lock() {
            Ok(processes) => processes,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<dyn ProcessHandle>> {
        self.lock().get(container_id).cloned()
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.lock().contains_key(container_id)
    }

    /// Tracks `handle`, refusing if the container already has one.
    pub fn insert(&self, container_id: &str, handle: Arc<dyn ProcessHandle>) -> SupervisorResult<()> {
        let mut processes = self.lock();
        if processes.contains_key(container_id) {
            return Err(SupervisorError::AlreadyTracked(container_id.to_string()));
        }
        processes.insert(container_id.to_string(), handle);
        Ok(())
    }

    /// Drops the entry only if it still is `handle`, so a late exit of an old
    /// process cannot untrack its replacement.
    pub fn release(&self, container_id: &str, handle: &Arc<dyn ProcessHandle>) -> bool {
        let mut processes = self.lock();
        match processes.get(container_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                processes.remove(container_id);
                true
            }
            _ => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn counts(&self) -> TrackedCounts {
        let processes = self.lock();
        let attached = processes.values().filter(|handle| handle.is_attach()).count() as u64;
        TrackedCounts {
            launched: processes.len() as u64 - attached,
            attached,
        }
    }
}
