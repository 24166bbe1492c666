//! In-process content store for embedding and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use tandem_core::LogEntry;

use super::{ContentStore, StoreError};

/// Contents keyed by (project, file).
#[derive(Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<(Uuid, Uuid), String>>,
    changes: Mutex<HashMap<Uuid, Vec<LogEntry>>>,
    /// Every successful save, in order
    saves: Mutex<Vec<(Uuid, String)>>,
    save_attempts: AtomicUsize,
    fail_saves: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, project_id: Uuid, file_id: Uuid, content: impl Into<String>) {
        lock(&self.files).insert((project_id, file_id), content.into());
    }

    pub fn file(&self, project_id: Uuid, file_id: Uuid) -> Option<String> {
        lock(&self.files).get(&(project_id, file_id)).cloned()
    }

    pub fn push_change(&self, project_id: Uuid, entry: LogEntry) {
        lock(&self.changes).entry(project_id).or_default().push(entry);
    }

    /// Reject every following save with a 503.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Reject every following fetch with a 503.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far, oldest first.
    pub fn saves(&self) -> Vec<(Uuid, String)> {
        lock(&self.saves).clone()
    }

    pub fn save_count(&self) -> usize {
        lock(&self.saves).len()
    }

    /// Saves attempted, including rejected ones.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ContentStore for MemoryStore {
    async fn fetch_content(&self, project_id: Uuid, file_id: Uuid) -> Result<String, StoreError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Http { status: 503 });
        }
        self.file(project_id, file_id)
            .ok_or(StoreError::NotFound(file_id))
    }

    async fn save_content(
        &self,
        project_id: Uuid,
        file_id: Uuid,
        content: String,
    ) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Http { status: 503 });
        }
        lock(&self.files).insert((project_id, file_id), content.clone());
        lock(&self.saves).push((file_id, content));
        Ok(())
    }

    async fn fetch_change_log(&self, project_id: Uuid) -> Result<Vec<LogEntry>, StoreError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(StoreError::Http { status: 503 });
        }
        Ok(lock(&self.changes).get(&project_id).cloned().unwrap_or_default())
    }
}
