//! Debounced durable saves of full buffer snapshots.
//!
//! ```text
//! edit ─► arm(file, snapshot) ─► [quiet window] ─► fire ─► save_content
//! edit ─► arm ... (re-arm: timer restarts, snapshot replaced)
//! ```
//!
//! Per file there is at most one save in flight. A timer that fires while a
//! save is running leaves its snapshot pending; the running save picks it up
//! when it finishes, so only the newest state is ever written. Failures are
//! reported once on the notice channel and never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{ContentStore, StoreError};

#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Quiet period after the last edit before saving (default: 1000ms)
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(1000),
        }
    }
}

impl DebounceConfig {
    pub fn for_testing() -> Self {
        Self {
            window: Duration::from_millis(50),
        }
    }
}

/// Outcome of a durable save, for transient UI notices.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveNotice {
    Saved { file_id: Uuid, bytes: usize },
    Failed { file_id: Uuid, error: StoreError },
}

#[derive(Default)]
struct SaveSlot {
    /// Bumped on every arm so a superseded timer can tell it is stale
    generation: u64,
    snapshot: Option<String>,
    timer: Option<JoinHandle<()>>,
    in_flight: bool,
}

struct Inner<S> {
    store: Arc<S>,
    project_id: Uuid,
    window: Duration,
    slots: Mutex<HashMap<Uuid, SaveSlot>>,
    notices: mpsc::UnboundedSender<SaveNotice>,
}

impl<S> Inner<S> {
    fn slots(&self) -> MutexGuard<'_, HashMap<Uuid, SaveSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coalesces edits into one save per quiet window, per file.
pub struct PersistenceDebouncer<S: ContentStore> {
    inner: Arc<Inner<S>>,
}

impl<S: ContentStore> PersistenceDebouncer<S> {
    pub fn new(
        store: Arc<S>,
        project_id: Uuid,
        config: DebounceConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SaveNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            store,
            project_id,
            window: config.window,
            slots: Mutex::new(HashMap::new()),
            notices,
        });
        (Self { inner }, notice_rx)
    }

    /// Replace the pending snapshot for a file and restart its quiet window.
    pub fn arm(&self, file_id: Uuid, snapshot: String) {
        let mut slots = self.inner.slots();
        let slot = slots.entry(file_id).or_default();
        slot.generation += 1;
        slot.snapshot = Some(snapshot);
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        let generation = slot.generation;
        let inner = Arc::clone(&self.inner);
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            fire(inner, file_id, generation).await;
        }));
    }

    /// Save the pending snapshot now instead of waiting for the timer.
    ///
    /// Returns `Ok(false)` if nothing was pending, or if a save is already
    /// running for the file; that save writes the snapshot when it finishes.
    pub async fn flush(&self, file_id: Uuid) -> Result<bool, StoreError> {
        let snapshot = {
            let mut slots = self.inner.slots();
            let Some(slot) = slots.get_mut(&file_id) else {
                return Ok(false);
            };
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            if slot.in_flight || slot.snapshot.is_none() {
                return Ok(false);
            }
            slot.in_flight = true;
            slot.snapshot.take()
        };
        match snapshot {
            Some(snapshot) => drain(&self.inner, file_id, snapshot).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Drop the pending snapshot and timer for a file. A running save is not
    /// interrupted.
    pub fn cancel(&self, file_id: Uuid) -> bool {
        let mut slots = self.inner.slots();
        let Some(slot) = slots.get_mut(&file_id) else {
            return false;
        };
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.snapshot.take().is_some()
    }

    /// Abort every timer and drop every pending snapshot.
    pub fn shutdown(&self) {
        let mut slots = self.inner.slots();
        let mut dropped = 0;
        for slot in slots.values_mut() {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
            dropped += usize::from(slot.snapshot.take().is_some());
        }
        if dropped > 0 {
            log::info!("Debouncer shut down with {dropped} unsaved snapshot(s)");
        }
    }

    pub fn is_pending(&self, file_id: Uuid) -> bool {
        self.inner
            .slots()
            .get(&file_id)
            .is_some_and(|slot| slot.snapshot.is_some())
    }

    pub fn is_in_flight(&self, file_id: Uuid) -> bool {
        self.inner
            .slots()
            .get(&file_id)
            .is_some_and(|slot| slot.in_flight)
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }
}

impl<S: ContentStore> Drop for PersistenceDebouncer<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn fire<S: ContentStore>(inner: Arc<Inner<S>>, file_id: Uuid, generation: u64) {
    let snapshot = {
        let mut slots = inner.slots();
        let Some(slot) = slots.get_mut(&file_id) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        // From here on the task is a save, not a timer: arm must not abort it.
        slot.timer = None;
        if slot.in_flight {
            log::trace!("Save for {file_id} deferred behind running save");
            return;
        }
        let Some(snapshot) = slot.snapshot.take() else {
            return;
        };
        slot.in_flight = true;
        snapshot
    };
    // Failures were already reported on the notice channel.
    let _ = drain(&inner, file_id, snapshot).await;
}

/// Save `snapshot`, then keep saving whatever a deferred timer left pending.
/// Expects the slot's `in_flight` flag to be set and clears it on exit.
async fn drain<S: ContentStore>(
    inner: &Inner<S>,
    file_id: Uuid,
    mut snapshot: String,
) -> Result<(), StoreError> {
    loop {
        let bytes = snapshot.len();
        let result = inner
            .store
            .save_content(inner.project_id, file_id, snapshot)
            .await;

        let notice = match &result {
            Ok(()) => {
                log::debug!("Saved file {file_id} ({bytes} bytes)");
                SaveNotice::Saved { file_id, bytes }
            }
            Err(e) => {
                log::warn!("Save of file {file_id} failed: {e}");
                SaveNotice::Failed {
                    file_id,
                    error: e.clone(),
                }
            }
        };
        let _ = inner.notices.send(notice);

        let mut slots = inner.slots();
        let Some(slot) = slots.get_mut(&file_id) else {
            return result;
        };
        match slot.snapshot.take() {
            Some(next) if slot.timer.is_none() => snapshot = next,
            pending => {
                slot.snapshot = pending;
                slot.in_flight = false;
                return result;
            }
        }
    }
}
