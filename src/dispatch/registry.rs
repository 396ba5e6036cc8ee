//! Result registry: per-task completion slots readers wait on.
//!
//! Each slot transitions to a terminal state exactly once and is
//! observed at most once (read-and-remove). A reader timeout leaves the
//! slot in place so a late completion stays collectable until the
//! dispatcher stops or the caller discards it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::task::TaskOutcome;
use crate::error::DispatchError;

/// Admission guard: submits beyond this many unconsumed slots are
/// refused rather than allowed to grow the registry without bound.
pub const MAX_PENDING_SLOTS: usize = 4096;

#[derive(Debug)]
enum SlotState {
    Pending,
    Terminal(TaskOutcome),
}

struct ResultSlot {
    state: Mutex<SlotState>,
    ready: Notify,
}

impl ResultSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Notify::new(),
        }
    }
}

/// Concurrent map from task id to completion slot.
#[derive(Default)]
pub struct ResultRegistry {
    slots: Mutex<HashMap<Uuid, Arc<ResultSlot>>>,
}

impl ResultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending slot for a freshly submitted task.
    ///
    /// Returns false when admission is saturated.
    pub fn insert(&self, id: Uuid) -> bool {
        let mut slots = self.slots.lock().expect("registry lock");
        if slots.len() >= MAX_PENDING_SLOTS {
            return false;
        }
        slots.insert(id, Arc::new(ResultSlot::new()));
        true
    }

    /// Post a terminal outcome. The first resolution wins; later calls
    /// are ignored so a salvaged task's original host cannot clobber the
    /// replacement's result.
    pub fn resolve(&self, id: Uuid, outcome: TaskOutcome) -> bool {
        let slot = {
            let slots = self.slots.lock().expect("registry lock");
            match slots.get(&id) {
                Some(slot) => Arc::clone(slot),
                None => return false,
            }
        };
        let mut state = slot.state.lock().expect("slot lock");
        match *state {
            SlotState::Pending => {
                *state = SlotState::Terminal(outcome);
                drop(state);
                slot.ready.notify_waiters();
                true
            }
            SlotState::Terminal(_) => false,
        }
    }

    /// Non-blocking read. A terminal outcome is removed on observation.
    pub fn poll(&self, id: Uuid) -> Result<TaskOutcome, DispatchError> {
        let slot = self.get(id)?;
        let state = slot.state.lock().expect("slot lock");
        match &*state {
            SlotState::Pending => Err(DispatchError::Pending { id }),
            SlotState::Terminal(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                self.remove(id);
                Ok(outcome)
            }
        }
    }

    /// Blocking read bounded by an optional timeout.
    ///
    /// On expiry the slot is left pending-side untouched; only a
    /// terminal observation removes it.
    pub async fn wait(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<TaskOutcome, DispatchError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        // Hold the slot across iterations: `fail_all` drains the map
        // before waiters run, but they still observe the outcome.
        let slot = self.get(id)?;
        loop {
            // Arm the waiter before re-checking state so a resolve
            // between the check and the await cannot be missed.
            let mut notified = std::pin::pin!(slot.ready.notified());
            notified.as_mut().enable();
            {
                let state = slot.state.lock().expect("slot lock");
                if let SlotState::Terminal(outcome) = &*state {
                    let outcome = outcome.clone();
                    drop(state);
                    self.remove(id);
                    return Ok(outcome);
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(DispatchError::Timeout {
                            id,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Drop a slot a reader has given up on. Returns false for unknown
    /// ids.
    pub fn discard(&self, id: Uuid) -> bool {
        self.slots
            .lock()
            .expect("registry lock")
            .remove(&id)
            .is_some()
    }

    /// Resolve every still-pending slot (dispatcher stop), then clear
    /// the registry. Woken waiters observe the outcome before the map is
    /// emptied because each holds its own `Arc` to the slot.
    pub fn fail_all(&self, outcome: impl Fn() -> TaskOutcome) {
        let slots: Vec<Arc<ResultSlot>> = {
            let mut map = self.slots.lock().expect("registry lock");
            map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let mut state = slot.state.lock().expect("slot lock");
            if matches!(*state, SlotState::Pending) {
                *state = SlotState::Terminal(outcome());
            }
            drop(state);
            slot.ready.notify_waiters();
        }
    }

    /// Tasks admitted and not yet consumed by a reader.
    pub fn depth(&self) -> usize {
        self.slots.lock().expect("registry lock").len()
    }

    fn get(&self, id: Uuid) -> Result<Arc<ResultSlot>, DispatchError> {
        self.slots
            .lock()
            .expect("registry lock")
            .get(&id)
            .cloned()
            .ok_or(DispatchError::UnknownTask { id })
    }

    fn remove(&self, id: Uuid) {
        self.slots.lock().expect("registry lock").remove(&id);
    }
}
