use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    None,
    #[default]
    Total,
    /// Total plus one live line per in-flight file.
    Tasks,
}

#[derive(Debug, Clone, Default)]
struct SlotState {
    label: String,
    bytes_done: u64,
    bytes_total: u64,
    pending_parts: u64,
    active: bool,
}

/// Handle to one per-file display slot. Absent (`None` from
/// [`ProgressTracker::acquire_slot`]) when per-task display is off; every
/// slot operation is simply skipped in that case.
#[derive(Debug)]
pub struct Slot {
    index: usize,
}

#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub label: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub slots: Vec<Option<SlotSnapshot>>,
}

/// Shared progress state for one invocation. Totals are plain atomics so
/// updates from any number of workers are never lost; display slots are a
/// fixed pool guarded by a semaphore.
#[derive(Debug)]
pub struct ProgressTracker {
    mode: ProgressMode,
    files_done: AtomicU64,
    files_total: AtomicU64,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    semaphore: Semaphore,
    free: Mutex<Vec<usize>>,
    slots: Vec<Mutex<SlotState>>,
}

impl ProgressTracker {
    pub fn new(mode: ProgressMode, slot_count: usize) -> Self {
        let slot_count = match mode {
            ProgressMode::Tasks => slot_count.max(1),
            _ => 0,
        };
        Self {
            mode,
            files_done: AtomicU64::new(0),
            files_total: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            semaphore: Semaphore::new(slot_count),
            free: Mutex::new((0..slot_count).rev().collect()),
            slots: (0..slot_count)
                .map(|_| Mutex::new(SlotState::default()))
                .collect(),
        }
    }

    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    pub fn set_planned(&self, files: u64, bytes: u64) {
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
    }

    /// Claim a display slot, waiting when all slots are occupied. Returns
    /// `None` immediately when per-task display is not configured.
    pub async fn acquire_slot(&self, label: &str, bytes_total: u64) -> Option<Slot> {
        if self.slots.is_empty() {
            return None;
        }
        let permit = self.semaphore.acquire().await.ok()?;
        permit.forget();
        let index = self
            .free
            .lock()
            .expect("slot free list poisoned")
            .pop()
            .expect("semaphore permit without free slot");

        let mut state = self.slots[index].lock().expect("slot state poisoned");
        *state = SlotState {
            label: label.to_string(),
            bytes_done: 0,
            bytes_total,
            pending_parts: 0,
            active: true,
        };
        drop(state);
        Some(Slot { index })
    }

    pub fn release_slot(&self, slot: Slot) {
        let mut state = self.slots[slot.index].lock().expect("slot state poisoned");
        state.active = false;
        drop(state);
        self.free
            .lock()
            .expect("slot free list poisoned")
            .push(slot.index);
        self.semaphore.add_permits(1);
    }

    /// Record `delta` transferred bytes against the run total and, when a
    /// slot is held, against that file's line.
    pub fn add_bytes(&self, slot: Option<&Slot>, delta: u64) {
        self.bytes_done.fetch_add(delta, Ordering::Relaxed);
        if let Some(slot) = slot {
            let mut state = self.slots[slot.index].lock().expect("slot state poisoned");
            state.bytes_done += delta;
        }
    }

    pub fn increment_files(&self, delta: u64) {
        self.files_done.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set_usage(&self, slot: &Slot, pending_parts: u64) {
        let mut state = self.slots[slot.index].lock().expect("slot state poisoned");
        state.pending_parts = pending_parts;
    }

    /// Mark one part of the slot's file complete, returning how many remain.
    /// Zero means the last chunk for that file just finished.
    pub fn decrement_usage(&self, slot: &Slot) -> u64 {
        let mut state = self.slots[slot.index].lock().expect("slot state poisoned");
        state.pending_parts = state.pending_parts.saturating_sub(1);
        state.pending_parts
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::Relaxed)
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_done: self.files_done.load(Ordering::Relaxed),
            files_total: self.files_total.load(Ordering::Relaxed),
            bytes_done: self.bytes_done.load(Ordering::Relaxed),
            bytes_total: self.bytes_total.load(Ordering::Relaxed),
            slots: self
                .slots
                .iter()
                .map(|slot| {
                    let state = slot.lock().expect("slot state poisoned");
                    state.active.then(|| SlotSnapshot {
                        label: state.label.clone(),
                        bytes_done: state.bytes_done,
                        bytes_total: state.bytes_total,
                    })
                })
                .collect(),
        }
    }
}
