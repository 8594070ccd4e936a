//! In-memory bookkeeping that lets a removal invalidate a cron firing which
//! has already been dispatched but has not started work yet.
//!
//! There is one slot per schedule id. A [`TaskToken`] names a slot *and* the
//! generation it was issued for, so a token from before a re-registration
//! never validates against the new slot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use kinspect_core::ScheduleId;
use serde::Serialize;

use crate::trigger::TriggerId;

/// Handle captured by a trigger's firing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskToken {
    schedule_id: ScheduleId,
    generation: u64,
}

impl TaskToken {
    pub fn schedule_id(&self) -> ScheduleId {
        self.schedule_id
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tc-{}-{:x}", self.schedule_id, self.generation)
    }
}

/// Snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskControl {
    pub token: TaskToken,
    pub trigger_id: TriggerId,
    pub schedule_id: ScheduleId,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    trigger_id: TriggerId,
    is_deleted: bool,
    created_at: DateTime<Utc>,
}

impl Slot {
    fn snapshot(&self, schedule_id: ScheduleId) -> TaskControl {
        TaskControl {
            token: TaskToken {
                schedule_id,
                generation: self.generation,
            },
            trigger_id: self.trigger_id,
            schedule_id,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
        }
    }
}

/// Registry of live task controls, at most one per schedule.
///
/// Firing jobs call [`is_deleted`](Self::is_deleted) on every tick, so
/// the slots sit behind a read-mostly lock.
#[derive(Debug, Default)]
pub struct TaskControlRegistry {
    slots: RwLock<HashMap<ScheduleId, Slot>>,
    next_generation: AtomicU64,
}

impl TaskControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ScheduleId, Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ScheduleId, Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh token for `schedule_id`, discarding any previous slot.
    pub fn register(&self, schedule_id: ScheduleId, trigger_id: TriggerId) -> TaskToken {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.write().insert(
            schedule_id,
            Slot {
                generation,
                trigger_id,
                is_deleted: false,
                created_at: Utc::now(),
            },
        );
        TaskToken {
            schedule_id,
            generation,
        }
    }

    /// Flag the current slot for `schedule_id`. Returns whether a slot existed.
    pub fn mark_deleted(&self, schedule_id: ScheduleId) -> bool {
        match self.write().get_mut(&schedule_id) {
            Some(slot) => {
                slot.is_deleted = true;
                true
            }
            None => false,
        }
    }

    /// Whether work guarded by `token` must be skipped.
    ///
    /// Unknown tokens count as deleted.
    pub fn is_deleted(&self, token: &TaskToken) -> bool {
        match self.read().get(&token.schedule_id) {
            Some(slot) => slot.generation != token.generation || slot.is_deleted,
            None => true,
        }
    }

    pub fn remove(&self, schedule_id: ScheduleId) {
        self.write().remove(&schedule_id);
    }

    pub fn get(&self, schedule_id: ScheduleId) -> Option<TaskControl> {
        self.read().get(&schedule_id).map(|slot| slot.snapshot(schedule_id))
    }

    /// All entries not flagged deleted, ordered by schedule id.
    pub fn list_active(&self) -> Vec<TaskControl> {
        let mut active: Vec<TaskControl> = self
            .read()
            .iter()
            .filter(|(_, slot)| !slot.is_deleted)
            .map(|(id, slot)| slot.snapshot(*id))
            .collect();
        active.sort_by_key(|c| c.schedule_id);
        active
    }
}
