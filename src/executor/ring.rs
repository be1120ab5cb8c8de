//! Result Ring
//!
//! A fixed-capacity circular store of task slots indexed by
//! `sequence mod capacity`. Writing a slot always replaces whatever occupied
//! it before; that overwrite is the only eviction mechanism.
//!
//! Reads compare the requested id with the id stored in the slot, which is how
//! a result that was overwritten (stale) is told apart from one that was
//! consumed (disposed).

use super::types::{RingSlot, SlotState, TaskId, TaskOutcome};

/// Result of looking a task id up in the ring.
#[derive(Debug, Clone, PartialEq)]
pub enum RingRead {
    Outcome(TaskOutcome),
    /// The slot now belongs to another task, or was never written.
    Stale,
    /// The slot still belongs to this task but was disposed.
    Empty,
    /// The task has not reached a terminal state yet.
    InFlight,
}

pub struct ResultRing {
    slots: Vec<Option<RingSlot>>,
}

impl ResultRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index_of(&self, task_id: TaskId) -> usize {
        (task_id.sequence() % self.slots.len() as u64) as usize
    }

    /// Unconditionally overwrites the slot for `slot.task_id`. Used when a task
    /// is admitted, which is what evicts the previous occupant.
    pub fn put(&mut self, slot: RingSlot) {
        let index = self.index_of(slot.task_id);
        if let Some(previous) = &self.slots[index]
            && previous.task_id != slot.task_id
        {
            tracing::trace!(
                "Ring slot {} overwritten: {} -> {}",
                index,
                previous.task_id,
                slot.task_id
            );
        }
        self.slots[index] = Some(slot);
    }

    /// The slot for `task_id`, only if it still belongs to that task.
    pub fn slot(&self, task_id: TaskId) -> Option<&RingSlot> {
        self.slots[self.index_of(task_id)]
            .as_ref()
            .filter(|slot| slot.task_id == task_id)
    }

    pub fn get(&self, task_id: TaskId) -> RingRead {
        match self.slot(task_id) {
            None => RingRead::Stale,
            Some(slot) => Self::read(slot),
        }
    }

    /// Reads a terminal outcome and marks the slot disposed in one step, so a
    /// second consumer sees `Empty`. In-flight slots are left untouched.
    pub fn dispose_and_get(&mut self, task_id: TaskId) -> RingRead {
        let index = self.index_of(task_id);
        let Some(slot) = self.slots[index]
            .as_mut()
            .filter(|slot| slot.task_id == task_id)
        else {
            return RingRead::Stale;
        };

        let read = Self::read(slot);
        if let RingRead::Outcome(_) = read {
            slot.state = SlotState::Disposed;
            slot.value = None;
            slot.failure = None;
        }
        read
    }

    fn read(slot: &RingSlot) -> RingRead {
        match slot.state {
            SlotState::Disposed => RingRead::Empty,
            SlotState::Pending | SlotState::Running => RingRead::InFlight,
            _ => slot.outcome().map(RingRead::Outcome).unwrap_or(RingRead::Empty),
        }
    }

    /// Writes `slot` only if its slot still belongs to the same task.
    /// Returns `false` when a later task has taken the slot over.
    pub fn update(&mut self, slot: RingSlot) -> bool {
        let index = self.index_of(slot.task_id);
        match &self.slots[index] {
            Some(current) if current.task_id == slot.task_id => {
                self.slots[index] = Some(slot);
                true
            }
            _ => {
                tracing::trace!("Ring slot {} no longer holds {}", index, slot.task_id);
                false
            }
        }
    }

    /// Whether the slot for `task_id` is occupied by a later task.
    pub fn holds_newer_than(&self, task_id: TaskId) -> bool {
        self.slots[self.index_of(task_id)]
            .as_ref()
            .is_some_and(|slot| slot.task_id > task_id)
    }

    pub fn snapshot(&self) -> Vec<RingSlot> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Replaces the whole ring with replicated contents.
    pub fn restore(&mut self, slots: Vec<RingSlot>) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        let mut slots = slots;
        slots.sort_by_key(|slot| slot.task_id);
        for slot in slots {
            self.put(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::types::{TaskEnvelope, TaskKind};

    fn completed(partition: u32, sequence: u64, value: u8) -> RingSlot {
        RingSlot::terminal(
            TaskId::new(partition, sequence),
            &TaskOutcome::Completed(Some(vec![value])),
        )
    }

    fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            task_type: "noop".to_string(),
            kind: TaskKind::Runnable,
            payload: vec![],
        }
    }

    #[test]
    fn test_overwritten_slot_reports_stale() {
        let mut ring = ResultRing::new(2);

        for sequence in 0..3 {
            ring.put(completed(7, sequence, sequence as u8));
        }

        // Sequence 0 shared its slot with sequence 2.
        assert_eq!(ring.get(TaskId::new(7, 0)), RingRead::Stale);
        assert_eq!(
            ring.get(TaskId::new(7, 1)),
            RingRead::Outcome(TaskOutcome::Completed(Some(vec![1])))
        );
        assert_eq!(
            ring.get(TaskId::new(7, 2)),
            RingRead::Outcome(TaskOutcome::Completed(Some(vec![2])))
        );
    }

    #[test]
    fn test_dispose_then_get_is_empty_not_stale() {
        let mut ring = ResultRing::new(4);
        let id = TaskId::new(1, 3);
        ring.put(completed(1, 3, 9));

        let first = ring.dispose_and_get(id);
        assert_eq!(first, RingRead::Outcome(TaskOutcome::Completed(Some(vec![9]))));

        assert_eq!(ring.dispose_and_get(id), RingRead::Empty);
        assert_eq!(ring.get(id), RingRead::Empty);
    }

    #[test]
    fn test_dispose_leaves_in_flight_slot_alone() {
        let mut ring = ResultRing::new(4);
        let id = TaskId::new(0, 1);
        ring.put(RingSlot::in_flight(id, SlotState::Running, envelope()));

        assert_eq!(ring.dispose_and_get(id), RingRead::InFlight);
        assert_eq!(ring.slot(id).map(|s| s.state), Some(SlotState::Running));
    }

    #[test]
    fn test_never_written_slot_is_stale() {
        let ring = ResultRing::new(4);
        assert_eq!(ring.get(TaskId::new(0, 0)), RingRead::Stale);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_failed_and_cancelled_outcomes() {
        let mut ring = ResultRing::new(4);
        let failed = TaskId::new(0, 0);
        let cancelled = TaskId::new(0, 1);
        ring.put(RingSlot::terminal(failed, &TaskOutcome::Failed("boom".into())));
        ring.put(RingSlot::terminal(cancelled, &TaskOutcome::Cancelled));

        assert_eq!(
            ring.get(failed),
            RingRead::Outcome(TaskOutcome::Failed("boom".into()))
        );
        assert_eq!(ring.get(cancelled), RingRead::Outcome(TaskOutcome::Cancelled));
    }

    #[test]
    fn test_update_skips_slot_taken_by_later_task() {
        let mut ring = ResultRing::new(1);
        let first = TaskId::new(0, 0);
        let second = TaskId::new(0, 1);
        ring.put(RingSlot::in_flight(first, SlotState::Running, envelope()));
        ring.put(RingSlot::in_flight(second, SlotState::Pending, envelope()));

        assert!(ring.holds_newer_than(first));
        assert!(!ring.update(RingSlot::terminal(first, &TaskOutcome::Cancelled)));
        assert_eq!(ring.get(first), RingRead::Stale);

        assert!(ring.update(RingSlot::terminal(second, &TaskOutcome::Completed(None))));
        assert_eq!(ring.get(second), RingRead::Outcome(TaskOutcome::Completed(None)));
    }

    #[test]
    fn test_restore_replaces_contents() {
        let mut ring = ResultRing::new(3);
        ring.put(completed(0, 0, 1));

        ring.restore(vec![completed(0, 4, 4), completed(0, 5, 5)]);

        assert_eq!(ring.get(TaskId::new(0, 0)), RingRead::Stale);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.snapshot().len(), 2);
    }

    #[test]
    fn test_sequences_past_u32_range_keep_distinct_slots() {
        let mut ring = ResultRing::new(3);
        let boundary = u32::MAX as u64;

        for sequence in boundary - 1..boundary + 2 {
            ring.put(completed(5, sequence, (sequence + 1 - boundary) as u8));
        }

        assert_eq!(ring.len(), 3);
        assert_eq!(
            ring.get(TaskId::new(5, boundary + 1)),
            RingRead::Outcome(TaskOutcome::Completed(Some(vec![2])))
        );
        // A wrapped 32-bit counter would have reused sequence 0.
        assert_eq!(ring.get(TaskId::new(5, 0)), RingRead::Stale);
        assert!(TaskId::new(5, boundary + 1) > TaskId::new(5, boundary));
    }
}
