// sync-core/src/step/pending.rs

//! In-flight requests of the current step.

use std::collections::BTreeSet;

/// Outstanding work of one worker within one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub worker_index: usize,
    pub step_index: u64,
    outstanding: BTreeSet<u32>,
}

impl PendingRequest {
    /// Units still waiting for a STEP_COMPLETE, ascending.
    pub fn outstanding_units(&self) -> impl Iterator<Item = u32> + '_ {
        self.outstanding.iter().copied()
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// Ordered queue of `(worker_index, step_index)` entries awaiting results.
///
/// An entry leaves the queue only when every one of its units has completed
/// or the worker has exited.
#[derive(Debug, Default)]
pub struct PendingRequestQueue {
    entries: Vec<PendingRequest>,
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatched request. Entries stay sorted by worker index.
    pub fn push(&mut self, worker_index: usize, step_index: u64, units: &[u32]) {
        if units.is_empty() {
            return;
        }
        match self.position(worker_index, step_index) {
            Some(pos) => self.entries[pos].outstanding.extend(units.iter().copied()),
            None => {
                let at = self
                    .entries
                    .partition_point(|e| (e.step_index, e.worker_index) < (step_index, worker_index));
                self.entries.insert(
                    at,
                    PendingRequest {
                        worker_index,
                        step_index,
                        outstanding: units.iter().copied().collect(),
                    },
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PendingRequest] {
        &self.entries
    }

    pub fn contains(&self, worker_index: usize, step_index: u64) -> bool {
        self.position(worker_index, step_index).is_some()
    }

    pub fn is_outstanding(&self, worker_index: usize, step_index: u64, unit: u32) -> bool {
        self.position(worker_index, step_index)
            .is_some_and(|pos| self.entries[pos].outstanding.contains(&unit))
    }

    /// Workers with outstanding entries, ascending.
    pub fn workers(&self) -> Vec<usize> {
        let mut workers: Vec<usize> = self.entries.iter().map(|e| e.worker_index).collect();
        workers.dedup();
        workers
    }

    /// Mark one unit as completed.
    ///
    /// Returns `None` if the unit was not outstanding, `Some(true)` if this
    /// completed the worker's entry (which is then removed), `Some(false)`
    /// otherwise.
    pub fn complete_unit(&mut self, worker_index: usize, step_index: u64, unit: u32) -> Option<bool> {
        let pos = self.position(worker_index, step_index)?;
        if !self.entries[pos].outstanding.remove(&unit) {
            return None;
        }
        if self.entries[pos].outstanding.is_empty() {
            self.entries.remove(pos);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Remove a worker's entry regardless of outstanding units (EXIT).
    pub fn resolve(&mut self, worker_index: usize, step_index: u64) -> Option<PendingRequest> {
        self.position(worker_index, step_index)
            .map(|pos| self.entries.remove(pos))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn position(&self, worker_index: usize, step_index: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.worker_index == worker_index && e.step_index == step_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_removed_only_when_all_units_complete() {
        let mut queue = PendingRequestQueue::new();
        queue.push(0, 4, &[0, 1]);
        queue.push(1, 4, &[2, 3]);

        assert_eq!(queue.complete_unit(0, 4, 0), Some(false));
        assert!(queue.contains(0, 4));
        assert_eq!(queue.complete_unit(0, 4, 1), Some(true));
        assert!(!queue.contains(0, 4));
        assert!(!queue.is_empty());
        assert_eq!(queue.workers(), vec![1]);
    }

    #[test]
    fn test_unknown_or_repeated_unit() {
        let mut queue = PendingRequestQueue::new();
        queue.push(0, 1, &[0, 1]);
        assert_eq!(queue.complete_unit(0, 1, 9), None);
        assert_eq!(queue.complete_unit(0, 2, 0), None);
        assert_eq!(queue.complete_unit(0, 1, 0), Some(false));
        assert_eq!(queue.complete_unit(0, 1, 0), None);
    }

    #[test]
    fn test_entries_sorted_by_worker() {
        let mut queue = PendingRequestQueue::new();
        queue.push(2, 0, &[4]);
        queue.push(0, 0, &[0]);
        queue.push(1, 0, &[2]);
        let order: Vec<usize> = queue.entries().iter().map(|e| e.worker_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_resolve_on_exit() {
        let mut queue = PendingRequestQueue::new();
        queue.push(1, 0, &[2, 3]);
        let entry = queue.resolve(1, 0).unwrap();
        assert_eq!(entry.outstanding_units().collect::<Vec<_>>(), vec![2, 3]);
        assert!(queue.is_empty());
        assert!(queue.resolve(1, 0).is_none());
    }

    #[test]
    fn test_empty_push_is_ignored() {
        let mut queue = PendingRequestQueue::new();
        queue.push(0, 0, &[]);
        assert!(queue.is_empty());
    }
}
