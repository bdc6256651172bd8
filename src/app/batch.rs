use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::app::models::{BatchId, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSnapshot {
    pub kind: OperationKind,
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
}

impl BatchSnapshot {
    pub fn failed(&self) -> usize {
        self.completed - self.succeeded
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Counted; the batch still has outstanding units.
    Progress(BatchSnapshot),
    /// Counted, and it was the last one. Returned exactly once per batch. The batch stays
    /// open until [`BatchReducer::notice_sent`] has been called for every result.
    Completed(BatchSnapshot),
    /// This index already reported; nothing changed.
    Duplicate(BatchSnapshot),
    /// No open batch under that id (summarised already, or never started).
    Unknown,
}

#[derive(Debug)]
struct BatchState {
    kind: OperationKind,
    total: usize,
    succeeded: usize,
    reported: BTreeSet<usize>,
    notified: usize,
}

impl BatchState {
    fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            kind: self.kind,
            total: self.total,
            completed: self.reported.len(),
            succeeded: self.succeeded,
        }
    }
}

/// Counters for every open batch. All mutation happens under one mutex so the
/// completion check and the increment are a single step.
#[derive(Debug, Default)]
pub struct BatchReducer {
    batches: Mutex<HashMap<BatchId, BatchState>>,
}

impl BatchReducer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BatchId, BatchState>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, kind: OperationKind, total: usize) -> BatchId {
        let id = BatchId::new();
        self.lock().insert(
            id,
            BatchState {
                kind,
                total,
                succeeded: 0,
                reported: BTreeSet::new(),
                notified: 0,
            },
        );
        id
    }

    pub fn record_result(&self, batch_id: BatchId, index: usize, success: bool) -> Recorded {
        let mut batches = self.lock();
        let Some(state) = batches.get_mut(&batch_id) else {
            return Recorded::Unknown;
        };
        if index == 0 || index > state.total || !state.reported.insert(index) {
            return Recorded::Duplicate(state.snapshot());
        }
        if success {
            state.succeeded += 1;
        }
        let snapshot = state.snapshot();
        if snapshot.is_complete() {
            Recorded::Completed(snapshot)
        } else {
            Recorded::Progress(snapshot)
        }
    }

    pub fn snapshot(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        self.lock().get(&batch_id).map(BatchState::snapshot)
    }

    pub fn open_batches(&self) -> usize {
        self.lock().len()
    }

    /// Marks one counted result as notified. Returns the final snapshot, and closes the
    /// batch, for the call that accounts for the last notice.
    pub fn notice_sent(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        let mut batches = self.lock();
        let state = batches.get_mut(&batch_id)?;
        state.notified += 1;
        if state.notified < state.total {
            return None;
        }
        let snapshot = state.snapshot();
        batches.remove(&batch_id);
        Some(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn race_to_completion(total: usize) -> (usize, Vec<BatchSnapshot>) {
        let reducer = Arc::new(BatchReducer::new());
        let batch = reducer.begin(OperationKind::InstallApk, total);
        let barrier = Arc::new(Barrier::new(total));
        let handles: Vec<_> = (1..=total)
            .map(|index| {
                let reducer = Arc::clone(&reducer);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let recorded = reducer.record_result(batch, index, index % 3 != 0);
                    let closed = reducer.notice_sent(batch);
                    (recorded, closed)
                })
            })
            .collect();
        let (results, closed): (Vec<Recorded>, Vec<Option<BatchSnapshot>>) = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .unzip();
        let closed: Vec<BatchSnapshot> = closed.into_iter().flatten().collect();
        assert_eq!(closed.len(), 1, "batch of {total} closed once");
        assert!(closed[0].is_complete());
        let completions: Vec<BatchSnapshot> = results
            .iter()
            .filter_map(|recorded| match recorded {
                Recorded::Completed(snapshot) => Some(*snapshot),
                _ => None,
            })
            .collect();
        let progress = results
            .iter()
            .filter(|recorded| matches!(recorded, Recorded::Progress(_)))
            .count();
        assert_eq!(reducer.open_batches(), 0);
        (progress, completions)
    }

    #[test]
    fn concurrent_completion_fires_once() {
        for total in [1, 2, 50] {
            let (progress, completions) = race_to_completion(total);
            assert_eq!(completions.len(), 1, "batch of {total}");
            assert_eq!(progress, total - 1);
            let done = completions[0];
            assert_eq!(done.completed, total);
            assert_eq!(done.succeeded, (1..=total).filter(|i| i % 3 != 0).count());
            assert_eq!(done.failed(), total - done.succeeded);
        }
    }

    #[test]
    fn counters_stay_ordered() {
        let reducer = BatchReducer::new();
        let batch = reducer.begin(OperationKind::Screenshot, 3);
        let mut last_completed = 0;
        for (index, success) in [(2, false), (1, true), (3, true)] {
            let snapshot = match reducer.record_result(batch, index, success) {
                Recorded::Progress(snapshot) | Recorded::Completed(snapshot) => snapshot,
                other => panic!("unexpected {other:?}"),
            };
            assert!(snapshot.succeeded <= snapshot.completed);
            assert!(snapshot.completed <= snapshot.total);
            assert!(snapshot.completed > last_completed);
            last_completed = snapshot.completed;
        }
    }

    #[test]
    fn duplicate_index_is_ignored() {
        let reducer = BatchReducer::new();
        let batch = reducer.begin(OperationKind::InstallApk, 2);
        assert!(matches!(reducer.record_result(batch, 1, true), Recorded::Progress(_)));
        match reducer.record_result(batch, 1, false) {
            Recorded::Duplicate(snapshot) => {
                assert_eq!(snapshot.completed, 1);
                assert_eq!(snapshot.succeeded, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(reducer.record_result(batch, 3, true), Recorded::Duplicate(_)));
        assert!(matches!(reducer.record_result(batch, 2, true), Recorded::Completed(_)));
        assert!(matches!(reducer.record_result(batch, 2, true), Recorded::Duplicate(_)));
        assert_eq!(reducer.notice_sent(batch), None);
        assert!(reducer.notice_sent(batch).is_some());
        assert_eq!(reducer.record_result(batch, 2, true), Recorded::Unknown);
    }

    #[test]
    fn batch_stays_open_until_every_notice_is_out() {
        let reducer = BatchReducer::new();
        let batch = reducer.begin(OperationKind::ClearLogcat, 2);
        assert!(matches!(reducer.record_result(batch, 1, true), Recorded::Progress(_)));
        assert!(matches!(reducer.record_result(batch, 2, true), Recorded::Completed(_)));
        // Index 2 notified first; index 1 is still being emitted.
        assert_eq!(reducer.notice_sent(batch), None);
        assert_eq!(reducer.open_batches(), 1);
        let done = reducer.notice_sent(batch).expect("closed");
        assert_eq!(done.completed, 2);
        assert_eq!(reducer.open_batches(), 0);
    }

    #[test]
    fn unknown_batch_reports_unknown() {
        let reducer = BatchReducer::new();
        assert_eq!(reducer.record_result(BatchId::new(), 1, true), Recorded::Unknown);
        assert_eq!(reducer.notice_sent(BatchId::new()), None);
        assert_eq!(reducer.snapshot(BatchId::new()), None);
    }
}
