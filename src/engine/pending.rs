//! In-flight deltas awaiting apply confirmation.

use crate::error::Status;
use crate::types::Lsn;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Completion callback of a delta write: `(status, version, failure_reason)`.
pub type WriteCallback = Box<dyn FnOnce(Status, Lsn, &str) + Send>;

/// One delta written with CONFIRM_APPLIED, not yet applied locally.
pub(crate) struct PendingDelta {
    /// Admission order; strictly increasing.
    seq: u64,
    pub uuid: Uuid,
    /// LSN the append was assigned; `Lsn::INVALID` until the append
    /// completes.
    pub lsn: Lsn,
    pub timeout: Duration,
    pub cb: WriteCallback,
}

/// Ordered set of pending confirmations, additionally indexed by UUID.
///
/// Entries keep admission order (which is also append-issue order) in the
/// deque and are removed from both views atomically.
pub(crate) struct PendingConfirmations {
    entries: VecDeque<PendingDelta>,
    by_uuid: HashMap<Uuid, u64>,
    next_seq: u64,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            by_uuid: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.by_uuid.contains_key(uuid)
    }

    pub fn push(&mut self, uuid: Uuid, timeout: Duration, cb: WriteCallback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_uuid.insert(uuid, seq);
        self.entries.push_back(PendingDelta {
            seq,
            uuid,
            lsn: Lsn::INVALID,
            timeout,
            cb,
        });
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut PendingDelta> {
        let seq = *self.by_uuid.get(uuid)?;
        let at = self
            .entries
            .binary_search_by_key(&seq, |e| e.seq)
            .ok()?;
        self.entries.get_mut(at)
    }

    /// Remove the entry for `uuid` from both views.
    pub fn remove(&mut self, uuid: &Uuid) -> Option<PendingDelta> {
        let seq = self.by_uuid.remove(uuid)?;
        let at = self
            .entries
            .binary_search_by_key(&seq, |e| e.seq)
            .ok()?;
        self.entries.remove(at)
    }

    pub fn front(&self) -> Option<&PendingDelta> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingDelta> {
        let entry = self.entries.pop_front()?;
        self.by_uuid.remove(&entry.uuid);
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> WriteCallback {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn test_push_preserves_order() {
        let mut pending = PendingConfirmations::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        pending.push(a, Duration::from_secs(1), noop());
        pending.push(b, Duration::from_secs(1), noop());

        assert_eq!(pending.len(), 2);
        assert_eq!(pending.front().unwrap().uuid, a);
    }

    #[test]
    fn test_remove_middle_keeps_both_views_consistent() {
        let mut pending = PendingConfirmations::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            pending.push(*id, Duration::from_secs(1), noop());
        }

        let removed = pending.remove(&ids[1]).unwrap();
        assert_eq!(removed.uuid, ids[1]);
        assert!(!pending.contains(&ids[1]));
        assert_eq!(pending.len(), 2);

        // Remaining entries still found through the UUID index.
        assert!(pending.get_mut(&ids[0]).is_some());
        assert!(pending.get_mut(&ids[2]).is_some());
        assert_eq!(pending.pop_front().unwrap().uuid, ids[0]);
        assert_eq!(pending.pop_front().unwrap().uuid, ids[2]);
        assert!(pending.pop_front().is_none());
    }

    #[test]
    fn test_callback_moves_with_entry() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingConfirmations::new();
        let uuid = Uuid::new_v4();
        let fired2 = Arc::clone(&fired);
        pending.push(
            uuid,
            Duration::from_secs(1),
            Box::new(move |st, lsn, _| {
                assert_eq!(st, Status::Ok);
                assert_eq!(lsn, Lsn(7));
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        pending.get_mut(&uuid).unwrap().lsn = Lsn(7);
        let entry = pending.remove(&uuid).unwrap();
        (entry.cb)(Status::Ok, entry.lsn, "");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
