//! Subscriber registry and detach-on-drop handles.

use crate::machine::Machine;
use crate::types::Lsn;

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Callback invoked with `(state, delta, version)`. `delta` is `None` for
/// snapshot applications and initial-state deliveries.
pub(crate) type UpdateFn<M> =
    Box<dyn FnMut(&<M as Machine>::State, Option<&<M as Machine>::Delta>, Lsn) + Send>;

/// Attached subscribers, notified in attach order.
pub(crate) struct Subscribers<M: Machine> {
    entries: Vec<(SubscriberId, UpdateFn<M>)>,
    next_id: u64,
}

impl<M: Machine> Subscribers<M> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, cb: UpdateFn<M>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, cb));
        id
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn notify(&mut self, state: &M::State, delta: Option<&M::Delta>, version: Lsn) {
        for (_, cb) in self.entries.iter_mut() {
            cb(state, delta, version);
        }
    }
}

/// Handle to an attached subscriber. Dropping it detaches the subscriber;
/// if the engine is already stopped the detach is a no-op.
pub struct SubscriptionHandle {
    id: SubscriberId,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriberId, detach: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            id,
            detach: Some(detach),
        }
    }

    /// Handle for a subscription that never attached (engine stopped).
    pub(crate) fn detached() -> Self {
        Self {
            id: SubscriberId(0),
            detach: None,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Explicitly detach. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}
