//! The capability set a replicated state machine supplies to the engine.

use crate::error::{Result, Status};
use crate::types::{Lsn, Timestamp};

/// Failure returned by [`Machine::apply_delta`].
///
/// Carries a status for the confirmation callback and a human-readable
/// reason forwarded to the writer of the delta.
#[derive(Debug, Clone)]
pub struct ApplyError {
    pub status: Status,
    pub reason: String,
}

impl ApplyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            reason: reason.into(),
        }
    }

    pub fn with_status(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// User-supplied behavior of a replicated state machine.
///
/// The engine owns a `State` replica and mutates it exclusively through
/// these operations; it never inspects the contents of `State` or `Delta`,
/// and neither type appears on the wire except through the serialize and
/// deserialize hooks below.
pub trait Machine: Send + 'static {
    type State: Send + 'static;
    type Delta: Send + 'static;

    /// Fresh state used when no snapshot exists, together with the version
    /// it represents (normally [`Lsn::OLDEST`]).
    fn make_default(&self) -> (Self::State, Lsn);

    /// Apply one delta in LSN order. On error the engine keeps the state
    /// version unchanged and reports the failure to the delta's writer, if
    /// it is waiting for confirmation.
    fn apply_delta(
        &self,
        state: &mut Self::State,
        delta: &Self::Delta,
        lsn: Lsn,
        timestamp: Timestamp,
    ) -> std::result::Result<(), ApplyError>;

    /// Serialize the full state for a snapshot payload.
    fn serialize_state(&self, state: &Self::State) -> Vec<u8>;

    /// Rebuild state from a snapshot payload.
    fn deserialize_state(
        &self,
        bytes: &[u8],
        base_version: Lsn,
        timestamp: Timestamp,
    ) -> Result<Self::State>;

    /// Decode one delta's user bytes.
    fn deserialize_delta(&self, bytes: &[u8]) -> Result<Self::Delta>;
}
