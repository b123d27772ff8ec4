//! Core types for the replicated state machine engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Log sequence number: a totally ordered 64-bit identifier assigned by the
/// log service.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Sentinel for "no LSN".
    pub const INVALID: Lsn = Lsn(0);

    /// Smaller than every real LSN the log service hands out.
    pub const OLDEST: Lsn = Lsn(1);

    /// Read-until-forever marker for open-ended read streams.
    pub const MAX: Lsn = Lsn(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }

    pub fn next(self) -> Self {
        Lsn(self.0.saturating_add(1))
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Lsn(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a log maintained by the log service.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl fmt::Debug for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogId({})", self.0)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a node in the cluster membership.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIndex(pub u32);

impl fmt::Debug for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIndex({})", self.0)
    }
}

/// Identifier of a read stream opened on the log client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReadStreamId(pub u64);

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A record delivered by a read stream.
#[derive(Clone, Debug)]
pub struct DataRecord {
    pub lsn: Lsn,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// Kind of a gap in a log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapType {
    /// Records were removed by an explicit trim.
    Trim,
    /// Records were lost and cannot be recovered.
    DataLoss,
    /// Benign hole in the numbering space; nothing was lost.
    Bridge,
}

/// A gap `[lo, hi]` delivered by a read stream in place of records.
#[derive(Clone, Copy, Debug)]
pub struct GapRecord {
    pub kind: GapType,
    pub lo: Lsn,
    pub hi: Lsn,
}

/// Attributes accompanying a snapshot blob.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotAttributes {
    /// LSN of the latest delta the snapshot accounts for. For snapshots read
    /// from the snapshot log this is the record's own LSN.
    pub base_version: Lsn,
    pub timestamp: Timestamp,
}

impl SnapshotAttributes {
    pub fn new(base_version: Lsn, timestamp: Timestamp) -> Self {
        Self {
            base_version,
            timestamp,
        }
    }
}

/// How a delta write is confirmed to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Confirm as soon as the append is durable in the log.
    ConfirmAppendOnly,
    /// Confirm only once the delta has been read back and applied locally.
    ConfirmApplied,
}

/// Point-in-time view of the engine internals, for debugging and
/// introspection tooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RsmDebugInfo {
    pub delta_log_id: LogId,
    pub snapshot_log_id: Option<LogId>,
    pub version: Lsn,
    pub delta_read_ptr: Lsn,
    pub delta_sync: Lsn,
    pub snapshot_next_lsn: Lsn,
    pub snapshot_sync: Lsn,
    pub waiting_for_snapshot: Lsn,
    pub delta_appends_in_flight: usize,
    pub pending_confirmations: usize,
    pub snapshot_in_flight: bool,
    pub bytes_since_last_snapshot: u64,
    pub deltas_since_last_snapshot: u64,
    pub delta_stream_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering_and_sentinels() {
        assert!(Lsn::INVALID < Lsn::OLDEST);
        assert!(Lsn::OLDEST < Lsn(2));
        assert!(Lsn(2) < Lsn::MAX);
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::OLDEST.is_valid());
    }

    #[test]
    fn test_lsn_navigation() {
        assert_eq!(Lsn(5).next(), Lsn(6));
        assert_eq!(Lsn::MAX.next(), Lsn::MAX);
        assert_eq!(Lsn(5).prev(), Some(Lsn(4)));
        assert_eq!(Lsn::INVALID.prev(), None);
    }

    #[test]
    fn test_timestamp_retention_cutoff() {
        let now = Timestamp(10_000);
        let cutoff = now - Duration::from_secs(3);
        assert_eq!(cutoff, Timestamp(7_000));
    }
}
