//! Interfaces of the external collaborators the engine drives.
//!
//! The engine consumes these; it never implements them. In-memory doubles
//! for all three live in [`crate::testing`].

use crate::error::Status;
use crate::types::{
    DataRecord, GapRecord, LogId, Lsn, NodeIndex, ReadStreamId, SnapshotAttributes, Timestamp,
};
use std::time::Duration;

pub type TailCallback = Box<dyn FnOnce(Status, Lsn) + Send>;
pub type AppendCallback = Box<dyn FnOnce(Status, Lsn) + Send>;
pub type TrimCallback = Box<dyn FnOnce(Status) + Send>;
pub type FindTimeCallback = Box<dyn FnOnce(Status, Lsn) + Send>;
pub type SnapshotCallback = Box<dyn FnOnce(Status, Vec<u8>, SnapshotAttributes) + Send>;
pub type SnapshotWriteCallback = Box<dyn FnOnce(Status, Lsn) + Send>;
pub type DurableVersionCallback = Box<dyn FnOnce(Status, Lsn) + Send>;

/// Receiver of read-stream deliveries.
///
/// Returning `false` from [`on_record`](ReadStreamHandler::on_record) or
/// [`on_gap`](ReadStreamHandler::on_gap) pauses the stream; the paused
/// delivery is retried after [`LogClient::resume_read_stream`]. Deliveries
/// within one stream carry strictly increasing LSNs.
pub trait ReadStreamHandler: Send {
    fn on_record(&mut self, record: DataRecord) -> bool;
    fn on_gap(&mut self, gap: GapRecord) -> bool;
    fn on_health_change(&mut self, _healthy: bool) {}
}

/// Client of the append-only log service.
///
/// Implementations must not invoke the handler from inside
/// [`open_read_stream`](LogClient::open_read_stream) or
/// [`resume_read_stream`](LogClient::resume_read_stream): the handler posts
/// onto the engine's owner worker and waits for its decision, and the engine
/// calls both methods from that worker.
pub trait LogClient: Send + Sync + 'static {
    /// Open a read stream over `[start, until]`. Deliveries go through
    /// `handler` until the stream is closed.
    fn open_read_stream(
        &self,
        log: LogId,
        start: Lsn,
        until: Lsn,
        handler: Box<dyn ReadStreamHandler>,
    ) -> ReadStreamId;

    /// Resume a stream paused by a `false` handler return.
    fn resume_read_stream(&self, id: ReadStreamId);

    fn close_read_stream(&self, id: ReadStreamId);

    /// Next LSN the stream would deliver, if the client tracks it.
    fn read_stream_next_lsn(&self, _id: ReadStreamId) -> Option<Lsn> {
        None
    }

    /// Resolve the LSN of the last released record of `log`
    /// ([`Lsn::OLDEST`] for an empty log).
    fn query_tail_lsn(&self, log: LogId, cb: TailCallback);

    /// Append `payload`, bypassing any write-token check. The callback
    /// receives the assigned LSN on success.
    fn append(&self, log: LogId, payload: Vec<u8>, timeout: Duration, cb: AppendCallback);

    /// Trim `log` up to and including `up_to`.
    fn trim(&self, log: LogId, up_to: Lsn, timeout: Duration, cb: TrimCallback);

    /// Resolve the first LSN at or after `timestamp` in `log`.
    fn find_time(&self, log: LogId, timestamp: Timestamp, cb: FindTimeCallback);
}

/// Pluggable store for snapshots, used instead of the snapshot log when
/// configured.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Fetch the newest snapshot with `base_version >= min_version`.
    /// Statuses: `Ok` (blob valid), `UpToDate`, `Empty`, `Stale`, `NotFound`,
    /// `Failed`, `TimedOut`, `InProgress`, `TooBig`.
    fn get_snapshot(&self, min_version: Lsn, cb: SnapshotCallback);

    /// Publish a snapshot of the state at `version`.
    fn write_snapshot(&self, version: Lsn, blob: Vec<u8>, cb: SnapshotWriteCallback);

    /// Version up to which snapshots are durable; safe delta-log trim point.
    fn get_durable_version(&self, cb: DurableVersionCallback);

    /// Whether this node may write snapshots through the store directly.
    fn is_writable(&self) -> bool;

    /// Whether the store is backed by the snapshot log (affects trimming).
    fn is_log_based(&self) -> bool {
        false
    }
}

/// Cluster membership view, used only to elect the periodic snapshotter.
pub trait ClusterState: Send + Sync + 'static {
    /// Index of the first alive node, per the failure detector.
    fn first_alive_node(&self) -> Option<NodeIndex>;

    fn my_node_index(&self) -> NodeIndex;
}
