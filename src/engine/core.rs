//! The synchronization and consistency engine.
//!
//! All state here is owned by the engine's worker thread. Read-stream
//! deliveries rendezvous with the worker for their backpressure decision;
//! every other external callback is posted through a ticket and simply dies
//! if the engine stopped in the meantime.

use crate::client::{ClusterState, LogClient, ReadStreamHandler, SnapshotStore};
use crate::engine::pending::{PendingConfirmations, WriteCallback};
use crate::engine::subscriptions::{SubscriberId, Subscribers, UpdateFn};
use crate::engine::{AdvertisedVersions, DoneCallback, RsmConfig, RsmStats, StopSignal};
use crate::error::Status;
use crate::machine::Machine;
use crate::types::{
    DataRecord, GapRecord, GapType, Lsn, ReadStreamId, RsmDebugInfo, SnapshotAttributes, WriteMode,
};
use crate::wire::{self, DeltaHeader, SnapshotHeader};
use crate::worker::{Backoff, Ticket, TimerKey, TimerQueue, WorkerState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Timeout for trim and find-time requests.
const TRIM_TIMEOUT: Duration = Duration::from_secs(20);

/// Lifecycle of the engine: load the newest snapshot, replay deltas up to
/// the tail observed at startup, then tail forever. Transitions are
/// monotonic except for one allowed step back to `SyncDeltas` when the
/// delta read stream recovers from an unhealthy window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncState {
    SyncSnapshot,
    SyncDeltas,
    Tailing,
}

#[derive(Clone, Copy)]
enum StreamTarget {
    Snapshot,
    Delta,
}

/// Read-stream handler that forwards deliveries onto the owner worker and
/// waits for the engine's accept/reject decision.
struct StreamRelay<M: Machine> {
    ticket: Ticket<EngineCore<M>>,
    target: StreamTarget,
}

impl<M: Machine> ReadStreamHandler for StreamRelay<M> {
    fn on_record(&mut self, record: DataRecord) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let target = self.target;
        let posted = self.ticket.post(move |core| {
            let accepted = match target {
                StreamTarget::Snapshot => core.on_snapshot_record(record),
                StreamTarget::Delta => core.on_delta_record(record),
            };
            let _ = tx.send(accepted);
        });
        if !posted {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    fn on_gap(&mut self, gap: GapRecord) -> bool {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let target = self.target;
        let posted = self.ticket.post(move |core| {
            let accepted = match target {
                StreamTarget::Snapshot => core.on_snapshot_gap(gap),
                StreamTarget::Delta => core.on_delta_gap(gap),
            };
            let _ = tx.send(accepted);
        });
        if !posted {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    fn on_health_change(&mut self, healthy: bool) {
        if matches!(self.target, StreamTarget::Delta) {
            self.ticket
                .post(move |core| core.on_delta_stream_health(healthy));
        }
    }
}

pub(crate) struct EngineCore<M: Machine> {
    cfg: RsmConfig,
    machine: M,
    log: Arc<dyn LogClient>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
    cluster: Arc<dyn ClusterState>,
    ticket: Ticket<EngineCore<M>>,

    /// The replicated state. Mutated only through the machine's operations.
    data: M::State,
    /// LSN of the latest applied delta or snapshot.
    version: Lsn,
    sync_state: SyncState,

    /// Metadata of the newest snapshot successfully ingested.
    last_snapshot_version: Lsn,
    last_snapshot_last_read_ptr: Lsn,
    last_snapshot_byte_offset: u64,
    last_snapshot_offset: u64,

    /// Running totals over the delta log, as of `version`.
    delta_log_byte_offset: u64,
    delta_log_offset: u64,

    /// Highest delta LSN or gap high bound observed.
    delta_read_ptr: Lsn,
    /// Targets for initial replay completion.
    snapshot_sync: Lsn,
    delta_sync: Lsn,
    /// When valid, delta ingestion is stalled until a snapshot with
    /// `base_version` or `delta_log_read_ptr` at or past this LSN arrives.
    waiting_for_snapshot: Lsn,
    /// Target recorded when a fast-forward was deferred by the grace period.
    allow_fast_forward_up_to: Lsn,

    snapshot_rsid: Option<ReadStreamId>,
    delta_rsid: Option<ReadStreamId>,
    delta_stream_healthy: bool,

    /// Snapshot record buffered during SYNC_SNAPSHOT until we know it is the
    /// last one below `snapshot_sync`.
    last_snapshot_record: Option<DataRecord>,

    pending: PendingConfirmations,
    delta_appends_in_flight: usize,

    snapshot_in_flight: bool,
    snapshot_fetch_in_flight: bool,
    last_written_version: Lsn,

    subscribers: Subscribers<M>,
    state_delivery_blocked: bool,

    stopped: bool,
    bumped_stalled_stat: bool,

    timers: TimerQueue,
    snapshot_fetch_backoff: Backoff,

    stats: Arc<RsmStats>,
    versions: Arc<AdvertisedVersions>,
    stop_signal: Arc<StopSignal>,
}

fn finish(cb: Option<DoneCallback>, st: Status) {
    if let Some(cb) = cb {
        cb(st);
    }
}

impl<M: Machine> EngineCore<M> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: RsmConfig,
        machine: M,
        log: Arc<dyn LogClient>,
        snapshot_store: Option<Arc<dyn SnapshotStore>>,
        cluster: Arc<dyn ClusterState>,
        ticket: Ticket<EngineCore<M>>,
        stats: Arc<RsmStats>,
        versions: Arc<AdvertisedVersions>,
        stop_signal: Arc<StopSignal>,
    ) -> Self {
        let (data, version) = machine.make_default();
        let snapshot_fetch_backoff = Backoff::new(
            cfg.snapshot_fetch_initial_delay,
            cfg.snapshot_fetch_max_delay,
        );
        Self {
            cfg,
            machine,
            log,
            snapshot_store,
            cluster,
            ticket,
            data,
            version,
            sync_state: SyncState::SyncSnapshot,
            last_snapshot_version: Lsn::INVALID,
            last_snapshot_last_read_ptr: Lsn::INVALID,
            last_snapshot_byte_offset: 0,
            last_snapshot_offset: 0,
            delta_log_byte_offset: 0,
            delta_log_offset: 0,
            delta_read_ptr: Lsn::INVALID,
            snapshot_sync: Lsn::INVALID,
            delta_sync: Lsn::INVALID,
            waiting_for_snapshot: Lsn::INVALID,
            allow_fast_forward_up_to: Lsn::INVALID,
            snapshot_rsid: None,
            delta_rsid: None,
            delta_stream_healthy: true,
            last_snapshot_record: None,
            pending: PendingConfirmations::new(),
            delta_appends_in_flight: 0,
            snapshot_in_flight: false,
            snapshot_fetch_in_flight: false,
            last_written_version: Lsn::INVALID,
            subscribers: Subscribers::new(),
            state_delivery_blocked: false,
            stopped: false,
            bumped_stalled_stat: false,
            timers: TimerQueue::new(),
            snapshot_fetch_backoff,
            stats,
            versions,
            stop_signal,
        }
    }

    fn has_snapshot_source(&self) -> bool {
        self.cfg.snapshot_log_id.is_some() || self.snapshot_store.is_some()
    }

    fn advertise_in_memory(&self) {
        self.versions.set_in_memory(self.version);
    }

    fn advertise_durable(&self, version: Lsn) {
        self.versions.set_durable(version);
    }

    // --- Lifecycle ---

    pub(crate) fn start(&mut self) {
        info!(
            delta_log = %self.cfg.delta_log_id,
            "starting replicated state machine"
        );
        self.advertise_in_memory();
        if self.has_snapshot_source() {
            self.start_fetching_snapshot();
        } else {
            self.on_base_snapshot_retrieved();
        }
    }

    fn start_fetching_snapshot(&mut self) {
        if self.snapshot_store.is_some() {
            info!("loading base snapshot from the snapshot store");
            self.fetch_snapshot();
        } else {
            info!("loading base snapshot from the snapshot log");
            self.get_snapshot_log_tail();
        }
    }

    pub(crate) fn schedule_stop(&mut self) {
        if !self.timers.is_active(&TimerKey::Stop) {
            self.timers.schedule(TimerKey::Stop, Duration::ZERO);
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        info!("stopping replicated state machine");
        if let Some(rsid) = self.snapshot_rsid.take() {
            self.log.close_read_stream(rsid);
        }
        if let Some(rsid) = self.delta_rsid.take() {
            self.log.close_read_stream(rsid);
        }
        self.stopped = true;
        self.timers.clear();
        // Unblocks anyone parked in wait().
        self.stop_signal.signal();
    }

    // --- Snapshot fetch (snapshot store path) ---

    /// Fetch now unless a fetch is already outstanding or scheduled.
    fn request_snapshot_fetch(&mut self) {
        if self.snapshot_store.is_none()
            || self.snapshot_fetch_in_flight
            || self.timers.is_active(&TimerKey::SnapshotFetch)
        {
            return;
        }
        self.fetch_snapshot();
    }

    fn schedule_snapshot_fetch(&mut self) {
        if self.snapshot_store.is_none() || self.timers.is_active(&TimerKey::SnapshotFetch) {
            return;
        }
        let delay = self.snapshot_fetch_backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "scheduling snapshot fetch retry");
        self.timers.schedule(TimerKey::SnapshotFetch, delay);
    }

    fn fetch_snapshot(&mut self) {
        let store = match &self.snapshot_store {
            Some(store) => Arc::clone(store),
            None => return,
        };
        if self.snapshot_fetch_in_flight {
            return;
        }
        self.snapshot_fetch_in_flight = true;

        let min_version = self.waiting_for_snapshot.max(self.version);
        info!(
            min_version = %min_version,
            waiting_for = %self.waiting_for_snapshot,
            version = %self.version,
            "fetching snapshot"
        );
        let ticket = self.ticket.clone();
        store.get_snapshot(
            min_version,
            Box::new(move |st, blob, attrs| {
                ticket.post(move |core| {
                    core.snapshot_fetch_in_flight = false;
                    core.on_snapshot_fetched(st, blob, attrs);
                });
            }),
        );
    }

    fn on_snapshot_fetched(&mut self, st: Status, blob: Vec<u8>, attrs: SnapshotAttributes) {
        info!(
            status = %st,
            blob_len = blob.len(),
            base_version = %attrs.base_version,
            "snapshot fetch completed"
        );
        match st {
            Status::Ok => {
                self.snapshot_sync = attrs.base_version;
                if self.process_snapshot(&blob, attrs) {
                    self.snapshot_fetch_backoff.reset();
                    if self.waiting_for_snapshot.is_valid() {
                        self.schedule_snapshot_fetch();
                    }
                } else {
                    self.schedule_snapshot_fetch();
                }
            }
            Status::UpToDate | Status::Empty => {
                if self.sync_state == SyncState::SyncSnapshot {
                    self.on_base_snapshot_retrieved();
                } else if self.waiting_for_snapshot.is_valid() {
                    self.schedule_snapshot_fetch();
                }
            }
            _ => {
                // STALE, NOTFOUND, FAILED, TIMEDOUT, INPROGRESS, TOOBIG or
                // anything unexpected: let the backoff timer retry.
                self.schedule_snapshot_fetch();
            }
        }
    }

    // --- Snapshot ingestion (snapshot log path) ---

    fn get_snapshot_log_tail(&mut self) {
        debug_assert_eq!(self.sync_state, SyncState::SyncSnapshot);
        let snapshot_log = match self.cfg.snapshot_log_id {
            Some(log) => log,
            None => return,
        };
        info!(log = %snapshot_log, "resolving snapshot log tail");
        let ticket = self.ticket.clone();
        self.log.query_tail_lsn(
            snapshot_log,
            Box::new(move |st, tail| {
                ticket.post(move |core| core.on_snapshot_log_tail(st, tail));
            }),
        );
    }

    fn on_snapshot_log_tail(&mut self, st: Status, tail: Lsn) {
        // Tail queries carry no timeout, so completion must succeed.
        assert_eq!(st, Status::Ok, "snapshot log tail query failed");
        debug_assert!(tail.is_valid());
        info!(tail = %tail, "snapshot log tail resolved");

        self.snapshot_sync = tail;
        let until = if self.cfg.stop_at_tail { tail } else { Lsn::MAX };
        let snapshot_log = match self.cfg.snapshot_log_id {
            Some(log) => log,
            None => return,
        };
        let handler = Box::new(StreamRelay {
            ticket: self.ticket.clone(),
            target: StreamTarget::Snapshot,
        });
        self.snapshot_rsid =
            Some(self.log.open_read_stream(snapshot_log, Lsn::OLDEST, until, handler));
    }

    pub(crate) fn on_snapshot_record(&mut self, record: DataRecord) -> bool {
        debug!(lsn = %record.lsn, "snapshot record received");
        if self.sync_state == SyncState::SyncSnapshot && record.lsn < self.snapshot_sync {
            // Not the last snapshot below the sync point; defer
            // deserialization until the gap past it tells us it was.
            self.last_snapshot_record = Some(record);
            return true;
        }

        self.last_snapshot_record = None;
        let attrs = SnapshotAttributes::new(record.lsn, record.timestamp);
        self.process_snapshot(&record.payload, attrs)
    }

    pub(crate) fn on_snapshot_gap(&mut self, gap: GapRecord) -> bool {
        // A gap in the snapshot log does not stall the engine by itself: if
        // deltas covered by a lost snapshot are still in the delta log we
        // simply replay them.
        info!(
            kind = ?gap.kind,
            lo = %gap.lo,
            hi = %gap.hi,
            snapshot_sync = %self.snapshot_sync,
            "snapshot log gap"
        );
        if self.sync_state == SyncState::SyncSnapshot && gap.hi >= self.snapshot_sync {
            if let Some(record) = self.last_snapshot_record.take() {
                // The buffered record turned out to be the last snapshot.
                let attrs = SnapshotAttributes::new(record.lsn, record.timestamp);
                if !self.process_snapshot(&record.payload, attrs) {
                    self.last_snapshot_record = Some(record);
                    return false;
                }
            }
            self.on_base_snapshot_retrieved();
        }
        true
    }

    // --- Snapshot application ---

    fn decode_snapshot_blob(
        &self,
        payload: &[u8],
        attrs: &SnapshotAttributes,
    ) -> crate::error::Result<(M::State, SnapshotHeader)> {
        let (header, state_bytes) = wire::decode_snapshot(payload)?;
        let state =
            self.machine
                .deserialize_state(&state_bytes, header.base_version, attrs.timestamp)?;
        Ok((state, header))
    }

    /// Whether a forward snapshot may be applied right now, or the grace
    /// period must run down first. Progress on the delta log restarts the
    /// window so in-flight deltas get a chance to confirm before being
    /// discarded by the fast-forward.
    fn can_fast_forward(&mut self, target: Lsn) -> bool {
        if self.timers.is_active(&TimerKey::FastForwardGrace) {
            return false;
        }
        if self.allow_fast_forward_up_to < target {
            self.allow_fast_forward_up_to = target;
            self.timers
                .schedule(TimerKey::FastForwardGrace, self.cfg.fast_forward_grace_period);
            return false;
        }
        info!(
            version = %self.version,
            target = %target,
            "fast forwarding with a snapshot"
        );
        true
    }

    /// Apply one snapshot per the arbitration policy. Returns false when the
    /// snapshot could not be used and the delivery should be retried later.
    pub(crate) fn process_snapshot(
        &mut self,
        payload: &[u8],
        attrs: SnapshotAttributes,
    ) -> bool {
        match self.decode_snapshot_blob(payload, &attrs) {
            Err(err) => {
                // A bad last snapshot stalls the engine until a newer one is
                // written, unless configured to skip it.
                error!(
                    base_version = %attrs.base_version,
                    %err,
                    "could not deserialize snapshot"
                );
                self.stats.incr_snapshot_decode_failures();
                if !self.cfg.can_skip_bad_snapshot {
                    return false;
                }
            }
            Ok((state, header)) => {
                if header.base_version > self.version {
                    if self.sync_state == SyncState::Tailing
                        && !self.waiting_for_snapshot.is_valid()
                        && !self.can_fast_forward(header.base_version)
                    {
                        debug!(
                            target = %header.base_version,
                            "fast forward deferred by grace period"
                        );
                        return false;
                    }

                    self.data = state;
                    self.version = header.base_version;
                    self.last_snapshot_version = header.base_version;
                    self.last_snapshot_last_read_ptr =
                        if header.format_version >= SnapshotHeader::FORMAT_WITH_READ_PTR {
                            header.delta_log_read_ptr
                        } else {
                            Lsn::INVALID
                        };
                    self.delta_log_byte_offset = header.byte_offset;
                    self.delta_log_offset = header.offset;
                    self.stats.incr_snapshots_applied();

                    info!(
                        lsn = %attrs.base_version,
                        base_version = %header.base_version,
                        read_ptr = %self.last_snapshot_last_read_ptr,
                        format_version = header.format_version,
                        sync_state = ?self.sync_state,
                        "applied snapshot"
                    );

                    self.advertise_in_memory();
                    if self.sync_state == SyncState::Tailing || self.cfg.deliver_while_replaying {
                        self.notify_subscribers(None);
                    }
                } else if header.format_version >= SnapshotHeader::FORMAT_WITH_READ_PTR
                    && header.delta_log_read_ptr > self.last_snapshot_last_read_ptr
                {
                    // Base version unchanged but the snapshot covers the
                    // delta log further (deltas were filtered or lost).
                    // Update the metadata; the state itself is identical, so
                    // subscribers are not notified.
                    self.last_snapshot_last_read_ptr = header.delta_log_read_ptr;
                    self.delta_log_byte_offset = header.byte_offset;
                    self.delta_log_offset = header.offset;
                    info!(
                        lsn = %attrs.base_version,
                        base_version = %header.base_version,
                        read_ptr = %self.last_snapshot_last_read_ptr,
                        "snapshot advanced the delta log read pointer"
                    );
                }

                // max() because snapshot emission may already have advanced
                // these, and snapshots can arrive out of order.
                self.last_snapshot_byte_offset =
                    self.last_snapshot_byte_offset.max(header.byte_offset);
                self.last_snapshot_offset = self.last_snapshot_offset.max(header.offset);
            }
        }

        if self.sync_state == SyncState::SyncSnapshot
            && attrs.base_version >= self.snapshot_sync
        {
            self.on_base_snapshot_retrieved();
        }

        let mut resume_delta_reading = false;
        if self.waiting_for_snapshot.is_valid()
            && (self.version >= self.waiting_for_snapshot
                || self.last_snapshot_last_read_ptr >= self.waiting_for_snapshot)
        {
            // The snapshot accounts for the data we missed; delta reading
            // can resume.
            info!(
                waiting_for = %self.waiting_for_snapshot,
                version = %self.version,
                "stall resolved by snapshot"
            );
            self.waiting_for_snapshot = Lsn::INVALID;
            resume_delta_reading = true;
            self.timers.cancel(&TimerKey::StallGrace);
            self.snapshot_fetch_backoff.reset();
            if self.bumped_stalled_stat {
                self.stats.decr_stalled();
                self.bumped_stalled_stat = false;
            }
        }

        // A fast-forward may have overtaken in-flight deltas.
        self.discard_skipped_pending_deltas();

        self.timers.cancel(&TimerKey::FastForwardGrace);

        if resume_delta_reading {
            // Last step on purpose: resuming may deliver records that arm
            // the very timers cancelled above.
            if let Some(rsid) = self.delta_rsid {
                self.log.resume_read_stream(rsid);
            }
        }
        true
    }

    fn on_base_snapshot_retrieved(&mut self) {
        info!(
            version = %self.version,
            read_ptr = %self.last_snapshot_last_read_ptr,
            "base snapshot retrieved"
        );
        self.advertise_in_memory();
        self.timers
            .schedule(TimerKey::SnapshotTick, self.cfg.snapshotting_grace_period);
        self.sync_state = SyncState::SyncDeltas;
        if !self.delta_read_ptr.is_valid() {
            // The base snapshot covers the delta log at least up to its own
            // version, even if it carried no read pointer.
            self.delta_read_ptr = self.last_snapshot_last_read_ptr.max(self.version);
        }
        self.get_delta_log_tail();
    }

    // --- Delta ingestion ---

    fn get_delta_log_tail(&mut self) {
        debug_assert_eq!(self.sync_state, SyncState::SyncDeltas);
        info!(log = %self.cfg.delta_log_id, "resolving delta log tail");
        let ticket = self.ticket.clone();
        self.log.query_tail_lsn(
            self.cfg.delta_log_id,
            Box::new(move |st, tail| {
                ticket.post(move |core| core.on_delta_log_tail(st, tail));
            }),
        );
    }

    fn on_delta_log_tail(&mut self, st: Status, tail: Lsn) {
        // Tail queries carry no timeout, so completion must succeed.
        assert_eq!(st, Status::Ok, "delta log tail query failed");
        debug_assert!(tail.is_valid());
        info!(tail = %tail, "delta log tail resolved");

        self.delta_sync = tail;

        let start = self.version.max(self.last_snapshot_last_read_ptr).next();
        let until = if self.cfg.stop_at_tail {
            self.delta_sync
        } else {
            Lsn::MAX
        };

        // With stop_at_tail the stream may be empty; the stream may also
        // already exist after a health-recovery resync.
        if self.delta_rsid.is_none() && start <= until {
            let handler = Box::new(StreamRelay {
                ticket: self.ticket.clone(),
                target: StreamTarget::Delta,
            });
            self.delta_rsid =
                Some(self.log.open_read_stream(self.cfg.delta_log_id, start, until, handler));
        }

        if self.version >= self.delta_sync || self.delta_read_ptr >= self.delta_sync {
            // The snapshot already accounts for every delta, or we had read
            // up to the tail before the resync.
            self.on_reached_delta_tail();
        }
    }

    pub(crate) fn on_delta_record(&mut self, record: DataRecord) -> bool {
        debug!(lsn = %record.lsn, "delta record received");
        if self.waiting_for_snapshot.is_valid() {
            debug!(
                waiting_for = %self.waiting_for_snapshot,
                "stalled; rejecting delta delivery"
            );
            return false;
        }

        self.delta_read_ptr = self.delta_read_ptr.max(record.lsn);

        if self.timers.is_active(&TimerKey::FastForwardGrace) {
            // Progress resets the fast-forward window.
            self.timers
                .schedule(TimerKey::FastForwardGrace, self.cfg.fast_forward_grace_period);
        }

        if record.lsn <= self.version || record.lsn <= self.last_snapshot_last_read_ptr {
            debug!(
                lsn = %record.lsn,
                version = %self.version,
                read_ptr = %self.last_snapshot_last_read_ptr,
                "skipping delta below snapshot coverage"
            );
            self.stats.incr_deltas_skipped();
            return true;
        }

        let (header, body_at) = DeltaHeader::decode(&record.payload);

        let mut status = Status::Ok;
        let mut failure_reason = String::new();
        let mut applied: Option<M::Delta> = None;

        match self.machine.deserialize_delta(&record.payload[body_at..]) {
            Err(err) => {
                info!(lsn = %record.lsn, %err, "could not decode delta record");
                self.stats.incr_delta_decode_failures();
                status = err.status();
            }
            Ok(delta) => {
                match self
                    .machine
                    .apply_delta(&mut self.data, &delta, record.lsn, record.timestamp)
                {
                    Err(err) => {
                        info!(
                            lsn = %record.lsn,
                            status = %err.status,
                            reason = %err.reason,
                            "could not apply delta"
                        );
                        status = err.status;
                        failure_reason = err.reason;
                    }
                    Ok(()) => {
                        debug!(lsn = %record.lsn, "applied delta");
                        // The version advances only on successful apply, so
                        // it is always the version of the last delta or
                        // snapshot subscribers actually saw.
                        self.version = record.lsn;
                        self.stats.incr_deltas_applied();
                        applied = Some(delta);
                    }
                }
            }
        }

        self.delta_log_byte_offset += record.payload.len() as u64;
        self.delta_log_offset += 1;

        if let Some(uuid) = header.uuid() {
            if self.pending.contains(&uuid) {
                if self.state_delivery_blocked {
                    info!(
                        lsn = %record.lsn,
                        "confirmation delivery is blocked; leaving the entry pending"
                    );
                } else if let Some(entry) = self.pending.remove(&uuid) {
                    self.timers.cancel(&TimerKey::Confirm(uuid));
                    (entry.cb)(status, record.lsn, &failure_reason);
                }
            }
        }

        // Covers deltas whose header, and thus uuid, could not be parsed.
        self.discard_skipped_pending_deltas();

        if status == Status::Ok
            && (self.sync_state == SyncState::Tailing || self.cfg.deliver_while_replaying)
        {
            if let Some(delta) = applied.as_ref() {
                self.notify_subscribers(Some(delta));
            }
        }

        if self.sync_state == SyncState::SyncDeltas && record.lsn >= self.delta_sync {
            self.on_reached_delta_tail();
        }
        true
    }

    pub(crate) fn on_delta_gap(&mut self, gap: GapRecord) -> bool {
        debug!(kind = ?gap.kind, lo = %gap.lo, hi = %gap.hi, "delta log gap");
        if self.waiting_for_snapshot.is_valid() {
            debug!(
                waiting_for = %self.waiting_for_snapshot,
                "stalled; rejecting gap delivery"
            );
            return false;
        }

        self.delta_read_ptr = self.delta_read_ptr.max(gap.hi);

        if gap.hi <= self.version || gap.hi <= self.last_snapshot_last_read_ptr {
            debug!(
                hi = %gap.hi,
                version = %self.version,
                read_ptr = %self.last_snapshot_last_read_ptr,
                "skipping gap below snapshot coverage"
            );
            return true;
        }

        let mut stalled = false;
        if !self.has_snapshot_source() {
            match gap.kind {
                GapType::DataLoss => {
                    error!(
                        lo = %gap.lo,
                        hi = %gap.hi,
                        "data loss on the delta log and no snapshot log configured"
                    );
                }
                GapType::Trim => {
                    // Without snapshots, a trim means the state starts over.
                    let (state, _version) = self.machine.make_default();
                    self.data = state;
                    self.version = gap.hi;
                    if self.sync_state == SyncState::Tailing || self.cfg.deliver_while_replaying {
                        self.notify_subscribers(None);
                    }
                }
                GapType::Bridge => {}
            }
        } else {
            // The version_ != OLDEST check keeps the initial trim gap of a
            // fresh delta log (empty snapshot log, e.g. right after
            // migration) from stalling the engine.
            let skipping_data = (gap.kind == GapType::DataLoss && self.cfg.stall_if_data_loss)
                || (gap.kind == GapType::Trim && self.version != Lsn::OLDEST);
            if skipping_data {
                warn!(
                    kind = ?gap.kind,
                    lo = %gap.lo,
                    hi = %gap.hi,
                    "gap skips over data; stalling delta ingestion until a covering snapshot arrives"
                );
                self.waiting_for_snapshot = gap.hi;
                // If this does not resolve in time, bump a stat an operator
                // can alert on.
                self.timers
                    .schedule(TimerKey::StallGrace, self.cfg.fast_forward_grace_period);
                self.request_snapshot_fetch();
                stalled = true;
            }
        }

        if self.sync_state == SyncState::SyncDeltas && gap.hi >= self.delta_sync {
            self.on_reached_delta_tail();
        }
        !stalled
    }

    pub(crate) fn on_delta_stream_health(&mut self, healthy: bool) {
        if self.delta_stream_healthy != healthy {
            info!(healthy, "delta read stream health changed");
            if healthy && self.sync_state == SyncState::Tailing {
                // Catch deltas missed while the stream was unhealthy.
                self.sync_state = SyncState::SyncDeltas;
                self.get_delta_log_tail();
            }
        }
        self.delta_stream_healthy = healthy;
    }

    fn on_reached_delta_tail(&mut self) {
        self.sync_state = SyncState::Tailing;
        info!(version = %self.version, "reached delta log tail; now tailing");

        // If updates were withheld during replay, deliver the first one now.
        if !self.cfg.deliver_while_replaying {
            self.notify_subscribers(None);
        }

        if self.cfg.stop_at_tail {
            self.schedule_stop();
        }
    }

    // --- Write path ---

    pub(crate) fn write_delta(
        &mut self,
        payload: Vec<u8>,
        mode: WriteMode,
        base_version: Option<Lsn>,
        timeout: Option<Duration>,
        cb: WriteCallback,
    ) {
        if self.stopped {
            cb(Status::Failed, Lsn::INVALID, "state machine is stopped");
            return;
        }

        if mode == WriteMode::ConfirmApplied {
            if self.sync_state != SyncState::Tailing {
                cb(Status::Again, Lsn::INVALID, "still replaying the backlog");
                return;
            }
            if !self.delta_stream_healthy {
                info!("rejecting CONFIRM_APPLIED write: delta read stream is unhealthy");
                cb(Status::Again, Lsn::INVALID, "delta read stream is unhealthy");
                return;
            }
            if self.pending.len() >= self.cfg.max_pending_confirmation {
                cb(
                    Status::NoBufs,
                    Lsn::INVALID,
                    "too many deltas pending confirmation",
                );
                return;
            }
            if !self.cfg.write_delta_header {
                // Confirmation matches read-back deltas by header uuid.
                cb(
                    Status::NotSupported,
                    Lsn::INVALID,
                    "confirmation requires delta headers",
                );
                return;
            }
        }

        if let Some(base) = base_version {
            // Optimistic concurrency: only write against the version the
            // caller computed the delta from.
            if base < self.version {
                info!(
                    base = %base,
                    version = %self.version,
                    "rejecting write: stale base version"
                );
                cb(Status::Stale, Lsn::INVALID, "version conflict");
                return;
            }
            if base > self.version {
                cb(
                    Status::Failed,
                    Lsn::INVALID,
                    "base version is ahead of the state",
                );
                return;
            }
        }

        let uuid = Uuid::new_v4();
        let buf = if self.cfg.write_delta_header {
            DeltaHeader::encode_payload(uuid, &payload)
        } else {
            payload
        };

        let confirming = mode == WriteMode::ConfirmApplied;
        let direct_cb = if confirming {
            self.pending
                .push(uuid, timeout.unwrap_or(self.cfg.confirm_timeout), cb);
            None
        } else {
            Some(cb)
        };

        self.delta_appends_in_flight += 1;
        let append_timeout = timeout.unwrap_or(self.cfg.delta_append_timeout);
        let ticket = self.ticket.clone();
        self.log.append(
            self.cfg.delta_log_id,
            buf,
            append_timeout,
            Box::new(move |st, lsn| {
                ticket.post(move |core| {
                    core.on_delta_append_result(uuid, confirming, st, lsn, direct_cb)
                });
            }),
        );
    }

    fn on_delta_append_result(
        &mut self,
        uuid: Uuid,
        confirming: bool,
        st: Status,
        lsn: Lsn,
        direct_cb: Option<WriteCallback>,
    ) {
        debug_assert!(self.delta_appends_in_flight > 0);
        self.delta_appends_in_flight = self.delta_appends_in_flight.saturating_sub(1);

        if st != Status::Ok {
            error!(status = %st, "could not append delta");
        } else {
            debug!(lsn = %lsn, "delta appended");
        }

        if confirming {
            if !self.pending.contains(&uuid) {
                return;
            }
            if st == Status::Ok {
                let timeout = match self.pending.get_mut(&uuid) {
                    Some(entry) => {
                        entry.lsn = lsn;
                        Some(entry.timeout)
                    }
                    None => None,
                };
                if let Some(timeout) = timeout {
                    self.timers.schedule(TimerKey::Confirm(uuid), timeout);
                }
                // A snapshot may already have fast-forwarded past this lsn.
                self.discard_skipped_pending_deltas();
            } else if let Some(entry) = self.pending.remove(&uuid) {
                (entry.cb)(st, Lsn::INVALID, "could not append the delta");
            }
        } else if let Some(cb) = direct_cb {
            let version = if st == Status::Ok { lsn } else { Lsn::INVALID };
            cb(st, version, "");
        }
    }

    /// Fail confirmations for deltas a snapshot jumped over: their effect is
    /// folded into the snapshot, so whether the apply succeeded is unknown.
    fn discard_skipped_pending_deltas(&mut self) {
        loop {
            let overtaken = self
                .pending
                .front()
                .map_or(false, |front| front.lsn.is_valid() && front.lsn <= self.version);
            if !overtaken {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                self.timers.cancel(&TimerKey::Confirm(entry.uuid));
                (entry.cb)(Status::Failed, entry.lsn, "confirmation skipped by snapshot");
            }
        }
    }

    fn on_confirm_timeout(&mut self, uuid: Uuid) {
        let entry = match self.pending.remove(&uuid) {
            Some(entry) => entry,
            None => return,
        };
        // The append landed but the delta was not read back in time. The
        // apply outcome is unknown to the caller.
        error!(
            lsn = %entry.lsn,
            "timed out waiting for the state machine to catch up with a written delta"
        );
        (entry.cb)(Status::TimedOut, entry.lsn, "confirmation timed out");
    }

    // --- Snapshot emission ---

    fn is_elected_snapshotter(&self) -> bool {
        match self.cluster.first_alive_node() {
            Some(first) => first == self.cluster.my_node_index(),
            None => false,
        }
    }

    fn snapshot_tick(&mut self) {
        let store_allows = self
            .snapshot_store
            .as_ref()
            .map_or(false, |store| store.is_writable());
        let elected = self.is_elected_snapshotter();
        debug!(store_allows, elected, "snapshot timer tick");

        if store_allows || elected {
            info!("taking a time-based snapshot");
            self.snapshot(Some(Box::new(|st| {
                if st != Status::Ok && st != Status::UpToDate {
                    error!(status = %st, "time-based snapshot failed");
                } else {
                    debug!(status = %st, "time-based snapshot finished");
                }
            })));
        } else {
            debug!("not the node responsible for snapshots; skipping the tick");
        }

        if !self.timers.is_active(&TimerKey::SnapshotTick) {
            self.timers
                .schedule(TimerKey::SnapshotTick, self.cfg.snapshotting_grace_period);
        }
    }

    fn build_snapshot_payload(&self, include_read_ptr: bool) -> crate::error::Result<Vec<u8>> {
        let header = SnapshotHeader {
            format_version: if include_read_ptr {
                SnapshotHeader::FORMAT_WITH_READ_PTR
            } else {
                SnapshotHeader::FORMAT_BASE
            },
            flags: 0,
            byte_offset: self.delta_log_byte_offset,
            offset: self.delta_log_offset,
            base_version: self.version,
            delta_log_read_ptr: self.delta_read_ptr,
        };
        let state_bytes = self.machine.serialize_state(&self.data);
        wire::encode_snapshot(header, &state_bytes, self.cfg.snapshot_compression)
    }

    pub(crate) fn snapshot(&mut self, cb: Option<DoneCallback>) {
        if !self.has_snapshot_source() {
            error!("cannot snapshot: no snapshot log or store configured");
            finish(cb, Status::NotSupported);
            return;
        }
        if self.snapshot_in_flight {
            finish(cb, Status::InProgress);
            return;
        }
        if self.sync_state != SyncState::Tailing {
            finish(cb, Status::Again);
            return;
        }

        let include_read_ptr = self.cfg.include_read_pointer_in_snapshot;
        info!(
            version = %self.version,
            read_ptr = %self.delta_read_ptr,
            compression = self.cfg.snapshot_compression,
            "creating snapshot"
        );

        if include_read_ptr && self.delta_read_ptr < self.version {
            error!(
                read_ptr = %self.delta_read_ptr,
                version = %self.version,
                "inconsistent state: delta read pointer behind version; not snapshotting"
            );
            finish(cb, Status::Failed);
            return;
        }

        let skip = self.snapshot_store.is_some()
            && self.version <= self.last_written_version
            && (!include_read_ptr || self.last_snapshot_last_read_ptr >= self.delta_read_ptr);
        if skip {
            debug!(
                version = %self.version,
                last_written = %self.last_written_version,
                "snapshot already up to date"
            );
            self.advertise_durable(self.last_written_version);
            finish(cb, Status::UpToDate);
            return;
        }

        let payload = match self.build_snapshot_payload(include_read_ptr) {
            Ok(payload) => payload,
            Err(err) => {
                error!(%err, "could not serialize snapshot");
                finish(cb, Status::Failed);
                return;
            }
        };

        // Captured now: other snapshots may be ingested before the write
        // completes.
        let byte_offset_at = self.delta_log_byte_offset;
        let offset_at = self.delta_log_offset;
        let read_ptr_at = self.delta_read_ptr;

        self.snapshot_in_flight = true;
        let ticket = self.ticket.clone();
        let completion: Box<dyn FnOnce(Status, Lsn) + Send> = Box::new(move |st, lsn| {
            ticket.post(move |core| {
                core.on_snapshot_written(st, lsn, byte_offset_at, offset_at, read_ptr_at, cb);
            });
        });

        if let Some(store) = self.snapshot_store.clone() {
            store.write_snapshot(self.version, payload, completion);
        } else if let Some(snapshot_log) = self.cfg.snapshot_log_id {
            self.log
                .append(snapshot_log, payload, self.cfg.snapshot_append_timeout, completion);
        }
    }

    fn on_snapshot_written(
        &mut self,
        st: Status,
        lsn: Lsn,
        byte_offset_at: u64,
        offset_at: u64,
        read_ptr_at: Lsn,
        cb: Option<DoneCallback>,
    ) {
        match st {
            Status::Ok => {
                // Updated as soon as the write lands rather than when the
                // snapshot is read back, so bytes/records-since-snapshot do
                // not report stale values. max() because snapshots ingested
                // meanwhile may have advanced these further.
                self.last_snapshot_byte_offset = self.last_snapshot_byte_offset.max(byte_offset_at);
                self.last_snapshot_offset = self.last_snapshot_offset.max(offset_at);
                self.last_written_version = lsn;
                self.last_snapshot_last_read_ptr = read_ptr_at;
                info!(
                    version = %lsn,
                    read_ptr = %read_ptr_at,
                    "snapshot written"
                );
                self.stats.incr_snapshots_written();
                self.advertise_durable(self.last_written_version);
            }
            Status::UpToDate => {
                self.advertise_durable(lsn);
            }
            _ => {
                warn!(status = %st, "snapshot write failed");
                self.stats.incr_snapshot_write_failures();
                self.advertise_durable(Lsn::INVALID);
            }
        }
        self.snapshot_in_flight = false;
        finish(cb, st);
    }

    /// Serialize the current in-memory state as a snapshot blob, for
    /// host-side snapshot store services.
    pub(crate) fn snapshot_from_memory(
        &self,
        min_version: Lsn,
    ) -> std::result::Result<(Lsn, Vec<u8>), Status> {
        if min_version > self.version {
            return Err(Status::Stale);
        }
        match self.build_snapshot_payload(self.cfg.include_read_pointer_in_snapshot) {
            Ok(payload) => Ok((self.version, payload)),
            Err(err) => {
                error!(%err, "could not serialize snapshot from memory");
                Err(Status::Failed)
            }
        }
    }

    // --- Trim ---

    pub(crate) fn trim(&mut self, retention: Duration, cb: DoneCallback) {
        let log_based = self.snapshot_store.as_ref().map(|s| s.is_log_based());
        match log_based {
            None => {
                // Legacy: trim the snapshot log by retention, then the delta
                // log below snapshot coverage.
                self.legacy_trim(retention, false, Some(cb));
            }
            Some(true) => {
                // The store's durable version bounds the delta trim; only
                // the snapshot log itself is trimmed by retention.
                self.legacy_trim(retention, true, None);
                self.trim_delta(cb);
            }
            Some(false) => {
                self.trim_delta(cb);
            }
        }
    }

    fn legacy_trim(&mut self, retention: Duration, snapshot_only: bool, cb: Option<DoneCallback>) {
        let snapshot_log = match self.cfg.snapshot_log_id {
            Some(log) => log,
            None => {
                finish(cb, Status::NotSupported);
                return;
            }
        };
        let cutoff = crate::types::Timestamp::now() - retention;
        info!(
            log = %snapshot_log,
            snapshot_only,
            "trimming snapshot log up to the retention cutoff"
        );
        let ticket = self.ticket.clone();
        self.log.find_time(
            snapshot_log,
            cutoff,
            Box::new(move |st, lsn| {
                ticket.post(move |core| core.on_trim_find_time(st, lsn, snapshot_only, cb));
            }),
        );
    }

    fn on_trim_find_time(
        &mut self,
        st: Status,
        lsn: Lsn,
        snapshot_only: bool,
        cb: Option<DoneCallback>,
    ) {
        if st != Status::Ok || !lsn.is_valid() {
            error!(status = %st, "could not resolve the snapshot log trim point");
            finish(cb, if st == Status::Ok { Status::NotFound } else { st });
            return;
        }

        // find_time returns the first LSN at or after the cutoff; everything
        // strictly below it is out of retention.
        let up_to = match lsn.prev().filter(|l| l.is_valid()) {
            Some(up_to) => up_to,
            None => {
                self.after_snapshot_log_trim(Status::Ok, snapshot_only, cb);
                return;
            }
        };

        let snapshot_log = match self.cfg.snapshot_log_id {
            Some(log) => log,
            None => return,
        };
        let ticket = self.ticket.clone();
        self.log.trim(
            snapshot_log,
            up_to,
            TRIM_TIMEOUT,
            Box::new(move |st| {
                ticket.post(move |core| core.after_snapshot_log_trim(st, snapshot_only, cb));
            }),
        );
    }

    fn after_snapshot_log_trim(
        &mut self,
        st: Status,
        snapshot_only: bool,
        cb: Option<DoneCallback>,
    ) {
        if st != Status::Ok {
            error!(status = %st, "could not trim snapshot log");
            finish(cb, st);
            return;
        }
        if snapshot_only {
            finish(cb, Status::Ok);
            return;
        }
        // Deltas at or below the newest ingested snapshot are covered by it.
        let up_to = self.last_snapshot_version;
        if !up_to.is_valid() {
            finish(cb, Status::NotFound);
            return;
        }
        self.trim_delta_up_to(up_to, cb);
    }

    fn trim_delta(&mut self, cb: DoneCallback) {
        let store = match &self.snapshot_store {
            Some(store) => Arc::clone(store),
            None => {
                cb(Status::NotSupported);
                return;
            }
        };
        let ticket = self.ticket.clone();
        store.get_durable_version(Box::new(move |st, durable| {
            ticket.post(move |core| {
                if st != Status::Ok {
                    cb(st);
                    return;
                }
                if !durable.is_valid() {
                    // No safe trim point yet.
                    cb(Status::NotFound);
                    return;
                }
                core.trim_delta_up_to(durable, Some(cb));
            });
        }));
    }

    fn trim_delta_up_to(&mut self, up_to: Lsn, cb: Option<DoneCallback>) {
        let delta_log = self.cfg.delta_log_id;
        info!(log = %delta_log, up_to = %up_to, "trimming delta log");
        let ticket = self.ticket.clone();
        self.log.trim(
            delta_log,
            up_to,
            TRIM_TIMEOUT,
            Box::new(move |st| {
                ticket.post(move |_core: &mut EngineCore<M>| {
                    info!(log = %delta_log, status = %st, "delta log trim finished");
                    finish(cb, st);
                });
            }),
        );
    }

    // --- Subscriptions and delivery ---

    pub(crate) fn subscribe(&mut self, mut cb: UpdateFn<M>) -> SubscriberId {
        // A subscriber attached after replay finished gets the current state
        // immediately; during replay it will be delivered on reaching the
        // tail.
        if self.sync_state == SyncState::Tailing {
            cb(&self.data, None, self.version);
        }
        self.subscribers.insert(cb)
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriberId) {
        self.subscribers.remove(id);
    }

    pub(crate) fn block_state_delivery(&mut self, blocked: bool) -> bool {
        let prev = self.state_delivery_blocked;
        self.state_delivery_blocked = blocked;
        if prev && !blocked {
            info!("state delivery unblocked; publishing the current state");
            if self.sync_state == SyncState::Tailing || self.cfg.deliver_while_replaying {
                self.notify_subscribers(None);
            }
        }
        prev
    }

    fn notify_subscribers(&mut self, delta: Option<&M::Delta>) {
        if self.subscribers.is_empty() {
            return;
        }
        if self.state_delivery_blocked {
            warn!(
                version = %self.version,
                "state delivery is blocked; not notifying subscribers"
            );
            return;
        }
        debug!(version = %self.version, "notifying subscribers");
        self.subscribers.notify(&self.data, delta, self.version);
        self.advertise_in_memory();
    }

    // --- Introspection ---

    pub(crate) fn delta_read_ptr(&self) -> Lsn {
        self.delta_read_ptr
    }

    pub(crate) fn debug_info(&self) -> RsmDebugInfo {
        let snapshot_next_lsn = self
            .snapshot_rsid
            .and_then(|id| self.log.read_stream_next_lsn(id))
            .unwrap_or(Lsn::INVALID);
        RsmDebugInfo {
            delta_log_id: self.cfg.delta_log_id,
            snapshot_log_id: self.cfg.snapshot_log_id,
            version: self.version,
            delta_read_ptr: self.delta_read_ptr,
            delta_sync: self.delta_sync,
            snapshot_next_lsn,
            snapshot_sync: self.snapshot_sync,
            waiting_for_snapshot: self.waiting_for_snapshot,
            delta_appends_in_flight: self.delta_appends_in_flight,
            pending_confirmations: self.pending.len(),
            snapshot_in_flight: self.snapshot_in_flight,
            bytes_since_last_snapshot: self
                .delta_log_byte_offset
                .saturating_sub(self.last_snapshot_byte_offset),
            deltas_since_last_snapshot: self
                .delta_log_offset
                .saturating_sub(self.last_snapshot_offset),
            delta_stream_healthy: self.delta_stream_healthy,
        }
    }
}

impl<M: Machine> WorkerState for EngineCore<M> {
    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::FastForwardGrace => {
                debug!("fast-forward grace period elapsed");
                // The deferred snapshot is redelivered by the resumed stream
                // (or by the next store fetch) and applies this time.
                if let Some(rsid) = self.snapshot_rsid {
                    self.log.resume_read_stream(rsid);
                }
            }
            TimerKey::StallGrace => {
                if self.waiting_for_snapshot.is_valid() {
                    warn!(
                        waiting_for = %self.waiting_for_snapshot,
                        "still stalled waiting for a snapshot"
                    );
                    self.stats.incr_stalled();
                    self.bumped_stalled_stat = true;
                }
            }
            TimerKey::SnapshotTick => self.snapshot_tick(),
            TimerKey::SnapshotFetch => self.fetch_snapshot(),
            TimerKey::Confirm(uuid) => self.on_confirm_timeout(uuid),
            TimerKey::Stop => self.stop(),
        }
    }

    fn timers(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    fn finished(&self) -> bool {
        self.stopped
    }
}
