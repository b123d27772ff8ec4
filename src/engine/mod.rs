//! The replicated state machine engine and its published surface.

mod core;
mod pending;
mod subscriptions;

pub use subscriptions::{SubscriberId, SubscriptionHandle};

use crate::client::{ClusterState, LogClient, SnapshotStore};
use crate::engine::core::EngineCore;
use crate::engine::pending::WriteCallback;
use crate::engine::subscriptions::UpdateFn;
use crate::error::Status;
use crate::machine::Machine;
use crate::types::{LogId, Lsn, RsmDebugInfo, WriteMode};
use crate::worker::{self, Ticket};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Completion callback carrying only a status.
pub type DoneCallback = Box<dyn FnOnce(Status) + Send>;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct RsmConfig {
    /// Log the deltas are appended to and replayed from.
    pub delta_log_id: LogId,

    /// Log periodic snapshots are written to. `None` disables snapshots
    /// entirely unless a snapshot store is supplied instead.
    pub snapshot_log_id: Option<LogId>,

    /// Stop once the delta log tail observed at startup is reached, instead
    /// of tailing forever.
    pub stop_at_tail: bool,

    /// Deliver updates to subscribers during the initial replay rather than
    /// only once tailing starts.
    pub deliver_while_replaying: bool,

    /// Skip snapshots that fail to decode instead of stalling on them.
    pub can_skip_bad_snapshot: bool,

    /// Stall on DATALOSS gaps in the delta log until a covering snapshot
    /// arrives.
    pub stall_if_data_loss: bool,

    /// Prefix written deltas with a header carrying a UUID and checksum.
    /// Required for CONFIRM_APPLIED writes.
    pub write_delta_header: bool,

    /// Zstd-compress snapshot payloads.
    pub snapshot_compression: bool,

    /// Record the delta log read pointer in emitted snapshots.
    pub include_read_pointer_in_snapshot: bool,

    /// Window during which a forward snapshot is held back so in-flight
    /// deltas can confirm. Also used as the stall alerting grace period.
    pub fast_forward_grace_period: Duration,

    /// Interval between periodic snapshot attempts; also the initial delay.
    pub snapshotting_grace_period: Duration,

    /// Default time to wait for a CONFIRM_APPLIED delta to be read back.
    pub confirm_timeout: Duration,

    pub delta_append_timeout: Duration,
    pub snapshot_append_timeout: Duration,

    /// Backpressure bound on CONFIRM_APPLIED writes in flight.
    pub max_pending_confirmation: usize,

    /// Exponential backoff bounds for snapshot store fetch retries.
    pub snapshot_fetch_initial_delay: Duration,
    pub snapshot_fetch_max_delay: Duration,
}

impl RsmConfig {
    pub fn new(delta_log_id: LogId) -> Self {
        Self {
            delta_log_id,
            snapshot_log_id: None,
            stop_at_tail: false,
            deliver_while_replaying: false,
            can_skip_bad_snapshot: false,
            stall_if_data_loss: true,
            write_delta_header: true,
            snapshot_compression: true,
            include_read_pointer_in_snapshot: true,
            fast_forward_grace_period: Duration::from_secs(10),
            snapshotting_grace_period: Duration::from_secs(600),
            confirm_timeout: Duration::from_secs(30),
            delta_append_timeout: Duration::from_secs(30),
            snapshot_append_timeout: Duration::from_secs(120),
            max_pending_confirmation: 500,
            snapshot_fetch_initial_delay: Duration::from_secs(1),
            snapshot_fetch_max_delay: Duration::from_secs(600),
        }
    }
}

/// Options for [`ReplicatedStateMachine::write_delta`].
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Optimistic-concurrency check: fail with STALE unless the state is
    /// still at this version when the write is admitted.
    pub base_version: Option<Lsn>,
    /// Overrides both the append timeout and the confirmation timeout.
    pub timeout: Option<Duration>,
}

/// Versions the engine advertises to the host process: the in-memory
/// version tracks applied deltas and snapshots, the durable version tracks
/// published snapshots (INVALID after a failed snapshot write).
pub struct AdvertisedVersions {
    in_memory: AtomicU64,
    durable: AtomicU64,
}

impl AdvertisedVersions {
    fn new() -> Self {
        Self {
            in_memory: AtomicU64::new(Lsn::INVALID.0),
            durable: AtomicU64::new(Lsn::INVALID.0),
        }
    }

    pub fn in_memory(&self) -> Lsn {
        Lsn(self.in_memory.load(Ordering::Acquire))
    }

    pub fn durable(&self) -> Lsn {
        Lsn(self.durable.load(Ordering::Acquire))
    }

    pub(crate) fn set_in_memory(&self, version: Lsn) {
        self.in_memory.store(version.0, Ordering::Release);
    }

    pub(crate) fn set_durable(&self, version: Lsn) {
        self.durable.store(version.0, Ordering::Release);
    }
}

/// Counters for operator visibility.
#[derive(Default)]
pub struct RsmStats {
    stalled: AtomicU64,
    deltas_applied: AtomicU64,
    deltas_skipped: AtomicU64,
    delta_decode_failures: AtomicU64,
    snapshots_applied: AtomicU64,
    snapshot_decode_failures: AtomicU64,
    snapshots_written: AtomicU64,
    snapshot_write_failures: AtomicU64,
}

impl RsmStats {
    /// Gauge: engines currently stalled past the grace period.
    pub fn stalled(&self) -> u64 {
        self.stalled.load(Ordering::Relaxed)
    }

    pub fn deltas_applied(&self) -> u64 {
        self.deltas_applied.load(Ordering::Relaxed)
    }

    pub fn deltas_skipped(&self) -> u64 {
        self.deltas_skipped.load(Ordering::Relaxed)
    }

    pub fn delta_decode_failures(&self) -> u64 {
        self.delta_decode_failures.load(Ordering::Relaxed)
    }

    pub fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied.load(Ordering::Relaxed)
    }

    pub fn snapshot_decode_failures(&self) -> u64 {
        self.snapshot_decode_failures.load(Ordering::Relaxed)
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written.load(Ordering::Relaxed)
    }

    pub fn snapshot_write_failures(&self) -> u64 {
        self.snapshot_write_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn incr_stalled(&self) {
        self.stalled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn decr_stalled(&self) {
        self.stalled.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_deltas_applied(&self) {
        self.deltas_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_deltas_skipped(&self) {
        self.deltas_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_delta_decode_failures(&self) {
        self.delta_decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_snapshots_applied(&self) {
        self.snapshots_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_snapshot_decode_failures(&self) {
        self.snapshot_decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_snapshots_written(&self) {
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_snapshot_write_failures(&self) {
        self.snapshot_write_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Signalled once on stop; [`ReplicatedStateMachine::wait`] parks on it.
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn signal(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                return *stopped;
            }
        }
        true
    }
}

/// Handle to a running replicated state machine.
///
/// The engine itself lives on a dedicated owner worker thread; this handle
/// posts operations onto it. Dropping the handle stops the engine and joins
/// the worker.
///
/// Handle methods must not be called from inside a subscriber callback:
/// those run on the owner worker, and the handle would wait on it.
pub struct ReplicatedStateMachine<M: Machine> {
    ticket: Ticket<EngineCore<M>>,
    join: Option<JoinHandle<()>>,
    stop_signal: Arc<StopSignal>,
    versions: Arc<AdvertisedVersions>,
    stats: Arc<RsmStats>,
}

impl<M: Machine> ReplicatedStateMachine<M> {
    /// Start the engine: spawn the owner worker, load the latest snapshot,
    /// replay deltas and start tailing.
    pub fn spawn(
        cfg: RsmConfig,
        machine: M,
        log: Arc<dyn LogClient>,
        snapshot_store: Option<Arc<dyn SnapshotStore>>,
        cluster: Arc<dyn ClusterState>,
    ) -> Self {
        let stop_signal = Arc::new(StopSignal::new());
        let versions = Arc::new(AdvertisedVersions::new());
        let stats = Arc::new(RsmStats::default());

        let worker_stop = Arc::clone(&stop_signal);
        let worker_versions = Arc::clone(&versions);
        let worker_stats = Arc::clone(&stats);
        let (ticket, join) = worker::spawn("replistate-worker", move |ticket| {
            EngineCore::new(
                cfg,
                machine,
                log,
                snapshot_store,
                cluster,
                ticket,
                worker_stats,
                worker_versions,
                worker_stop,
            )
        });
        ticket.post(|core| core.start());

        Self {
            ticket,
            join: Some(join),
            stop_signal,
            versions,
            stats,
        }
    }

    /// Attach a subscriber. If the engine is already tailing, the callback
    /// fires once with the current state before this returns.
    pub fn subscribe(
        &self,
        cb: impl FnMut(&M::State, Option<&M::Delta>, Lsn) + Send + 'static,
    ) -> SubscriptionHandle {
        let boxed: UpdateFn<M> = Box::new(cb);
        match self.ticket.call(move |core| core.subscribe(boxed)) {
            Some(id) => {
                let ticket = self.ticket.clone();
                SubscriptionHandle::new(
                    id,
                    Box::new(move || {
                        let _ = ticket.post(move |core| core.unsubscribe(id));
                    }),
                )
            }
            None => SubscriptionHandle::detached(),
        }
    }

    /// Append a delta to the delta log. With
    /// [`WriteMode::ConfirmApplied`], the callback fires only once the
    /// delta has been read back and applied locally (or definitively
    /// skipped, or timed out — in which case the apply outcome is unknown:
    /// the append may still have landed durably).
    pub fn write_delta(
        &self,
        payload: Vec<u8>,
        mode: WriteMode,
        options: WriteOptions,
        cb: impl FnOnce(Status, Lsn, &str) + Send + 'static,
    ) {
        let cb: WriteCallback = Box::new(cb);
        let _ = self.ticket.post(move |core| {
            core.write_delta(payload, mode, options.base_version, options.timeout, cb)
        });
    }

    /// Create and publish a snapshot of the current state.
    pub fn snapshot(&self, cb: impl FnOnce(Status) + Send + 'static) {
        let cb: DoneCallback = Box::new(cb);
        let _ = self.ticket.post(move |core| core.snapshot(Some(cb)));
    }

    /// Trim the snapshot log by `retention` and the delta log below
    /// snapshot coverage.
    pub fn trim(&self, retention: Duration, cb: impl FnOnce(Status) + Send + 'static) {
        let cb: DoneCallback = Box::new(cb);
        let _ = self.ticket.post(move |core| core.trim(retention, cb));
    }

    /// Schedule a stop: read streams are torn down, timers cancelled, and
    /// [`wait`](Self::wait) is unblocked.
    pub fn stop(&self) {
        let _ = self.ticket.post(|core| core.schedule_stop());
    }

    /// Block until the engine stops. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.stop_signal.wait(timeout)
    }

    /// Highest delta LSN or gap bound observed so far.
    pub fn delta_read_ptr(&self) -> Lsn {
        self.ticket
            .call(|core| core.delta_read_ptr())
            .unwrap_or(Lsn::INVALID)
    }

    /// Gate subscriber notification delivery. On unblocking, subscribers are
    /// notified with the current state. Returns the previous setting.
    pub fn block_state_delivery(&self, blocked: bool) -> bool {
        self.ticket
            .call(move |core| core.block_state_delivery(blocked))
            .unwrap_or(false)
    }

    /// Snapshot of the engine internals; `None` once stopped.
    pub fn debug_info(&self) -> Option<RsmDebugInfo> {
        self.ticket.call(|core| core.debug_info())
    }

    /// Serialize the current in-memory state as a snapshot blob, for
    /// host-side snapshot store services. `Err(Status::Stale)` if the state
    /// is behind `min_version`.
    pub fn snapshot_from_memory(
        &self,
        min_version: Lsn,
    ) -> std::result::Result<(Lsn, Vec<u8>), Status> {
        self.ticket
            .call(move |core| core.snapshot_from_memory(min_version))
            .unwrap_or(Err(Status::Failed))
    }

    /// Versions the engine advertises (in-memory and durable).
    pub fn versions(&self) -> Arc<AdvertisedVersions> {
        Arc::clone(&self.versions)
    }

    pub fn stats(&self) -> Arc<RsmStats> {
        Arc::clone(&self.stats)
    }
}

impl<M: Machine> Drop for ReplicatedStateMachine<M> {
    fn drop(&mut self) {
        let _ = self.ticket.post(|core| core.stop());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
