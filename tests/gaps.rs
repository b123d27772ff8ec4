//! Gap handling: stalls on lost data, trim resets, fast-forward arbitration.

use replistate::testing::{
    wait_until, JournalMachine, MemorySnapshotStore, SimLogClient, StaticClusterState,
};
use replistate::wire::{encode_snapshot, SnapshotHeader};
use replistate::{
    GapType, LogId, Lsn, Machine, NodeIndex, ReplicatedStateMachine, RsmConfig, SnapshotStore,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

const DELTA_LOG: LogId = LogId(1);
const SNAPSHOT_LOG: LogId = LogId(2);

fn test_config() -> RsmConfig {
    let mut cfg = RsmConfig::new(DELTA_LOG);
    cfg.fast_forward_grace_period = Duration::from_millis(60);
    cfg.snapshotting_grace_period = Duration::from_secs(600);
    cfg.snapshot_fetch_initial_delay = Duration::from_millis(5);
    cfg.snapshot_fetch_max_delay = Duration::from_millis(50);
    cfg
}

fn lone_node() -> Arc<StaticClusterState> {
    StaticClusterState::new(NodeIndex(0), Some(NodeIndex(0)))
}

fn snapshot_blob(entries: &[&str], base_version: Lsn, read_ptr: Lsn) -> Vec<u8> {
    let state: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
    let header = SnapshotHeader {
        format_version: SnapshotHeader::FORMAT_WITH_READ_PTR,
        flags: 0,
        byte_offset: 0,
        offset: 0,
        base_version,
        delta_log_read_ptr: read_ptr,
    };
    encode_snapshot(header, &JournalMachine.serialize_state(&state), true).unwrap()
}

fn version_of(rsm: &ReplicatedStateMachine<JournalMachine>) -> Lsn {
    rsm.debug_info().map_or(Lsn::INVALID, |info| info.version)
}

#[test]
fn test_dataloss_gap_stalls_until_covering_snapshot() {
    let sim = SimLogClient::new();
    let store = MemorySnapshotStore::new();

    sim.set_tail(DELTA_LOG, Lsn(10));
    sim.push_record(DELTA_LOG, Lsn(10), b"d10".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        test_config(),
        JournalMachine,
        sim.clone(),
        Some(store.clone() as Arc<dyn SnapshotStore>),
        lone_node(),
    );
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(10)));

    // A snapshot covering the loss is already in the store when the gap
    // triggers the fetch.
    store.put(Lsn(25), snapshot_blob(&["cover"], Lsn(25), Lsn(25)));

    sim.push_gap(DELTA_LOG, GapType::DataLoss, Lsn(11), Lsn(20));
    sim.push_record(DELTA_LOG, Lsn(21), b"d21".to_vec());
    sim.push_record(DELTA_LOG, Lsn(30), b"d30".to_vec());

    // Stall resolves via the fetched snapshot, the stream resumes, 21 is
    // skipped below coverage and 30 applies.
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(30)));

    let info = rsm.debug_info().unwrap();
    assert_eq!(info.waiting_for_snapshot, Lsn::INVALID);
    assert_eq!(info.delta_read_ptr, Lsn(30));
    assert!(rsm.stats().deltas_skipped() >= 1);
    assert_eq!(rsm.stats().stalled(), 0);

    let (tx, rx) = mpsc::channel();
    let _sub = rsm.subscribe(move |state: &Vec<String>, _delta, version| {
        let _ = tx.send((state.clone(), version));
    });
    let (state, version) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(state, vec!["cover".to_string(), "d30".to_string()]);
    assert_eq!(version, Lsn(30));
}

#[test]
fn test_stall_grace_period_bumps_stat_once() {
    let sim = SimLogClient::new();
    let store = MemorySnapshotStore::new();
    let mut cfg = test_config();
    cfg.fast_forward_grace_period = Duration::from_millis(20);

    sim.set_tail(DELTA_LOG, Lsn(5));
    sim.push_record(DELTA_LOG, Lsn(5), b"d5".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        cfg,
        JournalMachine,
        sim.clone(),
        Some(store.clone() as Arc<dyn SnapshotStore>),
        lone_node(),
    );
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(5)));

    // No covering snapshot: the stall outlives the grace period.
    sim.push_gap(DELTA_LOG, GapType::DataLoss, Lsn(6), Lsn(9));
    assert!(wait_until(Duration::from_secs(2), || rsm.stats().stalled() == 1));

    // Resolution decrements the gauge again.
    store.put(Lsn(12), snapshot_blob(&["cover"], Lsn(12), Lsn(12)));
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(12)));
    assert_eq!(rsm.stats().stalled(), 0);
}

#[test]
fn test_trim_gap_without_snapshot_log_resets_state() {
    let sim = SimLogClient::new();

    sim.set_tail(DELTA_LOG, Lsn(3));
    sim.push_record(DELTA_LOG, Lsn(2), b"d2".to_vec());
    sim.push_record(DELTA_LOG, Lsn(3), b"d3".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        test_config(),
        JournalMachine,
        sim.clone(),
        None,
        lone_node(),
    );
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(3)));

    let (tx, rx) = mpsc::channel();
    let _sub = rsm.subscribe(move |state: &Vec<String>, _delta, version| {
        let _ = tx.send((state.clone(), version));
    });
    // Drain the initial-state notification.
    let _ = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    sim.push_gap(DELTA_LOG, GapType::Trim, Lsn(4), Lsn(6));

    let (state, version) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(state.is_empty());
    assert_eq!(version, Lsn(6));

    sim.push_record(DELTA_LOG, Lsn(7), b"d7".to_vec());
    let (state, version) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(state, vec!["d7".to_string()]);
    assert_eq!(version, Lsn(7));
}

#[test]
fn test_initial_trim_gap_does_not_stall() {
    let sim = SimLogClient::new();
    let store = MemorySnapshotStore::new();

    // The usual shape of a fresh delta log: a trim gap at the beginning.
    sim.set_tail(DELTA_LOG, Lsn(6));
    sim.push_gap(DELTA_LOG, GapType::Trim, Lsn(2), Lsn(5));
    sim.push_record(DELTA_LOG, Lsn(6), b"d6".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        test_config(),
        JournalMachine,
        sim.clone(),
        Some(store.clone() as Arc<dyn SnapshotStore>),
        lone_node(),
    );

    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(6)));
    assert_eq!(
        rsm.debug_info().unwrap().waiting_for_snapshot,
        Lsn::INVALID
    );
}

#[test]
fn test_trim_gap_past_applied_deltas_stalls() {
    let sim = SimLogClient::new();
    let mut cfg = test_config();
    cfg.snapshot_log_id = Some(SNAPSHOT_LOG);
    cfg.stall_if_data_loss = false; // the trim rule stalls on its own

    sim.set_tail(SNAPSHOT_LOG, Lsn::OLDEST);
    sim.push_gap(SNAPSHOT_LOG, GapType::Bridge, Lsn::OLDEST, Lsn::OLDEST);
    sim.set_tail(DELTA_LOG, Lsn(2));
    sim.push_record(DELTA_LOG, Lsn(2), b"d2".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        cfg,
        JournalMachine,
        sim.clone(),
        None,
        lone_node(),
    );
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(2)));

    sim.push_gap(DELTA_LOG, GapType::Trim, Lsn(3), Lsn(8));
    assert!(wait_until(Duration::from_secs(2), || {
        rsm.debug_info()
            .map_or(false, |info| info.waiting_for_snapshot == Lsn(8))
    }));

    // A snapshot with an unchanged base version but a read pointer past the
    // gap also clears the stall: the lost deltas were considered by it.
    sim.push_record(
        SNAPSHOT_LOG,
        Lsn(2),
        snapshot_blob(&["d2"], Lsn(2), Lsn(9)),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        rsm.debug_info()
            .map_or(false, |info| info.waiting_for_snapshot == Lsn::INVALID)
    }));
    // Base version did not move; only the read pointer advanced.
    assert_eq!(version_of(&rsm), Lsn(2));
    assert_eq!(rsm.stats().snapshots_applied(), 0);

    // Deltas at or below the new read pointer are skipped; later ones apply.
    sim.push_record(DELTA_LOG, Lsn(9), b"d9".to_vec());
    sim.push_record(DELTA_LOG, Lsn(10), b"d10".to_vec());
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(10)));
    assert!(rsm.stats().deltas_skipped() >= 1);
}

#[test]
fn test_fast_forward_deferred_by_grace_period() {
    let sim = SimLogClient::new();
    let mut cfg = test_config();
    cfg.snapshot_log_id = Some(SNAPSHOT_LOG);
    cfg.fast_forward_grace_period = Duration::from_millis(80);

    // Empty snapshot log; the gap releases the base-snapshot phase.
    sim.set_tail(SNAPSHOT_LOG, Lsn::OLDEST);
    sim.push_gap(SNAPSHOT_LOG, GapType::Bridge, Lsn::OLDEST, Lsn::OLDEST);

    sim.set_tail(DELTA_LOG, Lsn(10));
    sim.push_record(DELTA_LOG, Lsn(10), b"d10".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        cfg,
        JournalMachine,
        sim.clone(),
        None,
        lone_node(),
    );
    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(10)));

    let (tx, rx) = mpsc::channel();
    let _sub = rsm.subscribe(move |state: &Vec<String>, _delta, version| {
        let _ = tx.send((state.clone(), version));
    });
    let _ = rx.recv_timeout(Duration::from_secs(2)).unwrap();

    // A forward snapshot arrives while tailing: deferred by the grace
    // period, and a delta applied meanwhile restarts the window.
    sim.push_record(
        SNAPSHOT_LOG,
        Lsn(2),
        snapshot_blob(&["ff"], Lsn(200), Lsn(200)),
    );
    sim.push_record(DELTA_LOG, Lsn(11), b"d11".to_vec());

    let (state, version) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(version, Lsn(11));
    assert_eq!(state.last().unwrap(), "d11");
    assert_eq!(version_of(&rsm), Lsn(11));

    // Once the window runs down the snapshot is redelivered and applies.
    let (state, version) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(version, Lsn(200));
    assert_eq!(state, vec!["ff".to_string()]);
    assert_eq!(version_of(&rsm), Lsn(200));

    // Deltas below the fast-forward target are skipped.
    sim.push_record(DELTA_LOG, Lsn(12), b"d12".to_vec());
    assert!(wait_until(Duration::from_secs(2), || {
        rsm.stats().deltas_skipped() >= 1
    }));
    assert_eq!(version_of(&rsm), Lsn(200));

    // Re-applying the same snapshot is a no-op past the first application.
    let applied_before = rsm.stats().snapshots_applied();
    sim.push_record(
        SNAPSHOT_LOG,
        Lsn(3),
        snapshot_blob(&["ff"], Lsn(200), Lsn(200)),
    );
    assert!(wait_until(Duration::from_secs(2), || {
        rsm.debug_info()
            .map_or(false, |info| info.snapshot_next_lsn > Lsn(3))
    }));
    assert_eq!(rsm.stats().snapshots_applied(), applied_before);
    assert_eq!(version_of(&rsm), Lsn(200));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_bad_snapshot_skipped_when_configured() {
    let sim = SimLogClient::new();
    let store = MemorySnapshotStore::new();
    let mut cfg = test_config();
    cfg.can_skip_bad_snapshot = true;

    // Garbage in the store; the engine logs, skips and starts from default.
    store.put(Lsn(50), b"\xde\xad\xbe\xef".to_vec());
    sim.set_tail(DELTA_LOG, Lsn(2));
    sim.push_record(DELTA_LOG, Lsn(2), b"d2".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        cfg,
        JournalMachine,
        sim.clone(),
        Some(store.clone() as Arc<dyn SnapshotStore>),
        lone_node(),
    );

    assert!(wait_until(Duration::from_secs(2), || version_of(&rsm) == Lsn(2)));
    assert_eq!(rsm.stats().snapshot_decode_failures(), 1);
}

#[test]
fn test_bad_snapshot_stalls_by_default() {
    let sim = SimLogClient::new();
    let store = MemorySnapshotStore::new();

    store.put(Lsn(50), b"\xde\xad\xbe\xef".to_vec());
    sim.set_tail(DELTA_LOG, Lsn(2));
    sim.push_record(DELTA_LOG, Lsn(2), b"d2".to_vec());

    let rsm = ReplicatedStateMachine::spawn(
        test_config(),
        JournalMachine,
        sim.clone(),
        Some(store.clone() as Arc<dyn SnapshotStore>),
        lone_node(),
    );

    // No progress from the bad snapshot: still in the snapshot phase.
    std::thread::sleep(Duration::from_millis(200));
    let info = rsm.debug_info().unwrap();
    assert_eq!(info.version, Lsn::OLDEST);
    assert_eq!(info.delta_sync, Lsn::INVALID);
    assert!(rsm.stats().snapshot_decode_failures() >= 1);
}
