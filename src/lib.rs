//! # Replistate
//!
//! A replicated state machine engine on top of an append-only log service.
//! An in-memory state object is kept in sync across processes by
//! deterministically applying **deltas** read from a durable delta log;
//! the state is periodically compacted into **snapshots** written to a
//! snapshot log or a pluggable snapshot store. New instances bootstrap from
//! the latest snapshot and tail deltas from its base version forward.
//!
//! ## Core Concepts
//!
//! - **Machine**: caller-provided `{make_default, apply_delta, serialize,
//!   deserialize}` over opaque state and delta types
//! - **Sync engine**: orders snapshot fetch, delta replay and tailing, and
//!   reconciles gaps and data loss against snapshot coverage
//! - **Write path**: appends deltas, optionally confirming once they are
//!   applied locally
//! - **Snapshotting**: periodic emission by a single elected node
//!
//! ## Example
//!
//! ```ignore
//! use replistate::{LogId, ReplicatedStateMachine, RsmConfig, WriteMode, WriteOptions};
//!
//! let cfg = RsmConfig::new(LogId(1));
//! let rsm = ReplicatedStateMachine::spawn(cfg, machine, log_client, None, cluster);
//!
//! let _sub = rsm.subscribe(|state, _delta, version| {
//!     println!("state at {version}: {state:?}");
//! });
//!
//! rsm.write_delta(payload, WriteMode::ConfirmApplied, WriteOptions::default(),
//!     |status, version, reason| {
//!         println!("write finished: {status} at {version} {reason}");
//!     });
//! ```

pub mod client;
mod engine;
pub mod error;
mod machine;
pub mod testing;
pub mod types;
pub mod wire;
mod worker;

// Re-exports
pub use client::{ClusterState, LogClient, ReadStreamHandler, SnapshotStore};
pub use engine::{
    AdvertisedVersions, DoneCallback, ReplicatedStateMachine, RsmConfig, RsmStats, SubscriberId,
    SubscriptionHandle, WriteOptions,
};
pub use error::{Result, RsmError, Status};
pub use machine::{ApplyError, Machine};
pub use types::{
    DataRecord, GapRecord, GapType, LogId, Lsn, NodeIndex, ReadStreamId, RsmDebugInfo,
    SnapshotAttributes, Timestamp, WriteMode,
};
