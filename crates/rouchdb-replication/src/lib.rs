//! CouchDB-wire-compatible replication: change tracking, multipart
//! attachment transfer, and the push/pull sync loop, composed over any pair
//! of `Adapter`s (memory, redb, or HTTP against a live peer).
pub mod change_tracker;
pub mod multipart;
pub mod replicator;

pub use change_tracker::{ChangeTracker, ChangeTrackerOptions, TrackerMode, TrackerState};
pub use replicator::{Direction, ReplicationMode, ReplicationStats, Replicator, replication_id};
