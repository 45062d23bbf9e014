//! RouchDB: an embedded, single-node document database with CouchDB-wire
//! compatible multi-master replication.
//!
//! [`Database`] is the single entry point: pick a storage backend with
//! [`Database::memory`] (ephemeral), [`Database::open`] (redb, persisted to
//! one file), or [`Database::http`] (a remote CouchDB/RouchDB server), then
//! `put`/`get`/`changes`/`find`/`replicate_to`/`sync` against it. The
//! lower-level crates this facade composes — `rouchdb-core`,
//! `rouchdb-query`, `rouchdb-views`, `rouchdb-changes`,
//! `rouchdb-replication` — stay independently usable for callers who want
//! the pieces without the facade; [`views`] re-exports the persistent-view
//! crate under its own namespace since its `ViewQueryOptions`/`ViewResults`
//! would otherwise collide with the ad hoc ones here.
mod cache;
mod database;
mod query;

pub use cache::DocCache;
pub use database::{Database, ReplicationOptions, ReplicationOutcome};
pub use query::{FindOptions, FindResponse, ReduceFn, SortField, ViewMapFn, ViewQueryOptions, ViewResults, ViewRow, query_view};

pub use rouchdb_changes::{ChangesHandle, ChangesStreamOptions};
pub use rouchdb_core::adapter::{Adapter, FilterFn, ValidationContext, ValidationFn};
pub use rouchdb_core::config::DatabaseConfig;
pub use rouchdb_core::document::{
    AllDocsOptions, AllDocsResponse, AttachmentMeta, ChangeEvent, ChangesOptions, ChangesResponse, DbInfo,
    DocResult, Document, GetAttachmentOptions, GetOptions, PutResponse, Revision, RevisionHistory, Seq,
};
pub use rouchdb_core::error::RouchError;
pub use rouchdb_replication::ReplicationStats;

/// Persistent, incrementally-maintained named views — CouchDB design
/// document views, as opposed to this crate's ad hoc [`query_view`].
pub mod views {
    pub use rouchdb_views::{IndexedRow, MapFn, MemoryViewIndexStore, View, ViewIndexStore, ViewQueryOptions, ViewRegistry, ViewResults};
}

/// This crate's `Result`, for callers who want the alias without reaching
/// into `rouchdb-core` directly.
pub type Result<T> = rouchdb_core::error::Result<T>;
