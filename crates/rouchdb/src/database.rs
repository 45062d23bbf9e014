use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rouchdb_adapter_http::HttpAdapter;
use rouchdb_adapter_memory::MemoryAdapter;
use rouchdb_adapter_redb::RedbAdapter;
use rouchdb_changes::{ChangesHandle, ChangesStreamOptions};
use rouchdb_core::adapter::Adapter;
use rouchdb_core::config::DatabaseConfig;
use rouchdb_core::document::{
    AllDocsOptions, AllDocsResponse, BulkDocsOptions, ChangeEvent, ChangesOptions, ChangesResponse, DbInfo,
    DocResult, Document, GetOptions, Revision,
};
use rouchdb_core::error::Result;
use rouchdb_replication::{Direction, ReplicationMode, ReplicationStats, Replicator};

use crate::cache::DocCache;
use crate::query::{self, FindOptions, FindResponse};

/// The outcome of one leg of a [`Database::sync`] (push or pull). `ok` is
/// always `true` on return — a failed leg surfaces as `Err` instead, the
/// same way a CouchDB replication task reports `"state": "crashing"`
/// rather than a half-filled stats object. Derefs to [`ReplicationStats`]
/// so `outcome.docs_written` reads the same as the lower-level type.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub ok: bool,
    pub stats: ReplicationStats,
}

impl std::ops::Deref for ReplicationOutcome {
    type Target = ReplicationStats;

    fn deref(&self) -> &ReplicationStats {
        &self.stats
    }
}

/// Per-call overrides for [`Database::replicate_to_with_opts`] /
/// [`Database::replicate_from_with_opts`]; anything left at its default
/// falls back to the database's own [`DatabaseConfig`].
///
/// `filter`/`filter_params`/`doc_ids` restrict which revisions the session
/// carries and, since two sessions against the same peer/direction with
/// different filters or allowlists must not share a checkpoint, also feed
/// into [`rouchdb_replication::replicator::replication_id`].
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    pub batch_size: usize,
    pub fetch_fanout: usize,
    pub filter: Option<String>,
    pub filter_params: std::collections::HashMap<String, String>,
    pub doc_ids: Option<Vec<String>>,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self { batch_size: 100, fetch_fanout: 4, filter: None, filter_params: Default::default(), doc_ids: None }
    }
}

impl ReplicationOptions {
    fn apply(&self, mut config: DatabaseConfig) -> DatabaseConfig {
        config.replicator_batch_size = self.batch_size;
        config.replicator_fetch_fanout = self.fetch_fanout;
        config
    }
}

/// A single local-first document database.
///
/// Pick a backing adapter with [`Database::memory`], [`Database::open`]
/// (redb, persisted to one file), or [`Database::http`] (a remote
/// CouchDB/RouchDB server), then drive it with the CRUD, query, and
/// replication methods below. Every method here is a thin wrapper over the
/// `Adapter` trait and the `rouchdb-query`/`rouchdb-replication` crates;
/// [`Database::adapter`] exposes the underlying adapter directly for
/// anything this facade doesn't cover.
pub struct Database {
    adapter: Arc<dyn Adapter>,
    config: DatabaseConfig,
    cache: DocCache,
}

impl Database {
    /// An ephemeral, process-local database. Gone when the process exits.
    pub fn memory(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            adapter: Arc::new(MemoryAdapter::new(name.clone())),
            config: DatabaseConfig::new(name),
            cache: DocCache::new(),
        }
    }

    /// A database persisted to a single redb file at `path`, created if it
    /// doesn't already exist.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let adapter = RedbAdapter::open(name.clone(), path)?;
        Ok(Self { adapter: Arc::new(adapter), config: DatabaseConfig::new(name), cache: DocCache::new() })
    }

    /// A database reached over the CouchDB HTTP API at `url` — the full
    /// path including the database name, e.g. `http://host:5984/mydb`.
    pub fn http(url: impl Into<String>) -> Self {
        let adapter = HttpAdapter::new(url);
        let name = adapter.name().to_string();
        Self { adapter: Arc::new(adapter), config: DatabaseConfig::new(name), cache: DocCache::new() }
    }

    /// The underlying storage adapter, for operations (attachments, raw
    /// `bulk_docs`, `revision_history`, ...) this facade doesn't wrap.
    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub async fn info(&self) -> Result<DbInfo> {
        self.adapter.info().await
    }

    /// Fetch the current winning revision of `id`.
    pub async fn get(&self, id: &str) -> Result<Document> {
        self.adapter.get(id, GetOptions::default()).await
    }

    /// [`Database::get`], with explicit options (`rev`, `conflicts`, ...).
    pub async fn get_with_opts(&self, id: &str, opts: GetOptions) -> Result<Document> {
        self.adapter.get(id, opts).await
    }

    /// [`Database::get`], through the weak-reference document cache: a
    /// repeat call for an unchanged revision reuses the previous
    /// allocation instead of cloning a fresh one out of the adapter.
    pub async fn get_cached(&self, id: &str) -> Result<Arc<Document>> {
        self.cache.get(self.adapter.as_ref(), id).await
    }

    /// Drop every cached document. The next [`Database::get_cached`] call
    /// for any id re-fetches and re-populates it.
    pub fn clear_document_cache(&self) {
        self.cache.clear();
    }

    /// Create a new document. Fails with a conflict if `id` already exists.
    pub async fn put(&self, id: impl Into<String>, data: serde_json::Value) -> Result<DocResult> {
        self.write(id, None, false, data).await
    }

    /// Update an existing document; `rev` must name its current winning
    /// revision or this fails with a conflict.
    pub async fn update(&self, id: impl Into<String>, rev: &str, data: serde_json::Value) -> Result<DocResult> {
        self.write(id, Some(rev.parse::<Revision>()?), false, data).await
    }

    /// Tombstone a document at `rev`; `rev` must name its current winning
    /// revision.
    pub async fn remove(&self, id: impl Into<String>, rev: &str) -> Result<DocResult> {
        self.write(id, Some(rev.parse::<Revision>()?), true, serde_json::json!({})).await
    }

    async fn write(
        &self,
        id: impl Into<String>,
        rev: Option<Revision>,
        deleted: bool,
        data: serde_json::Value,
    ) -> Result<DocResult> {
        let doc = Document { id: id.into(), rev, deleted, data, attachments: Default::default(), revisions: None };
        let mut results = self.adapter.bulk_docs(vec![doc], BulkDocsOptions::new()).await?;
        Ok(results.remove(0))
    }

    pub async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        self.adapter.all_docs(opts).await
    }

    pub async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        self.adapter.changes(opts).await
    }

    /// Start a live changes feed: an initial catch-up batch followed by
    /// newly-written documents, polled at `opts.poll_interval`.
    /// `handle.cancel()` (or dropping the handle) stops the background task.
    pub fn live_changes(&self, opts: ChangesStreamOptions) -> (mpsc::Receiver<ChangeEvent>, ChangesHandle) {
        rouchdb_changes::live_changes(self.adapter.clone(), opts)
    }

    /// Prune revision-tree branches below `compaction_depth` generations
    /// and sweep unreferenced attachment blobs.
    pub async fn compact(&self) -> Result<()> {
        self.adapter.compact(self.config.compaction_depth).await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.adapter.destroy().await
    }

    /// A Mango-style `find` query over every current document.
    pub async fn find(&self, opts: FindOptions) -> Result<FindResponse> {
        rouchdb_query::find(self.adapter.as_ref(), query::lower_find_options(opts)).await
    }

    /// Push this database's changes to `other` (one-shot).
    pub async fn replicate_to(&self, other: &Database) -> Result<ReplicationOutcome> {
        self.run_replication(other, Direction::Push, self.config.clone(), &ReplicationOptions::default()).await
    }

    /// Pull `other`'s changes into this database (one-shot).
    pub async fn replicate_from(&self, other: &Database) -> Result<ReplicationOutcome> {
        self.run_replication(other, Direction::Pull, self.config.clone(), &ReplicationOptions::default()).await
    }

    /// [`Database::replicate_to`], overriding batch size / fetch fan-out
    /// and optionally restricting to a named filter and/or doc allowlist
    /// for this call only.
    pub async fn replicate_to_with_opts(&self, other: &Database, opts: ReplicationOptions) -> Result<ReplicationOutcome> {
        self.run_replication(other, Direction::Push, opts.apply(self.config.clone()), &opts).await
    }

    /// [`Database::replicate_from`], overriding batch size / fetch
    /// fan-out and optionally restricting to a named filter and/or doc
    /// allowlist for this call only.
    pub async fn replicate_from_with_opts(&self, other: &Database, opts: ReplicationOptions) -> Result<ReplicationOutcome> {
        self.run_replication(other, Direction::Pull, opts.apply(self.config.clone()), &opts).await
    }

    /// Push, then pull: the two one-shot replications a bidirectional
    /// CouchDB sync is conventionally set up as.
    pub async fn sync(&self, other: &Database) -> Result<(ReplicationOutcome, ReplicationOutcome)> {
        let push = self.replicate_to(other).await?;
        let pull = self.replicate_from(other).await?;
        Ok((push, pull))
    }

    async fn run_replication(
        &self,
        other: &Database,
        direction: Direction,
        config: DatabaseConfig,
        opts: &ReplicationOptions,
    ) -> Result<ReplicationOutcome> {
        let mut replicator =
            Replicator::new(other.adapter.clone(), self.adapter.clone(), direction, ReplicationMode::OneShot, config);
        if let Some(filter) = &opts.filter {
            replicator = replicator.with_filter(filter.clone(), opts.filter_params.clone());
        }
        if let Some(doc_ids) = &opts.doc_ids {
            replicator = replicator.with_doc_ids(doc_ids.clone());
        }
        let stats = replicator.run(CancellationToken::new()).await?;
        Ok(ReplicationOutcome { ok: true, stats })
    }
}
