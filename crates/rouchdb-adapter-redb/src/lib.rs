//! Persistent, single-file `Adapter` over `redb`.
//!
//! Same revision-tree contract as `rouchdb-adapter-memory`, but every
//! document's metadata, bodies, and attachment blobs live in on-disk redb
//! tables instead of `HashMap`s — durable across process restarts, without
//! a background compaction thread (callers drive `compact` explicitly, the
//! way CouchDB's `_compact` endpoint is invoked out of band).
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use md5::{Digest, Md5};
use redb::{Database, ReadableTable, TableDefinition};

use rouchdb_core::adapter::{Adapter, FilterFn, ValidationContext, ValidationFn};
use rouchdb_core::document::*;
use rouchdb_core::error::{Result, RouchError};
use rouchdb_core::merge;
use rouchdb_core::rev_tree::{self, NodeOpts, RevStatus, RevTree};
use rouchdb_core::selector;

const SCHEMA_VERSION: u32 = 1;

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("doc_meta");
const BODIES: TableDefinition<&str, &[u8]> = TableDefinition::new("bodies");
const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");
const SEQ_LOG: TableDefinition<u64, &str> = TableDefinition::new("seq_log");
const LOCAL: TableDefinition<&str, &[u8]> = TableDefinition::new("local_docs");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SCHEMA: TableDefinition<&str, u32> = TableDefinition::new("schema");

fn db_err(e: impl std::fmt::Display) -> RouchError {
    RouchError::DatabaseError(e.to_string())
}

fn body_key(id: &str, rev: &str) -> String {
    format!("{id}\u{0}{rev}")
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedMeta {
    rev_tree: RevTree,
    seq: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredRevision {
    data: serde_json::Value,
    attachments: HashMap<String, AttachmentMeta>,
    deleted: bool,
}

fn blob_digest(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("md5-{}", BASE64.encode(hasher.finalize()))
}

fn vec_of_chain(parent: Option<&Revision>, leaf: &Revision) -> Vec<String> {
    match parent {
        Some(p) => vec![leaf.hash.clone(), p.hash.clone()],
        None => vec![leaf.hash.clone()],
    }
}

fn error_kind(e: &RouchError) -> String {
    match e {
        RouchError::NotFound(_) => "not_found".into(),
        RouchError::Conflict => "conflict".into(),
        RouchError::BadRequest(_) => "bad_request".into(),
        RouchError::Unauthorized => "unauthorized".into(),
        RouchError::Forbidden(_) => "forbidden".into(),
        RouchError::InvalidRev(_) => "bad_request".into(),
        RouchError::MissingId => "bad_request".into(),
        RouchError::DatabaseExists(_) => "file_exists".into(),
        RouchError::DatabaseError(_) => "internal_error".into(),
        RouchError::Io(_) => "internal_error".into(),
        RouchError::Json(_) => "bad_request".into(),
        RouchError::Codec(_) => "bad_request".into(),
        RouchError::Upstream { .. } => "upstream_error".into(),
        RouchError::Cancelled => "cancelled".into(),
    }
}

fn build_document(id: &str, rev: &Revision, stored: &StoredRevision, tree: &RevTree, opts: &GetOptions) -> Document {
    let mut data = stored.data.clone();
    if opts.conflicts {
        let conflicts = merge::collect_conflicts(tree);
        if !conflicts.is_empty()
            && let Some(obj) = data.as_object_mut()
        {
            obj.insert(
                "_conflicts".into(),
                serde_json::Value::Array(conflicts.iter().map(|r| serde_json::Value::String(r.to_string())).collect()),
            );
        }
    }

    let revisions = if opts.revs {
        rev_tree::revision_history(tree, rev.pos, &rev.hash)
            .map(|chain| RevisionHistory { start: rev.pos, ids: chain.into_iter().map(|r| r.hash).collect() })
    } else {
        None
    };

    Document {
        id: id.to_string(),
        rev: Some(rev.clone()),
        deleted: stored.deleted,
        data,
        attachments: stored.attachments.clone(),
        revisions,
    }
}

fn all_revids(tree: &RevTree) -> HashSet<String> {
    fn walk(node: &rouchdb_core::rev_tree::RevNode, pos: u64, out: &mut HashSet<String>) {
        out.insert(format!("{}-{}", pos, node.hash));
        for child in &node.children {
            walk(child, pos + 1, out);
        }
    }
    let mut out = HashSet::new();
    for path in tree {
        walk(&path.tree, path.pos, &mut out);
    }
    out
}

/// A `redb`-backed, on-disk `Adapter`.
pub struct RedbAdapter {
    name: String,
    db: Arc<Database>,
    validations: std::sync::RwLock<Vec<Arc<dyn ValidationFn>>>,
    filters: std::sync::RwLock<HashMap<String, Arc<dyn FilterFn>>>,
}

impl RedbAdapter {
    /// Open (creating if absent) the redb file at `path` as database `name`.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(db_err)?;
        Self::init_schema(&db)?;
        Ok(Self {
            name: name.into(),
            db: Arc::new(db),
            validations: std::sync::RwLock::new(Vec::new()),
            filters: std::sync::RwLock::new(HashMap::new()),
        })
    }

    fn init_schema(db: &Database) -> Result<()> {
        let txn = db.begin_write().map_err(db_err)?;
        {
            let mut schema = txn.open_table(SCHEMA).map_err(db_err)?;
            if schema.get("version").map_err(db_err)?.is_none() {
                schema.insert("version", SCHEMA_VERSION).map_err(db_err)?;
            }
            let mut counters = txn.open_table(COUNTERS).map_err(db_err)?;
            if counters.get("next_seq").map_err(db_err)?.is_none() {
                counters.insert("next_seq", 1u64).map_err(db_err)?;
            }
            txn.open_table(META).map_err(db_err)?;
            txn.open_table(BODIES).map_err(db_err)?;
            txn.open_table(BLOBS).map_err(db_err)?;
            txn.open_table(SEQ_LOG).map_err(db_err)?;
            txn.open_table(LOCAL).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn register_validation<F: ValidationFn + 'static>(&self, f: F) {
        self.validations.write().unwrap().push(Arc::new(f));
    }

    /// Register a named filter predicate, selectable from `_changes`/
    /// replication via `ChangesOptions.filter`.
    pub fn register_filter<F: FilterFn + 'static>(&self, name: impl Into<String>, f: F) {
        self.filters.write().unwrap().insert(name.into(), Arc::new(f));
    }

    async fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await.map_err(db_err)?
    }
}

// ---------------------------------------------------------------------------
// Transaction bodies — one write transaction per `bulk_docs` entry, matching
// CouchDB's per-revision atomicity (a batch can partially succeed).
// ---------------------------------------------------------------------------

fn load_meta(db: &Database, id: &str) -> Result<Option<PersistedMeta>> {
    let txn = db.begin_read().map_err(db_err)?;
    let table = txn.open_table(META).map_err(db_err)?;
    match table.get(id).map_err(db_err)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value()).map_err(db_err)?)),
        None => Ok(None),
    }
}

fn load_body(db: &Database, id: &str, rev: &str) -> Result<Option<StoredRevision>> {
    let txn = db.begin_read().map_err(db_err)?;
    let table = txn.open_table(BODIES).map_err(db_err)?;
    match table.get(body_key(id, rev).as_str()).map_err(db_err)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value()).map_err(db_err)?)),
        None => Ok(None),
    }
}

fn link_attachments(
    db: &Database,
    id: &str,
    generation: u64,
    incoming: &HashMap<String, AttachmentMeta>,
    parent: Option<&Revision>,
) -> Result<HashMap<String, AttachmentMeta>> {
    let txn = db.begin_write().map_err(db_err)?;
    let mut result = HashMap::new();
    {
        let mut blobs = txn.open_table(BLOBS).map_err(db_err)?;
        let bodies = txn.open_table(BODIES).map_err(db_err)?;

        for (name, meta) in incoming {
            if let Some(bytes) = &meta.data {
                let digest = blob_digest(bytes);
                if blobs.get(digest.as_str()).map_err(db_err)?.is_none() {
                    blobs.insert(digest.as_str(), bytes.as_slice()).map_err(db_err)?;
                }
                result.insert(
                    name.clone(),
                    AttachmentMeta {
                        content_type: meta.content_type.clone(),
                        digest,
                        length: bytes.len() as u64,
                        stub: true,
                        data: None,
                        rev_pos: generation,
                        encoding: meta.encoding.clone(),
                        encoded_length: meta.encoded_length,
                    },
                );
                continue;
            }

            if meta.stub
                && let Some(parent_rev) = parent
                && let Some(carried) = bodies
                    .get(body_key(id, &parent_rev.to_string()).as_str())
                    .map_err(db_err)?
                    .map(|bytes| serde_json::from_slice::<StoredRevision>(bytes.value()))
                    .transpose()
                    .map_err(db_err)?
                    .and_then(|stored| stored.attachments.get(name).cloned())
            {
                result.insert(name.clone(), carried);
                continue;
            }

            result.insert(name.clone(), meta.clone());
        }
    }
    txn.commit().map_err(db_err)?;
    Ok(result)
}

fn take_seq(db: &Database) -> Result<u64> {
    let txn = db.begin_write().map_err(db_err)?;
    let seq = {
        let mut counters = txn.open_table(COUNTERS).map_err(db_err)?;
        let seq = counters.get("next_seq").map_err(db_err)?.map(|v| v.value()).unwrap_or(1);
        counters.insert("next_seq", seq + 1).map_err(db_err)?;
        seq
    };
    txn.commit().map_err(db_err)?;
    Ok(seq)
}

fn save_meta(db: &Database, id: &str, meta: &PersistedMeta) -> Result<()> {
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut table = txn.open_table(META).map_err(db_err)?;
        let bytes = serde_json::to_vec(meta).map_err(db_err)?;
        table.insert(id, bytes.as_slice()).map_err(db_err)?;
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}

fn save_body(db: &Database, id: &str, rev: &str, stored: &StoredRevision) -> Result<()> {
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut table = txn.open_table(BODIES).map_err(db_err)?;
        let bytes = serde_json::to_vec(stored).map_err(db_err)?;
        table.insert(body_key(id, rev).as_str(), bytes.as_slice()).map_err(db_err)?;
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}

fn log_seq(db: &Database, seq: u64, id: &str) -> Result<()> {
    let txn = db.begin_write().map_err(db_err)?;
    {
        let mut table = txn.open_table(SEQ_LOG).map_err(db_err)?;
        table.insert(seq, id).map_err(db_err)?;
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}

fn put_new_edit(db: &Database, id_in: &str, doc: &Document, validations: &[Arc<dyn ValidationFn>]) -> Result<DocResult> {
    let id = if id_in.is_empty() { uuid::Uuid::new_v4().to_string() } else { id_in.to_string() };

    let mut meta = load_meta(db, &id)?.unwrap_or(PersistedMeta { rev_tree: Vec::new(), seq: 0 });
    let leaves = rev_tree::collect_leaves(&meta.rev_tree);
    let current_winner = leaves.first().cloned();

    let current_doc = match &current_winner {
        Some(w) => load_body(db, &id, &format!("{}-{}", w.pos, w.hash))?.map(|stored| Document {
            id: id.clone(),
            rev: Some(Revision::new(w.pos, w.hash.clone())),
            deleted: w.deleted,
            data: stored.data,
            attachments: stored.attachments,
            revisions: None,
        }),
        None => None,
    };

    match (&current_winner, &doc.rev) {
        (None, None) => {}
        (None, Some(_)) => return Err(RouchError::Conflict),
        (Some(winner), None) => {
            if !winner.deleted {
                return Err(RouchError::Conflict);
            }
        }
        (Some(winner), Some(parent)) => {
            if parent.pos != winner.pos || parent.hash != winner.hash {
                return Err(RouchError::Conflict);
            }
        }
    }

    let parent = doc.rev.clone().filter(|_| current_winner.is_some());

    let mut ctx = ValidationContext::new(current_doc.as_ref(), doc);
    for validation in validations {
        validation.validate(&mut ctx)?;
    }

    let generation = parent.as_ref().map(|p| p.pos + 1).unwrap_or(1);
    let hash = merge::compute_rev_hash(&doc.data, doc.deleted, parent.as_ref());
    let new_rev = Revision::new(generation, hash);

    let attachments = link_attachments(db, &id, generation, &doc.attachments, parent.as_ref())?;

    let new_path = rev_tree::build_path_with_statuses(
        generation,
        &vec_of_chain(parent.as_ref(), &new_rev),
        NodeOpts { deleted: doc.deleted },
        RevStatus::Available,
        &[],
    );
    let (merged, _) = merge::merge_tree(&meta.rev_tree, &new_path, 0);
    meta.rev_tree = merged;

    let seq = take_seq(db)?;
    meta.seq = seq;
    log_seq(db, seq, &id)?;
    save_meta(db, &id, &meta)?;
    save_body(db, &id, &new_rev.to_string(), &StoredRevision { data: doc.data.clone(), attachments, deleted: doc.deleted })?;

    Ok(DocResult { ok: true, id, rev: Some(new_rev.to_string()), error: None, reason: None })
}

fn force_insert(db: &Database, doc: &Document) -> Result<DocResult> {
    let history = doc
        .revisions
        .as_ref()
        .ok_or_else(|| RouchError::BadRequest("force-insert requires _revisions".into()))?;
    if history.ids.is_empty() {
        return Err(RouchError::BadRequest("empty _revisions.ids".into()));
    }
    let id = doc.id.clone();
    if id.is_empty() {
        return Err(RouchError::MissingId);
    }

    let mut meta = load_meta(db, &id)?.unwrap_or(PersistedMeta { rev_tree: Vec::new(), seq: 0 });
    let leaf_rev = Revision::new(history.start, history.ids[0].clone());

    if let Some(existing) = load_body(db, &id, &leaf_rev.to_string())? {
        if existing.data == doc.data && existing.deleted == doc.deleted {
            return Ok(DocResult { ok: true, id, rev: Some(leaf_rev.to_string()), error: None, reason: None });
        }
        return Err(RouchError::Conflict);
    }

    let mut ancestor_statuses = Vec::new();
    let mut pos = history.start - (history.ids.len() as u64 - 1);
    for hash in history.ids.iter().skip(1).rev() {
        let status = if rev_tree::find_node(&meta.rev_tree, pos, hash).is_some() {
            RevStatus::Available
        } else {
            RevStatus::Missing
        };
        ancestor_statuses.push(status);
        pos += 1;
    }

    let parent_rev =
        if history.ids.len() > 1 { Some(Revision::new(history.start - 1, history.ids[1].clone())) } else { None };

    let new_path = rev_tree::build_path_with_statuses(
        history.start,
        &history.ids,
        NodeOpts { deleted: doc.deleted },
        RevStatus::Available,
        &ancestor_statuses,
    );
    let (merged, _) = merge::merge_tree(&meta.rev_tree, &new_path, 0);
    meta.rev_tree = merged;

    let attachments = link_attachments(db, &id, history.start, &doc.attachments, parent_rev.as_ref())?;

    let seq = take_seq(db)?;
    meta.seq = seq;
    log_seq(db, seq, &id)?;
    save_meta(db, &id, &meta)?;
    save_body(db, &id, &leaf_rev.to_string(), &StoredRevision { data: doc.data.clone(), attachments, deleted: doc.deleted })?;

    Ok(DocResult { ok: true, id, rev: Some(leaf_rev.to_string()), error: None, reason: None })
}

#[async_trait]
impl Adapter for RedbAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<DbInfo> {
        let name = self.name.clone();
        self.with_db(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let meta_table = txn.open_table(META).map_err(db_err)?;
            let counters = txn.open_table(COUNTERS).map_err(db_err)?;
            let mut doc_count = 0u64;
            for entry in meta_table.iter().map_err(db_err)? {
                let (_, bytes) = entry.map_err(db_err)?;
                let meta: PersistedMeta = serde_json::from_slice(bytes.value()).map_err(db_err)?;
                if let Some(winner) = rev_tree::collect_leaves(&meta.rev_tree).first()
                    && !winner.deleted
                {
                    doc_count += 1;
                }
            }
            let next_seq = counters.get("next_seq").map_err(db_err)?.map(|v| v.value()).unwrap_or(1);
            Ok(DbInfo { db_name: name, doc_count, update_seq: Seq::Num(next_seq.saturating_sub(1)) })
        })
        .await
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let id = id.to_string();
        self.with_db(move |db| {
            let meta = load_meta(db, &id)?.ok_or_else(|| RouchError::NotFound(id.clone()))?;
            let rev = match &opts.rev {
                Some(s) => s.parse::<Revision>()?,
                None => {
                    let winner = rev_tree::collect_leaves(&meta.rev_tree)
                        .into_iter()
                        .next()
                        .ok_or_else(|| RouchError::NotFound(id.clone()))?;
                    if winner.deleted && opts.open_revs.is_none() {
                        return Err(RouchError::NotFound(id.clone()));
                    }
                    Revision::new(winner.pos, winner.hash)
                }
            };
            let stored = load_body(db, &id, &rev.to_string())?
                .ok_or_else(|| RouchError::NotFound(format!("{}@{}", id, rev)))?;
            Ok(build_document(&id, &rev, &stored, &meta.rev_tree, &opts))
        })
        .await
    }

    async fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Result<Vec<DocResult>> {
        let validations: Vec<Arc<dyn ValidationFn>> = self.validations.read().unwrap().clone();
        self.with_db(move |db| {
            let mut results = Vec::with_capacity(docs.len());
            for doc in docs {
                let id = doc.id.clone();
                let outcome =
                    if opts.new_edits { put_new_edit(db, &id, &doc, &validations) } else { force_insert(db, &doc) };
                results.push(outcome.unwrap_or_else(|e| DocResult {
                    ok: false,
                    id,
                    rev: None,
                    error: Some(error_kind(&e)),
                    reason: Some(e.to_string()),
                }));
            }
            Ok(results)
        })
        .await
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        self.with_db(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let meta_table = txn.open_table(META).map_err(db_err)?;
            let bodies_table = txn.open_table(BODIES).map_err(db_err)?;

            let mut entries: Vec<(String, Revision, PersistedMeta)> = Vec::new();
            for entry in meta_table.iter().map_err(db_err)? {
                let (id_guard, bytes) = entry.map_err(db_err)?;
                let id = id_guard.value().to_string();
                let meta: PersistedMeta = serde_json::from_slice(bytes.value()).map_err(db_err)?;
                if let Some(winner) = rev_tree::collect_leaves(&meta.rev_tree).into_iter().next()
                    && !winner.deleted
                {
                    entries.push((id, Revision::new(winner.pos, winner.hash), meta));
                }
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            if opts.descending {
                entries.reverse();
            }

            if let Some(key) = &opts.key {
                entries.retain(|(id, ..)| id == key);
            }
            if let Some(keys) = &opts.keys {
                entries.retain(|(id, ..)| keys.contains(id));
            }
            if let Some(start) = &opts.start_key {
                entries.retain(|(id, ..)| if opts.descending { id <= start } else { id >= start });
            }
            if let Some(end) = &opts.end_key {
                entries.retain(|(id, ..)| {
                    let within = if opts.descending { id >= end } else { id <= end };
                    within && (opts.inclusive_end || id != end)
                });
            }

            let total_rows = entries.len() as u64;
            let skip = opts.skip as usize;
            let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
            let mut rows = Vec::new();
            for (id, rev, meta) in entries.into_iter().skip(skip).take(limit) {
                let doc = if opts.include_docs {
                    bodies_table
                        .get(body_key(&id, &rev.to_string()).as_str())
                        .map_err(db_err)?
                        .map(|bytes| -> Result<serde_json::Value> {
                            let stored: StoredRevision = serde_json::from_slice(bytes.value()).map_err(db_err)?;
                            Ok(build_document(&id, &rev, &stored, &meta.rev_tree, &GetOptions::default()).to_json())
                        })
                        .transpose()?
                } else {
                    None
                };
                rows.push(AllDocsRow { id: id.clone(), key: id, value: AllDocsRowValue { rev: rev.to_string(), deleted: None }, doc });
            }

            Ok(AllDocsResponse { total_rows, offset: skip as u64, rows })
        })
        .await
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let filter = match &opts.filter {
            Some(name) => Some(
                self.filters
                    .read()
                    .unwrap()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| RouchError::NotFound(format!("filter function {name} is not registered")))?,
            ),
            None => None,
        };
        self.with_db(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let seq_table = txn.open_table(SEQ_LOG).map_err(db_err)?;
            let meta_table = txn.open_table(META).map_err(db_err)?;
            let bodies_table = txn.open_table(BODIES).map_err(db_err)?;

            let since = opts.since.as_num();
            let mut latest_seq_for_doc: HashMap<String, u64> = HashMap::new();
            for entry in seq_table.range((since + 1)..).map_err(db_err)? {
                let (seq_guard, id_guard) = entry.map_err(db_err)?;
                latest_seq_for_doc.insert(id_guard.value().to_string(), seq_guard.value());
            }
            let mut rows: Vec<(u64, String)> = latest_seq_for_doc.into_iter().map(|(id, seq)| (seq, id)).collect();
            rows.sort_by_key(|(seq, _)| *seq);
            if opts.descending {
                rows.reverse();
            }

            let mut results = Vec::new();
            for (seq, docid) in rows {
                if let Some(doc_ids) = &opts.doc_ids
                    && !doc_ids.contains(&docid)
                {
                    continue;
                }
                let Some(bytes) = meta_table.get(docid.as_str()).map_err(db_err)? else { continue };
                let meta: PersistedMeta = serde_json::from_slice(bytes.value()).map_err(db_err)?;
                let leaves = rev_tree::collect_leaves(&meta.rev_tree);
                let Some(winner) = leaves.first() else { continue };
                let winner_rev = Revision::new(winner.pos, winner.hash.clone());
                let Some(body_bytes) = bodies_table.get(body_key(&docid, &winner_rev.to_string()).as_str()).map_err(db_err)? else {
                    continue;
                };
                let stored: StoredRevision = serde_json::from_slice(body_bytes.value()).map_err(db_err)?;

                if let Some(selector) = &opts.selector
                    && !selector::matches(&stored.data, selector)
                {
                    continue;
                }

                let full_doc = (filter.is_some() || opts.include_docs)
                    .then(|| build_document(&docid, &winner_rev, &stored, &meta.rev_tree, &GetOptions::default()));

                if let Some(filter) = &filter
                    && !filter.include(full_doc.as_ref().unwrap(), &opts.filter_params)
                {
                    continue;
                }

                let changes = if opts.include_conflicts {
                    leaves.iter().map(|l| ChangeRev { rev: format!("{}-{}", l.pos, l.hash) }).collect()
                } else {
                    vec![ChangeRev { rev: winner_rev.to_string() }]
                };

                let doc = if opts.include_docs { Some(full_doc.unwrap().to_json()) } else { None };

                results.push(ChangeEvent { seq: Seq::Num(seq), id: docid, changes, deleted: winner.deleted, doc });

                if let Some(limit) = opts.limit
                    && results.len() as u64 >= limit
                {
                    break;
                }
            }

            let last_seq = results.last().map(|e| e.seq.clone()).unwrap_or(opts.since);
            Ok(ChangesResponse { results, last_seq })
        })
        .await
    }

    async fn revs_diff(&self, revs: HashMap<String, Vec<String>>) -> Result<RevsDiffResponse> {
        self.with_db(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let meta_table = txn.open_table(META).map_err(db_err)?;
            let mut results = HashMap::new();
            for (docid, rev_strs) in revs {
                let mut missing = Vec::new();
                match meta_table.get(docid.as_str()).map_err(db_err)? {
                    Some(bytes) => {
                        let meta: PersistedMeta = serde_json::from_slice(bytes.value()).map_err(db_err)?;
                        for r in &rev_strs {
                            let found = r
                                .parse::<Revision>()
                                .ok()
                                .is_some_and(|rev| rev_tree::find_node(&meta.rev_tree, rev.pos, &rev.hash).is_some());
                            if !found {
                                missing.push(r.clone());
                            }
                        }
                    }
                    None => missing = rev_strs,
                }
                if !missing.is_empty() {
                    results.insert(docid, RevsDiffResult { missing, possible_ancestors: vec![] });
                }
            }
            Ok(RevsDiffResponse { results })
        })
        .await
    }

    async fn bulk_get(&self, items: Vec<BulkGetItem>) -> Result<BulkGetResponse> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let opts = GetOptions { rev: item.rev.clone(), revs: true, ..Default::default() };
            let doc = match self.get(&item.id, opts).await {
                Ok(doc) => BulkGetDoc { ok: Some(doc.to_json_with(true)), error: None },
                Err(e) => BulkGetDoc {
                    ok: None,
                    error: Some(BulkGetError {
                        id: item.id.clone(),
                        rev: item.rev.clone().unwrap_or_default(),
                        error: error_kind(&e),
                        reason: e.to_string(),
                    }),
                },
            };
            results.push(BulkGetResult { id: item.id, docs: vec![doc] });
        }
        Ok(BulkGetResponse { results })
    }

    async fn revision_history(&self, id: &str, rev: &str) -> Result<Vec<String>> {
        let id = id.to_string();
        let r: Revision = rev.parse()?;
        self.with_db(move |db| {
            let meta = load_meta(db, &id)?.ok_or_else(|| RouchError::NotFound(id.clone()))?;
            let chain = rev_tree::revision_history(&meta.rev_tree, r.pos, &r.hash)
                .ok_or_else(|| RouchError::NotFound(format!("{}@{}", id, r)))?;
            Ok(chain.into_iter().map(|rv| rv.hash).collect())
        })
        .await
    }

    async fn put_attachment(&self, docid: &str, name: &str, rev: &str, data: Vec<u8>, content_type: &str) -> Result<PutResponse> {
        let validations: Vec<Arc<dyn ValidationFn>> = self.validations.read().unwrap().clone();
        let docid = docid.to_string();
        let name = name.to_string();
        let rev = rev.to_string();
        let content_type = content_type.to_string();
        self.with_db(move |db| {
            let existing = load_meta(db, &docid)?;
            let (parent, base_data, mut attachments) = match &existing {
                Some(meta) => {
                    let winner = rev_tree::collect_leaves(&meta.rev_tree)
                        .into_iter()
                        .next()
                        .ok_or_else(|| RouchError::NotFound(docid.clone()))?;
                    let parent = Revision::new(winner.pos, winner.hash.clone());
                    if parent.to_string() != rev {
                        return Err(RouchError::Conflict);
                    }
                    let stored = load_body(db, &docid, &parent.to_string())?.ok_or_else(|| RouchError::NotFound(docid.clone()))?;
                    (Some(parent), stored.data, stored.attachments)
                }
                None => (None, serde_json::json!({}), HashMap::new()),
            };

            attachments.insert(
                name.clone(),
                AttachmentMeta {
                    content_type,
                    digest: String::new(),
                    length: 0,
                    stub: false,
                    data: Some(data),
                    rev_pos: 0,
                    encoding: None,
                    encoded_length: None,
                },
            );

            let doc = Document { id: docid.clone(), rev: parent, deleted: false, data: base_data, attachments, revisions: None };
            let result = put_new_edit(db, &docid, &doc, &validations)?;
            Ok(PutResponse { ok: true, id: docid, rev: result.rev.unwrap() })
        })
        .await
    }

    async fn get_attachment(&self, docid: &str, name: &str, opts: GetAttachmentOptions) -> Result<Vec<u8>> {
        let docid = docid.to_string();
        let name = name.to_string();
        self.with_db(move |db| {
            let meta = load_meta(db, &docid)?.ok_or_else(|| RouchError::NotFound(docid.clone()))?;
            let rev = match &opts.rev {
                Some(r) => r.parse::<Revision>()?,
                None => {
                    let winner = rev_tree::collect_leaves(&meta.rev_tree)
                        .into_iter()
                        .next()
                        .ok_or_else(|| RouchError::NotFound(docid.clone()))?;
                    Revision::new(winner.pos, winner.hash)
                }
            };
            let stored = load_body(db, &docid, &rev.to_string())?.ok_or_else(|| RouchError::NotFound(docid.clone()))?;
            let att = stored.attachments.get(&name).ok_or_else(|| RouchError::NotFound(format!("{}/{}", docid, name)))?;

            let txn = db.begin_read().map_err(db_err)?;
            let blobs = txn.open_table(BLOBS).map_err(db_err)?;
            blobs
                .get(att.digest.as_str())
                .map_err(db_err)?
                .map(|bytes| bytes.value().to_vec())
                .ok_or_else(|| RouchError::NotFound(format!("blob {}", att.digest)))
        })
        .await
    }

    async fn compact(&self, depth: u64) -> Result<()> {
        self.with_db(move |db| {
            let ids: Vec<String> = {
                let txn = db.begin_read().map_err(db_err)?;
                let table = txn.open_table(META).map_err(db_err)?;
                table
                    .iter()
                    .map_err(db_err)?
                    .map(|entry| entry.map(|(k, _)| k.value().to_string()).map_err(db_err))
                    .collect::<Result<Vec<_>>>()?
            };

            let mut live_digests: HashSet<String> = HashSet::new();
            for id in &ids {
                let Some(mut meta) = load_meta(db, id)? else { continue };
                merge::stem(&mut meta.rev_tree, depth);
                let surviving = all_revids(&meta.rev_tree);

                let txn = db.begin_write().map_err(db_err)?;
                {
                    let mut bodies = txn.open_table(BODIES).map_err(db_err)?;
                    let prefix = format!("{id}\u{0}");
                    let stale: Vec<String> = bodies
                        .iter()
                        .map_err(db_err)?
                        .filter_map(|entry| entry.ok())
                        .filter(|(k, _)| k.value().starts_with(&prefix))
                        .filter(|(k, _)| !surviving.contains(&k.value()[prefix.len()..]))
                        .map(|(k, _)| k.value().to_string())
                        .collect();
                    for key in &stale {
                        bodies.remove(key.as_str()).map_err(db_err)?;
                    }
                    for entry in bodies.iter().map_err(db_err)? {
                        let (k, v) = entry.map_err(db_err)?;
                        if k.value().starts_with(&prefix) {
                            let stored: StoredRevision = serde_json::from_slice(v.value()).map_err(db_err)?;
                            live_digests.extend(stored.attachments.values().map(|a| a.digest.clone()));
                        }
                    }
                    let mut meta_table = txn.open_table(META).map_err(db_err)?;
                    let bytes = serde_json::to_vec(&meta).map_err(db_err)?;
                    meta_table.insert(id.as_str(), bytes.as_slice()).map_err(db_err)?;
                }
                txn.commit().map_err(db_err)?;
            }

            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut blobs = txn.open_table(BLOBS).map_err(db_err)?;
                let stale: Vec<String> = blobs
                    .iter()
                    .map_err(db_err)?
                    .filter_map(|entry| entry.ok())
                    .filter(|(k, _)| !live_digests.contains(k.value()))
                    .map(|(k, _)| k.value().to_string())
                    .collect();
                for digest in stale {
                    blobs.remove(digest.as_str()).map_err(db_err)?;
                }
            }
            txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn destroy(&self) -> Result<()> {
        self.with_db(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                for table_def in [META, BODIES, LOCAL] {
                    let mut table = txn.open_table(table_def).map_err(db_err)?;
                    let keys: Vec<String> = table
                        .iter()
                        .map_err(db_err)?
                        .filter_map(|e| e.ok())
                        .map(|(k, _)| k.value().to_string())
                        .collect();
                    for key in keys {
                        table.remove(key.as_str()).map_err(db_err)?;
                    }
                }
                let mut blobs = txn.open_table(BLOBS).map_err(db_err)?;
                let digests: Vec<String> =
                    blobs.iter().map_err(db_err)?.filter_map(|e| e.ok()).map(|(k, _)| k.value().to_string()).collect();
                for digest in digests {
                    blobs.remove(digest.as_str()).map_err(db_err)?;
                }
                let mut seq_log = txn.open_table(SEQ_LOG).map_err(db_err)?;
                let seqs: Vec<u64> = seq_log.iter().map_err(db_err)?.filter_map(|e| e.ok()).map(|(k, _)| k.value()).collect();
                for seq in seqs {
                    seq_log.remove(seq).map_err(db_err)?;
                }
                let mut counters = txn.open_table(COUNTERS).map_err(db_err)?;
                counters.insert("next_seq", 1u64).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let id = id.to_string();
        self.with_db(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(LOCAL).map_err(db_err)?;
            match table.get(id.as_str()).map_err(db_err)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value()).map_err(db_err)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let id = id.to_string();
        self.with_db(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(LOCAL).map_err(db_err)?;
                let bytes = serde_json::to_vec(&value).map_err(db_err)?;
                table.insert(id.as_str(), bytes.as_slice()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (RedbAdapter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        (RedbAdapter::open("test", path).unwrap(), dir)
    }

    async fn put(db: &RedbAdapter, id: &str, data: serde_json::Value) -> DocResult {
        let doc = Document { id: id.into(), rev: None, deleted: false, data, attachments: HashMap::new(), revisions: None };
        db.bulk_docs(vec![doc], BulkDocsOptions::new()).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn put_get_and_conflict_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");

        let r1 = {
            let db = RedbAdapter::open("test", &path).unwrap();
            put(&db, "a", serde_json::json!({"x": 1})).await
        };
        assert!(r1.ok);

        let db = RedbAdapter::open("test", &path).unwrap();
        let doc = db.get("a", GetOptions::default()).await.unwrap();
        assert_eq!(doc.data["x"], 1);

        let doc2 = Document {
            id: "a".into(),
            rev: Some(r1.rev.clone().unwrap().parse().unwrap()),
            deleted: false,
            data: serde_json::json!({"x": 2}),
            attachments: HashMap::new(),
            revisions: None,
        };
        let r2 = db.bulk_docs(vec![doc2], BulkDocsOptions::new()).await.unwrap().remove(0);
        assert!(r2.ok);

        let stale = Document {
            id: "a".into(),
            rev: Some(r1.rev.unwrap().parse().unwrap()),
            deleted: false,
            data: serde_json::json!({"x": 3}),
            attachments: HashMap::new(),
            revisions: None,
        };
        let result = db.bulk_docs(vec![stale], BulkDocsOptions::new()).await.unwrap().remove(0);
        assert!(!result.ok);
        assert_eq!(result.error.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn attachments_round_trip_through_blob_table() {
        let (db, _dir) = open_tmp();
        put(&db, "doc1", serde_json::json!({})).await;
        let doc1 = db.get("doc1", GetOptions::default()).await.unwrap();

        db.put_attachment("doc1", "a.txt", &doc1.rev.unwrap().to_string(), b"hello".to_vec(), "text/plain")
            .await
            .unwrap();

        let bytes = db.get_attachment("doc1", "a.txt", GetAttachmentOptions::default()).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn local_docs_are_not_part_of_changes() {
        let (db, _dir) = open_tmp();
        db.put_local("_local/checkpoint", serde_json::json!({"seq": 5})).await.unwrap();
        let value = db.get_local("_local/checkpoint").await.unwrap().unwrap();
        assert_eq!(value["seq"], 5);

        let changes = db.changes(ChangesOptions::default()).await.unwrap();
        assert!(changes.results.is_empty());
    }

    #[tokio::test]
    async fn registered_filter_excludes_non_matching_revisions() {
        let (db, _dir) = open_tmp();
        db.register_filter("by_type", |doc: &Document, params: &HashMap<String, String>| {
            doc.data.get("type").and_then(|t| t.as_str()) == params.get("type").map(String::as_str)
        });
        put(&db, "a", serde_json::json!({"type": "person"})).await;
        put(&db, "b", serde_json::json!({"type": "city"})).await;

        let mut filter_params = HashMap::new();
        filter_params.insert("type".to_string(), "person".to_string());
        let changes = db
            .changes(ChangesOptions { filter: Some("by_type".to_string()), filter_params, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(changes.results.len(), 1);
        assert_eq!(changes.results[0].id, "a");
    }

    #[tokio::test]
    async fn unknown_filter_name_is_an_error() {
        let (db, _dir) = open_tmp();
        put(&db, "a", serde_json::json!({})).await;
        let result = db.changes(ChangesOptions { filter: Some("no_such_filter".to_string()), ..Default::default() }).await;
        assert!(matches!(result, Err(RouchError::NotFound(_))));
    }

    #[tokio::test]
    async fn compact_prunes_old_generations() {
        let (db, _dir) = open_tmp();
        let r1 = put(&db, "e", serde_json::json!({"v": 1})).await;
        let doc2 = Document {
            id: "e".into(),
            rev: Some(r1.rev.unwrap().parse().unwrap()),
            deleted: false,
            data: serde_json::json!({"v": 2}),
            attachments: HashMap::new(),
            revisions: None,
        };
        db.bulk_docs(vec![doc2], BulkDocsOptions::new()).await.unwrap();

        db.compact(1).await.unwrap();
        let doc = db.get("e", GetOptions::default()).await.unwrap();
        assert_eq!(doc.data["v"], 2);
    }
}
