//! In-memory `Adapter` implementation for RouchDB.
//!
//! Reference implementation of the revision store contract: every other
//! crate's tests run against this adapter so the revision-tree algorithms
//! in `rouchdb-core` get exercised without touching disk or the network.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use md5::{Digest, Md5};
use tokio::sync::RwLock;

use rouchdb_core::adapter::{Adapter, FilterFn, ValidationContext, ValidationFn};
use rouchdb_core::document::*;
use rouchdb_core::error::{Result, RouchError};
use rouchdb_core::merge;
use rouchdb_core::rev_tree::{self, NodeOpts, RevStatus};
use rouchdb_core::selector;

#[derive(Clone)]
struct StoredRevision {
    data: serde_json::Value,
    attachments: HashMap<String, AttachmentMeta>,
    deleted: bool,
}

struct Inner {
    docs: HashMap<String, DocMetadata>,
    bodies: HashMap<(String, String), StoredRevision>,
    blobs: HashMap<String, Vec<u8>>,
    /// Every revision insert, in commit order: `(seq, docid)`.
    seq_log: Vec<(u64, String)>,
    next_seq: u64,
    local_docs: HashMap<String, serde_json::Value>,
}

impl Inner {
    fn new() -> Self {
        Self {
            docs: HashMap::new(),
            bodies: HashMap::new(),
            blobs: HashMap::new(),
            seq_log: Vec::new(),
            next_seq: 1,
            local_docs: HashMap::new(),
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Client-initiated write: generations computed, conflict-checked
    /// against the current winning leaf, validated.
    fn put_new_edit(&mut self, doc: &Document, validations: &[Arc<dyn ValidationFn>]) -> Result<DocResult> {
        let id = if doc.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            doc.id.clone()
        };

        let meta = self.docs.entry(id.clone()).or_insert_with(|| DocMetadata {
            id: id.clone(),
            rev_tree: Vec::new(),
            seq: 0,
        });

        let leaves = rev_tree::collect_leaves(&meta.rev_tree);
        let current_winner = leaves.first().cloned();

        let current_doc = current_winner.as_ref().and_then(|w| {
            self.bodies
                .get(&(id.clone(), format!("{}-{}", w.pos, w.hash)))
                .map(|stored| Document {
                    id: id.clone(),
                    rev: Some(Revision::new(w.pos, w.hash.clone())),
                    deleted: w.deleted,
                    data: stored.data.clone(),
                    attachments: stored.attachments.clone(),
                    revisions: None,
                })
        });

        match (&current_winner, &doc.rev) {
            (None, None) => {} // first revision of a brand-new document
            (None, Some(_)) => {
                return Err(RouchError::Conflict);
            }
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

        let attachments = self.link_attachments(&id, generation, &doc.attachments, parent.as_ref());

        let new_path = rev_tree::build_path_with_statuses(
            generation,
            &vec_of_chain(parent.as_ref(), &new_rev),
            NodeOpts { deleted: doc.deleted },
            RevStatus::Available,
            &[],
        );
        let (merged, _) = merge::merge_tree(&meta.rev_tree, &new_path, 0);
        meta.rev_tree = merged;

        let seq = self.take_seq();
        meta.seq = seq;
        self.seq_log.push((seq, id.clone()));

        self.bodies.insert(
            (id.clone(), new_rev.to_string()),
            StoredRevision {
                data: doc.data.clone(),
                attachments,
                deleted: doc.deleted,
            },
        );

        Ok(DocResult {
            ok: true,
            id,
            rev: Some(new_rev.to_string()),
            error: None,
            reason: None,
        })
    }

    /// Replication write (`new_edits: false`): force-insert at the point in
    /// the tree `doc.revisions` describes, creating `Missing` placeholders
    /// for ancestors not yet seen. Validation predicates never run here.
    fn force_insert(&mut self, doc: &Document) -> Result<DocResult> {
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

        let meta = self.docs.entry(id.clone()).or_insert_with(|| DocMetadata {
            id: id.clone(),
            rev_tree: Vec::new(),
            seq: 0,
        });

        let leaf_rev = Revision::new(history.start, history.ids[0].clone());
        let key = (id.clone(), leaf_rev.to_string());

        if let Some(existing) = self.bodies.get(&key) {
            if existing.data == doc.data && existing.deleted == doc.deleted {
                return Ok(DocResult {
                    ok: true,
                    id,
                    rev: Some(leaf_rev.to_string()),
                    error: None,
                    reason: None,
                });
            }
            return Err(RouchError::Conflict);
        }

        // Ancestor statuses: root-to-leaf-minus-one, Missing unless already
        // known in the tree.
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

        let parent_rev = if history.ids.len() > 1 {
            Some(Revision::new(history.start - 1, history.ids[1].clone()))
        } else {
            None
        };

        let new_path = rev_tree::build_path_with_statuses(
            history.start,
            &history.ids,
            NodeOpts { deleted: doc.deleted },
            RevStatus::Available,
            &ancestor_statuses,
        );
        let (merged, _) = merge::merge_tree(&meta.rev_tree, &new_path, 0);
        meta.rev_tree = merged;

        let attachments = self.link_attachments(&id, history.start, &doc.attachments, parent_rev.as_ref());

        let seq = self.take_seq();
        meta.seq = seq;
        self.seq_log.push((seq, id.clone()));

        self.bodies.insert(
            key,
            StoredRevision {
                data: doc.data.clone(),
                attachments,
                deleted: doc.deleted,
            },
        );

        Ok(DocResult {
            ok: true,
            id,
            rev: Some(leaf_rev.to_string()),
            error: None,
            reason: None,
        })
    }

    fn link_attachments(
        &mut self,
        id: &str,
        generation: u64,
        incoming: &HashMap<String, AttachmentMeta>,
        parent: Option<&Revision>,
    ) -> HashMap<String, AttachmentMeta> {
        let mut result = HashMap::new();
        for (name, meta) in incoming {
            if let Some(bytes) = &meta.data {
                let digest = blob_digest(bytes);
                self.blobs.entry(digest.clone()).or_insert_with(|| bytes.clone());
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

            if meta.stub {
                if let Some(parent_rev) = parent
                    && let Some(parent_body) = self.bodies.get(&(id.to_string(), parent_rev.to_string()))
                    && let Some(carried) = parent_body.attachments.get(name)
                {
                    result.insert(name.clone(), carried.clone());
                    continue;
                }
            }

            // Digest-addressed stub referencing a blob uploaded out of band
            // (multipart codec, or already a known digest). Trust the
            // caller; preserve whatever rev_pos it supplied.
            result.insert(name.clone(), meta.clone());
        }
        result
    }
}

fn vec_of_chain(parent: Option<&Revision>, leaf: &Revision) -> Vec<String> {
    match parent {
        Some(p) => vec![leaf.hash.clone(), p.hash.clone()],
        None => vec![leaf.hash.clone()],
    }
}

fn blob_digest(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("md5-{}", BASE64.encode(hasher.finalize()))
}

fn build_document(
    id: &str,
    rev: &Revision,
    stored: &StoredRevision,
    tree: &rouchdb_core::rev_tree::RevTree,
    opts: &GetOptions,
) -> Document {
    let mut data = stored.data.clone();
    if opts.conflicts {
        let conflicts = merge::collect_conflicts(tree);
        if !conflicts.is_empty()
            && let Some(obj) = data.as_object_mut()
        {
            obj.insert(
                "_conflicts".into(),
                serde_json::Value::Array(
                    conflicts.iter().map(|r| serde_json::Value::String(r.to_string())).collect(),
                ),
            );
        }
    }

    let revisions = if opts.revs {
        rev_tree::revision_history(tree, rev.pos, &rev.hash).map(|chain| RevisionHistory {
            start: rev.pos,
            ids: chain.into_iter().map(|r| r.hash).collect(),
        })
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

fn all_revids(tree: &rouchdb_core::rev_tree::RevTree) -> HashSet<String> {
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

/// An in-process, non-persistent `Adapter`.
pub struct MemoryAdapter {
    name: String,
    state: RwLock<Inner>,
    validations: StdRwLock<Vec<Arc<dyn ValidationFn>>>,
    filters: StdRwLock<HashMap<String, Arc<dyn FilterFn>>>,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(Inner::new()),
            validations: StdRwLock::new(Vec::new()),
            filters: StdRwLock::new(HashMap::new()),
        }
    }

    /// Register a validation predicate. Runs only on client-initiated
    /// writes (`new_edits: true`), never against replicated revisions.
    pub fn register_validation<F: ValidationFn + 'static>(&self, f: F) {
        self.validations.write().unwrap().push(Arc::new(f));
    }

    /// Register a named filter predicate, selectable from `_changes`/
    /// replication via `ChangesOptions.filter`.
    pub fn register_filter<F: FilterFn + 'static>(&self, name: impl Into<String>, f: F) {
        self.filters.write().unwrap().insert(name.into(), Arc::new(f));
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn info(&self) -> Result<DbInfo> {
        let inner = self.state.read().await;
        let mut doc_count = 0u64;
        for meta in inner.docs.values() {
            if let Some(winner) = rev_tree::collect_leaves(&meta.rev_tree).first()
                && !winner.deleted
            {
                doc_count += 1;
            }
        }
        Ok(DbInfo {
            db_name: self.name.clone(),
            doc_count,
            update_seq: Seq::Num(inner.next_seq.saturating_sub(1)),
        })
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let inner = self.state.read().await;
        let meta = inner.docs.get(id).ok_or_else(|| RouchError::NotFound(id.to_string()))?;

        let rev = match &opts.rev {
            Some(s) => s.parse::<Revision>()?,
            None => {
                let winner = rev_tree::collect_leaves(&meta.rev_tree)
                    .into_iter()
                    .next()
                    .ok_or_else(|| RouchError::NotFound(id.to_string()))?;
                if winner.deleted && opts.open_revs.is_none() {
                    return Err(RouchError::NotFound(id.to_string()));
                }
                Revision::new(winner.pos, winner.hash)
            }
        };

        let stored = inner
            .bodies
            .get(&(id.to_string(), rev.to_string()))
            .ok_or_else(|| RouchError::NotFound(format!("{}@{}", id, rev)))?;

        Ok(build_document(id, &rev, stored, &meta.rev_tree, &opts))
    }

    async fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Result<Vec<DocResult>> {
        let mut inner = self.state.write().await;
        let validations: Vec<Arc<dyn ValidationFn>> = self.validations.read().unwrap().clone();
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone();
            let outcome = if opts.new_edits {
                inner.put_new_edit(&doc, &validations)
            } else {
                inner.force_insert(&doc)
            };
            results.push(outcome.unwrap_or_else(|e| DocResult {
                ok: false,
                id,
                rev: None,
                error: Some(error_kind(&e)),
                reason: Some(e.to_string()),
            }));
        }
        Ok(results)
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        let inner = self.state.read().await;
        let mut entries: Vec<(String, Revision)> = Vec::new();
        for (id, meta) in &inner.docs {
            if let Some(winner) = rev_tree::collect_leaves(&meta.rev_tree).into_iter().next()
                && !winner.deleted
            {
                entries.push((id.clone(), Revision::new(winner.pos, winner.hash)));
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if opts.descending {
            entries.reverse();
        }

        if let Some(key) = &opts.key {
            entries.retain(|(id, _)| id == key);
        }
        if let Some(keys) = &opts.keys {
            entries.retain(|(id, _)| keys.contains(id));
        }
        if let Some(start) = &opts.start_key {
            entries.retain(|(id, _)| if opts.descending { id <= start } else { id >= start });
        }
        if let Some(end) = &opts.end_key {
            entries.retain(|(id, _)| {
                let within = if opts.descending { id >= end } else { id <= end };
                within && (opts.inclusive_end || id != end)
            });
        }

        let total_rows = entries.len() as u64;
        let skip = opts.skip as usize;
        let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let mut rows = Vec::new();
        for (id, rev) in entries.into_iter().skip(skip).take(limit) {
            let doc = if opts.include_docs {
                inner.bodies.get(&(id.clone(), rev.to_string())).map(|stored| {
                    build_document(&id, &rev, stored, &inner.docs[&id].rev_tree, &GetOptions::default()).to_json()
                })
            } else {
                None
            };
            rows.push(AllDocsRow {
                id: id.clone(),
                key: id,
                value: AllDocsRowValue { rev: rev.to_string(), deleted: None },
                doc,
            });
        }

        Ok(AllDocsResponse { total_rows, offset: skip as u64, rows })
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        let inner = self.state.read().await;
        let since = opts.since.as_num();
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

        let mut latest_seq_for_doc: HashMap<String, u64> = HashMap::new();
        for (seq, docid) in &inner.seq_log {
            if *seq > since {
                latest_seq_for_doc.insert(docid.clone(), *seq);
            }
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
            let Some(meta) = inner.docs.get(&docid) else { continue };
            let leaves = rev_tree::collect_leaves(&meta.rev_tree);
            let Some(winner) = leaves.first() else { continue };
            let winner_rev = Revision::new(winner.pos, winner.hash.clone());
            let Some(stored) = inner.bodies.get(&(docid.clone(), winner_rev.to_string())) else {
                continue;
            };

            if let Some(selector) = &opts.selector
                && !selector::matches(&stored.data, selector)
            {
                continue;
            }

            let full_doc = (filter.is_some() || opts.include_docs)
                .then(|| build_document(&docid, &winner_rev, stored, &meta.rev_tree, &GetOptions::default()));

            if let Some(filter) = &filter
                && !filter.include(full_doc.as_ref().unwrap(), &opts.filter_params)
            {
                continue;
            }

            let changes = if opts.include_conflicts {
                leaves
                    .iter()
                    .map(|l| ChangeRev { rev: format!("{}-{}", l.pos, l.hash) })
                    .collect()
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
    }

    async fn revs_diff(&self, revs: HashMap<String, Vec<String>>) -> Result<RevsDiffResponse> {
        let inner = self.state.read().await;
        let mut results = HashMap::new();
        for (docid, rev_strs) in revs {
            let mut missing = Vec::new();
            match inner.docs.get(&docid) {
                Some(meta) => {
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
    }

    async fn bulk_get(&self, items: Vec<BulkGetItem>) -> Result<BulkGetResponse> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            // Always include `_revisions`, matching a replicator's
            // `_bulk_get?revs=true`: the fetch stage force-inserts on the
            // other side and needs the full ancestor chain to do it.
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
        let inner = self.state.read().await;
        let meta = inner.docs.get(id).ok_or_else(|| RouchError::NotFound(id.to_string()))?;
        let r: Revision = rev.parse()?;
        let chain = rev_tree::revision_history(&meta.rev_tree, r.pos, &r.hash)
            .ok_or_else(|| RouchError::NotFound(format!("{}@{}", id, rev)))?;
        Ok(chain.into_iter().map(|rv| rv.hash).collect())
    }

    async fn put_attachment(
        &self,
        docid: &str,
        name: &str,
        rev: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<PutResponse> {
        let mut inner = self.state.write().await;
        let validations: Vec<Arc<dyn ValidationFn>> = self.validations.read().unwrap().clone();

        let existing = inner.docs.get(docid).cloned();
        let (parent, base_data, mut attachments) = match &existing {
            Some(meta) => {
                let winner = rev_tree::collect_leaves(&meta.rev_tree)
                    .into_iter()
                    .next()
                    .ok_or_else(|| RouchError::NotFound(docid.to_string()))?;
                let parent = Revision::new(winner.pos, winner.hash.clone());
                if parent.to_string() != rev {
                    return Err(RouchError::Conflict);
                }
                let stored = inner
                    .bodies
                    .get(&(docid.to_string(), parent.to_string()))
                    .ok_or_else(|| RouchError::NotFound(docid.to_string()))?
                    .clone();
                (Some(parent), stored.data, stored.attachments)
            }
            None => (None, serde_json::json!({}), HashMap::new()),
        };

        attachments.insert(
            name.to_string(),
            AttachmentMeta {
                content_type: content_type.to_string(),
                digest: String::new(),
                length: 0,
                stub: false,
                data: Some(data),
                rev_pos: 0,
                encoding: None,
                encoded_length: None,
            },
        );

        let doc = Document {
            id: docid.to_string(),
            rev: parent,
            deleted: false,
            data: base_data,
            attachments,
            revisions: None,
        };
        let result = inner.put_new_edit(&doc, &validations)?;
        Ok(PutResponse { ok: true, id: docid.to_string(), rev: result.rev.unwrap() })
    }

    async fn get_attachment(&self, docid: &str, name: &str, opts: GetAttachmentOptions) -> Result<Vec<u8>> {
        let inner = self.state.read().await;
        let meta = inner.docs.get(docid).ok_or_else(|| RouchError::NotFound(docid.to_string()))?;
        let rev = match &opts.rev {
            Some(r) => r.parse::<Revision>()?,
            None => {
                let winner = rev_tree::collect_leaves(&meta.rev_tree)
                    .into_iter()
                    .next()
                    .ok_or_else(|| RouchError::NotFound(docid.to_string()))?;
                Revision::new(winner.pos, winner.hash)
            }
        };
        let stored = inner
            .bodies
            .get(&(docid.to_string(), rev.to_string()))
            .ok_or_else(|| RouchError::NotFound(docid.to_string()))?;
        let att = stored
            .attachments
            .get(name)
            .ok_or_else(|| RouchError::NotFound(format!("{}/{}", docid, name)))?;
        inner
            .blobs
            .get(&att.digest)
            .cloned()
            .ok_or_else(|| RouchError::NotFound(format!("blob {}", att.digest)))
    }

    async fn compact(&self, depth: u64) -> Result<()> {
        let mut inner = self.state.write().await;
        let ids: Vec<String> = inner.docs.keys().cloned().collect();
        for id in &ids {
            let surviving = {
                let meta = inner.docs.get_mut(id).unwrap();
                merge::stem(&mut meta.rev_tree, depth);
                all_revids(&meta.rev_tree)
            };
            inner.bodies.retain(|(bid, brev), _| bid != id || surviving.contains(brev));
        }

        let mut live_digests: HashSet<String> = HashSet::new();
        for stored in inner.bodies.values() {
            for att in stored.attachments.values() {
                live_digests.insert(att.digest.clone());
            }
        }
        inner.blobs.retain(|digest, _| live_digests.contains(digest));
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut inner = self.state.write().await;
        *inner = Inner::new();
        Ok(())
    }

    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let inner = self.state.read().await;
        Ok(inner.local_docs.get(id).cloned())
    }

    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut inner = self.state.write().await;
        inner.local_docs.insert(id.to_string(), value);
        Ok(())
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
