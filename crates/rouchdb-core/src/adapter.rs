/// The storage seam every backend (memory, redb, HTTP) implements.
///
/// `Adapter` is intentionally request/response shaped, mirroring the
/// CouchDB HTTP API it must stay wire-compatible with (§6): a single
/// `bulk_docs` call serves both ordinary client writes (`new_edits: true`,
/// conflict-checked, validated) and replication writes (`new_edits: false`,
/// force-insert via `Document::revisions`), exactly as CouchDB's
/// `_bulk_docs` endpoint does.
use std::collections::HashMap;

use async_trait::async_trait;

use crate::document::{
    AllDocsOptions, AllDocsResponse, BulkDocsOptions, BulkGetItem, BulkGetResponse, ChangesOptions,
    ChangesResponse, DbInfo, Document, DocResult, GetAttachmentOptions, GetOptions, RevsDiffResponse,
};
use crate::error::Result;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// The database name this adapter was opened with.
    fn name(&self) -> &str;

    async fn info(&self) -> Result<DbInfo>;

    /// Fetch the current winning revision (or a specific one via
    /// `opts.rev`). Returns `NotFound` for absent or (without
    /// `opts.open_revs`) deleted documents.
    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document>;

    /// The revision store's single write primitive. With
    /// `opts.new_edits == true`, generations are computed, the parent must
    /// be the current winning leaf (unless this is the first revision),
    /// and registered validation predicates run. With `new_edits == false`,
    /// each document's `revisions` field drives a force-insert: missing
    /// ancestors become `Missing` placeholders and validation is skipped
    /// (§9 — replicated revisions are trusted history, not proposed edits).
    async fn bulk_docs(&self, docs: Vec<Document>, opts: BulkDocsOptions) -> Result<Vec<DocResult>>;

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse>;

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse>;

    /// `findMissing`: given candidate (docid, [revid]) pairs, report which
    /// are not present locally. Used by push to skip redundant uploads and
    /// by pull to ask the remote the same question.
    async fn revs_diff(&self, revs: HashMap<String, Vec<String>>) -> Result<RevsDiffResponse>;

    /// Fetch several documents/revisions by id in one round trip (CouchDB
    /// `_bulk_get`); used by the replicator's fetch stage.
    async fn bulk_get(&self, items: Vec<BulkGetItem>) -> Result<BulkGetResponse>;

    /// The full ancestor chain for `id`@`rev`, leaf-to-root, as hash
    /// suffixes only (CouchDB `_revisions.ids` format). Used to build the
    /// `_revisions` block attached to documents sent during push.
    async fn revision_history(&self, id: &str, rev: &str) -> Result<Vec<String>>;

    async fn put_attachment(
        &self,
        docid: &str,
        name: &str,
        rev: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<crate::document::PutResponse>;

    async fn get_attachment(
        &self,
        docid: &str,
        name: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>>;

    /// Prune revision-tree branches deeper than `depth` generations below
    /// each leaf and sweep unreferenced blobs.
    async fn compact(&self, depth: u64) -> Result<()>;

    async fn destroy(&self) -> Result<()>;

    /// Checkpoint / arbitrary local-only document storage
    /// (`_local/{id}`, never replicated).
    async fn get_local(&self, id: &str) -> Result<Option<serde_json::Value>>;

    async fn put_local(&self, id: &str, value: serde_json::Value) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Validation & filter predicates
// ---------------------------------------------------------------------------

/// Context passed to a [`ValidationFn`]: the revision being replaced (if
/// any), the proposed new revision, and the set of top-level keys whose
/// value differs between them.
pub struct ValidationContext<'a> {
    pub current: Option<&'a Document>,
    pub proposed: &'a Document,
    pub changed_keys: Vec<String>,
    /// Status code to report on rejection (default 403). Predicates may
    /// override before returning `Err`.
    pub status: u16,
}

impl<'a> ValidationContext<'a> {
    pub fn new(current: Option<&'a Document>, proposed: &'a Document) -> Self {
        let changed_keys = compute_changed_keys(current, proposed);
        Self {
            current,
            proposed,
            changed_keys,
            status: 403,
        }
    }

    /// True if every changed key is in `allowed`.
    pub fn only_changed(&self, allowed: &[&str]) -> bool {
        self.changed_keys.iter().all(|k| allowed.contains(&k.as_str()))
    }

    /// True if none of `forbidden` changed.
    pub fn none_changed(&self, forbidden: &[&str]) -> bool {
        self.changed_keys.iter().all(|k| !forbidden.contains(&k.as_str()))
    }
}

fn compute_changed_keys(current: Option<&Document>, proposed: &Document) -> Vec<String> {
    let empty = serde_json::Map::new();
    let cur_obj = current
        .and_then(|d| d.data.as_object())
        .unwrap_or(&empty);
    let new_obj = proposed.data.as_object().unwrap_or(&empty);

    let mut keys: Vec<String> = Vec::new();
    for (k, v) in new_obj {
        if cur_obj.get(k) != Some(v) {
            keys.push(k.clone());
        }
    }
    for k in cur_obj.keys() {
        if !new_obj.contains_key(k) && !keys.contains(k) {
            keys.push(k.clone());
        }
    }
    keys
}

/// A named, registered validation predicate: can reject a client-initiated
/// write before it commits. Never runs against replicated revisions.
///
/// Predicates must be pure; a rejection anywhere in a batch aborts that
/// document's write with the reported `status`/message, leaving the rest
/// of the batch unaffected.
pub trait ValidationFn: Send + Sync {
    fn validate(&self, ctx: &mut ValidationContext) -> Result<()>;
}

impl<F> ValidationFn for F
where
    F: Fn(&mut ValidationContext) -> Result<()> + Send + Sync,
{
    fn validate(&self, ctx: &mut ValidationContext) -> Result<()> {
        self(ctx)
    }
}

/// A named filter predicate: decides whether a revision participates in a
/// change feed or replication session.
pub trait FilterFn: Send + Sync {
    fn include(&self, doc: &Document, params: &HashMap<String, String>) -> bool;
}

impl<F> FilterFn for F
where
    F: Fn(&Document, &HashMap<String, String>) -> bool + Send + Sync,
{
    fn include(&self, doc: &Document, params: &HashMap<String, String>) -> bool {
        self(doc, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn doc(data: serde_json::Value) -> Document {
        Document {
            id: "x".into(),
            rev: None,
            deleted: false,
            data,
            attachments: Map::new(),
            revisions: None,
        }
    }

    #[test]
    fn changed_keys_detects_additions_and_removals() {
        let current = doc(serde_json::json!({"a": 1, "b": 2}));
        let proposed = doc(serde_json::json!({"a": 1, "c": 3}));
        let ctx = ValidationContext::new(Some(&current), &proposed);
        let mut keys = ctx.changed_keys.clone();
        keys.sort();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn only_changed_and_none_changed() {
        let current = doc(serde_json::json!({"a": 1}));
        let proposed = doc(serde_json::json!({"a": 2}));
        let ctx = ValidationContext::new(Some(&current), &proposed);
        assert!(ctx.only_changed(&["a"]));
        assert!(!ctx.none_changed(&["a"]));
    }
}
