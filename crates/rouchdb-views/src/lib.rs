//! Persistent, incrementally-maintained named views.
//!
//! Unlike `rouchdb-query`'s ad hoc `query_view` (which rescans every
//! document on every call), a [`View`] here tracks a watermark sequence and
//! only re-runs its map function against documents that changed since the
//! last [`View::refresh`]. This mirrors CouchDB design-document views:
//! registration is by name, storage is keyed by emitted key, and the
//! watermark is itself the staleness measure named in the data model.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{ChangesOptions, Seq};
use rouchdb_core::error::Result;

/// A view's map function: emits zero or more `(key, value)` pairs per
/// document, the same calling convention as CouchDB's `emit()`.
pub trait MapFn: Send + Sync {
    fn map(&self, doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value));
}

impl<F> MapFn for F
where
    F: Fn(&serde_json::Value, &mut dyn FnMut(serde_json::Value, serde_json::Value)) + Send + Sync,
{
    fn map(&self, doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value)) {
        self(doc, emit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRow {
    pub doc_id: String,
    pub key: serde_json::Value,
    pub value: serde_json::Value,
}

/// Storage for one view's emitted rows and its watermark sequence.
///
/// Adapters that want a durable view index (e.g. a redb-backed one)
/// implement this trait directly against their own tables; [`MemoryViewIndexStore`]
/// is the default used when no durable backing is configured.
#[async_trait]
pub trait ViewIndexStore: Send + Sync {
    async fn watermark(&self) -> Seq;
    async fn set_watermark(&self, seq: Seq);
    /// Replace every row previously emitted for `doc_id` with `rows`
    /// (possibly empty, if the document no longer emits anything).
    async fn replace_doc_rows(&self, doc_id: &str, rows: Vec<IndexedRow>);
    async fn remove_doc(&self, doc_id: &str);
    async fn all_rows(&self) -> Vec<IndexedRow>;
}

#[derive(Default)]
struct MemoryState {
    watermark: Seq,
    rows_by_doc: HashMap<String, Vec<IndexedRow>>,
}

/// The default in-memory [`ViewIndexStore`].
pub struct MemoryViewIndexStore {
    state: RwLock<MemoryState>,
}

impl MemoryViewIndexStore {
    pub fn new() -> Self {
        Self { state: RwLock::new(MemoryState::default()) }
    }
}

impl Default for MemoryViewIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ViewIndexStore for MemoryViewIndexStore {
    async fn watermark(&self) -> Seq {
        self.state.read().await.watermark.clone()
    }

    async fn set_watermark(&self, seq: Seq) {
        self.state.write().await.watermark = seq;
    }

    async fn replace_doc_rows(&self, doc_id: &str, rows: Vec<IndexedRow>) {
        let mut state = self.state.write().await;
        if rows.is_empty() {
            state.rows_by_doc.remove(doc_id);
        } else {
            state.rows_by_doc.insert(doc_id.to_string(), rows);
        }
    }

    async fn remove_doc(&self, doc_id: &str) {
        self.state.write().await.rows_by_doc.remove(doc_id);
    }

    async fn all_rows(&self) -> Vec<IndexedRow> {
        let state = self.state.read().await;
        let mut rows: Vec<IndexedRow> = state.rows_by_doc.values().flatten().cloned().collect();
        rows.sort_by(|a, b| json_cmp(&a.key, &b.key));
        rows
    }
}

fn json_cmp(a: &serde_json::Value, b: &serde_json::Value) -> std::cmp::Ordering {
    rouchdb_core::selector::compare(Some(a), b).unwrap_or(std::cmp::Ordering::Equal)
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ViewQueryOptions {
    pub start_key: Option<serde_json::Value>,
    pub end_key: Option<serde_json::Value>,
    pub descending: bool,
    pub skip: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ViewResults {
    pub total_rows: u64,
    pub rows: Vec<IndexedRow>,
}

/// A single named, persistently-indexed view.
pub struct View {
    name: String,
    map_fn: Arc<dyn MapFn>,
    store: Arc<dyn ViewIndexStore>,
}

impl View {
    pub fn new(name: impl Into<String>, map_fn: Arc<dyn MapFn>) -> Self {
        Self::with_store(name, map_fn, Arc::new(MemoryViewIndexStore::new()))
    }

    pub fn with_store(name: impl Into<String>, map_fn: Arc<dyn MapFn>, store: Arc<dyn ViewIndexStore>) -> Self {
        Self { name: name.into(), map_fn, store }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn watermark(&self) -> Seq {
        self.store.watermark().await
    }

    /// Bring the index up to date: fetch everything that changed since the
    /// last watermark and re-run the map function only for those documents.
    pub async fn refresh(&self, adapter: &dyn Adapter) -> Result<u64> {
        let since = self.store.watermark().await;
        let resp = adapter
            .changes(ChangesOptions { since, include_docs: true, ..Default::default() })
            .await?;

        for event in &resp.results {
            if event.deleted {
                self.store.remove_doc(&event.id).await;
                continue;
            }
            let Some(doc) = &event.doc else { continue };
            let mut rows = Vec::new();
            self.map_fn.map(doc, &mut |key, value| {
                rows.push(IndexedRow { doc_id: event.id.clone(), key, value })
            });
            self.store.replace_doc_rows(&event.id, rows).await;
        }

        let indexed = resp.results.len() as u64;
        if indexed > 0 {
            self.store.set_watermark(resp.last_seq).await;
        }
        Ok(indexed)
    }

    /// Query the current index (does not implicitly refresh — callers
    /// decide their own staleness tolerance by calling `refresh` first).
    pub async fn query(&self, opts: ViewQueryOptions) -> ViewResults {
        let mut rows = self.store.all_rows().await;
        if opts.descending {
            rows.reverse();
        }

        if let Some(start) = &opts.start_key {
            rows.retain(|r| {
                let ord = json_cmp(&r.key, start);
                if opts.descending { ord != std::cmp::Ordering::Greater } else { ord != std::cmp::Ordering::Less }
            });
        }
        if let Some(end) = &opts.end_key {
            rows.retain(|r| {
                let ord = json_cmp(&r.key, end);
                if opts.descending { ord != std::cmp::Ordering::Less } else { ord != std::cmp::Ordering::Greater }
            });
        }

        let total_rows = rows.len() as u64;
        let skip = opts.skip as usize;
        let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let rows: Vec<_> = rows.into_iter().skip(skip).take(limit).collect();

        ViewResults { total_rows, rows }
    }
}

// ---------------------------------------------------------------------------
// Registry — groups views the way a CouchDB design document does
// ---------------------------------------------------------------------------

/// Holds every registered view, addressed as `"{design_doc}/{view_name}"`.
#[derive(Default)]
pub struct ViewRegistry {
    views: HashMap<String, Arc<View>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, design_doc: &str, view: View) -> Arc<View> {
        let key = format!("{design_doc}/{}", view.name());
        let view = Arc::new(view);
        self.views.insert(key, view.clone());
        view
    }

    pub fn get(&self, design_doc: &str, view_name: &str) -> Option<Arc<View>> {
        self.views.get(&format!("{design_doc}/{view_name}")).cloned()
    }

    /// Refresh every registered view against `adapter`.
    pub async fn refresh_all(&self, adapter: &dyn Adapter) -> Result<()> {
        for view in self.views.values() {
            view.refresh(adapter).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouchdb_adapter_memory::MemoryAdapter;
    use rouchdb_core::document::{BulkDocsOptions, Document};
    use std::collections::HashMap as Map;

    fn by_dept() -> Arc<dyn MapFn> {
        Arc::new(|doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value)| {
            emit(doc["dept"].clone(), 1.into());
        })
    }

    async fn put(db: &MemoryAdapter, id: &str, dept: &str) {
        let doc = Document {
            id: id.into(),
            rev: None,
            deleted: false,
            data: serde_json::json!({"dept": dept}),
            attachments: Map::new(),
            revisions: None,
        };
        db.bulk_docs(vec![doc], BulkDocsOptions::new()).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_indexes_only_new_changes() {
        let db = MemoryAdapter::new("t");
        put(&db, "a", "eng").await;
        put(&db, "b", "sales").await;

        let view = View::new("by_dept", by_dept());
        let indexed = view.refresh(&db).await.unwrap();
        assert_eq!(indexed, 2);

        let results = view.query(ViewQueryOptions::default()).await;
        assert_eq!(results.total_rows, 2);

        // No new changes — refresh indexes nothing further.
        let indexed_again = view.refresh(&db).await.unwrap();
        assert_eq!(indexed_again, 0);

        put(&db, "c", "eng").await;
        let indexed_third = view.refresh(&db).await.unwrap();
        assert_eq!(indexed_third, 1);

        let results = view.query(ViewQueryOptions::default()).await;
        assert_eq!(results.total_rows, 3);
    }

    #[tokio::test]
    async fn deleted_documents_drop_out_of_the_index() {
        let db = MemoryAdapter::new("t");
        put(&db, "a", "eng").await;
        let view = View::new("by_dept", by_dept());
        view.refresh(&db).await.unwrap();

        let doc = db.get("a", Default::default()).await.unwrap();
        let del = Document {
            id: "a".into(),
            rev: doc.rev,
            deleted: true,
            data: serde_json::json!({}),
            attachments: Map::new(),
            revisions: None,
        };
        db.bulk_docs(vec![del], BulkDocsOptions::new()).await.unwrap();
        view.refresh(&db).await.unwrap();

        let results = view.query(ViewQueryOptions::default()).await;
        assert_eq!(results.total_rows, 0);
    }

    #[tokio::test]
    async fn registry_addresses_views_by_design_doc() {
        let mut registry = ViewRegistry::new();
        registry.register("people", View::new("by_dept", by_dept()));
        assert!(registry.get("people", "by_dept").is_some());
        assert!(registry.get("people", "missing").is_none());
    }
}
