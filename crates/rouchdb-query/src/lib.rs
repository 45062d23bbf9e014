//! Mango-style `find` queries and ad hoc map/reduce views for RouchDB.
//!
//! Both operate over any `Adapter` by paging through `all_docs`; neither
//! maintains a persistent index — that's `rouchdb-views`. This crate is for
//! one-off queries where building and maintaining an index isn't worth it.
use std::cmp::Ordering;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::AllDocsOptions;
use rouchdb_core::error::Result;
use rouchdb_core::selector;

// ---------------------------------------------------------------------------
// find — Mango selector queries
// ---------------------------------------------------------------------------

/// A single entry in a `FindOptions::sort` list.
#[derive(Debug, Clone)]
pub enum SortField {
    /// Ascending sort on this field (Mango's `"field"` shorthand).
    Simple(String),
    /// `{"field": "asc"|"desc"}`.
    WithDirection(String, SortDirection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortField {
    fn field(&self) -> &str {
        match self {
            SortField::Simple(f) => f,
            SortField::WithDirection(f, _) => f,
        }
    }

    fn direction(&self) -> SortDirection {
        match self {
            SortField::Simple(_) => SortDirection::Asc,
            SortField::WithDirection(_, d) => *d,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub selector: serde_json::Value,
    pub sort: Vec<SortField>,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Project the result documents down to these top-level fields, plus
    /// `_id`/`_rev`, like Mango's `fields`.
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct FindResponse {
    pub docs: Vec<serde_json::Value>,
}

/// Run a Mango `find` query against every current (non-deleted) document.
pub async fn find(adapter: &dyn Adapter, opts: FindOptions) -> Result<FindResponse> {
    let all = adapter
        .all_docs(AllDocsOptions { include_docs: true, ..AllDocsOptions::new() })
        .await?;

    let mut docs: Vec<serde_json::Value> = all
        .rows
        .into_iter()
        .filter_map(|row| row.doc)
        .filter(|doc| selector::matches(doc, &opts.selector))
        .collect();

    if !opts.sort.is_empty() {
        docs.sort_by(|a, b| compare_by_sort(a, b, &opts.sort));
    }

    let skip = opts.skip as usize;
    let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let mut docs: Vec<_> = docs.into_iter().skip(skip).take(limit).collect();

    if let Some(fields) = &opts.fields {
        for doc in &mut docs {
            *doc = project_fields(doc, fields);
        }
    }

    Ok(FindResponse { docs })
}

fn compare_by_sort(a: &serde_json::Value, b: &serde_json::Value, sort: &[SortField]) -> Ordering {
    for field in sort {
        let av = a.get(field.field());
        let bv = b.get(field.field());
        let ord = selector::compare(av, bv.unwrap_or(&serde_json::Value::Null)).unwrap_or(Ordering::Equal);
        let ord = if field.direction() == SortDirection::Desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project_fields(doc: &serde_json::Value, fields: &[String]) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for key in ["_id", "_rev"] {
        if let Some(v) = doc.get(key) {
            out.insert(key.to_string(), v.clone());
        }
    }
    for field in fields {
        if let Some(v) = doc.get(field) {
            out.insert(field.clone(), v.clone());
        }
    }
    serde_json::Value::Object(out)
}

// ---------------------------------------------------------------------------
// query_view — ad hoc map/reduce
// ---------------------------------------------------------------------------

/// A map function: emits zero or more `(key, value)` pairs per document.
/// Mirrors CouchDB's `emit(key, value)` calling convention.
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

/// Built-in reducers, matching CouchDB's `_sum`/`_count`/`_stats` built-ins.
#[derive(Debug, Clone, Copy)]
pub enum ReduceFn {
    Sum,
    Count,
    Stats,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ViewRow {
    pub id: Option<String>,
    pub key: serde_json::Value,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ViewResults {
    pub total_rows: u64,
    pub rows: Vec<ViewRow>,
}

#[derive(Debug, Clone, Default)]
pub struct ViewQueryOptions {
    pub start_key: Option<serde_json::Value>,
    pub end_key: Option<serde_json::Value>,
    pub descending: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    pub reduce: Option<ReduceFn>,
    /// `group=true` in CouchDB terms: reduce per distinct key instead of to
    /// a single value.
    pub group: bool,
}

/// Run an ad hoc map/reduce query over every current document, the way
/// CouchDB's temporary views work: no index is persisted.
pub async fn query_view(
    adapter: &dyn Adapter,
    map_fn: &dyn MapFn,
    opts: ViewQueryOptions,
) -> Result<ViewResults> {
    let all = adapter
        .all_docs(AllDocsOptions { include_docs: true, ..AllDocsOptions::new() })
        .await?;

    let mut rows: Vec<ViewRow> = Vec::new();
    for row in all.rows {
        let Some(doc) = row.doc else { continue };
        let id = row.id.clone();
        let mut emitted = Vec::new();
        map_fn.map(&doc, &mut |key, value| emitted.push((key, value)));
        for (key, value) in emitted {
            rows.push(ViewRow { id: Some(id.clone()), key, value });
        }
    }

    rows.sort_by(|a, b| json_cmp(&a.key, &b.key));
    if opts.descending {
        rows.reverse();
    }

    if let Some(start) = &opts.start_key {
        rows.retain(|r| {
            let ord = json_cmp(&r.key, start);
            if opts.descending { ord != Ordering::Greater } else { ord != Ordering::Less }
        });
    }
    if let Some(end) = &opts.end_key {
        rows.retain(|r| {
            let ord = json_cmp(&r.key, end);
            if opts.descending { ord != Ordering::Less } else { ord != Ordering::Greater }
        });
    }

    let total_rows = rows.len() as u64;

    if let Some(reduce) = opts.reduce {
        rows = apply_reduce(rows, reduce, opts.group);
    }

    let skip = opts.skip as usize;
    let limit = opts.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    let rows: Vec<_> = rows.into_iter().skip(skip).take(limit).collect();

    Ok(ViewResults { total_rows, rows })
}

fn apply_reduce(rows: Vec<ViewRow>, reduce: ReduceFn, group: bool) -> Vec<ViewRow> {
    if !group {
        let value = reduce_values(rows.iter().map(|r| &r.value), reduce);
        return vec![ViewRow { id: None, key: serde_json::Value::Null, value }];
    }

    let mut out: Vec<ViewRow> = Vec::new();
    let mut i = 0;
    while i < rows.len() {
        let key = rows[i].key.clone();
        let mut j = i;
        while j < rows.len() && rows[j].key == key {
            j += 1;
        }
        let value = reduce_values(rows[i..j].iter().map(|r| &r.value), reduce);
        out.push(ViewRow { id: None, key, value });
        i = j;
    }
    out
}

fn reduce_values<'a>(values: impl Iterator<Item = &'a serde_json::Value>, reduce: ReduceFn) -> serde_json::Value {
    match reduce {
        ReduceFn::Count => serde_json::Value::from(values.count() as u64),
        ReduceFn::Sum => {
            let sum: f64 = values.filter_map(|v| v.as_f64()).sum();
            serde_json::json!(sum)
        }
        ReduceFn::Stats => {
            let nums: Vec<f64> = values.filter_map(|v| v.as_f64()).collect();
            let count = nums.len() as u64;
            let sum: f64 = nums.iter().sum();
            let min = nums.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = nums.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let sumsqr: f64 = nums.iter().map(|n| n * n).sum();
            serde_json::json!({"sum": sum, "count": count, "min": min, "max": max, "sumsqr": sumsqr})
        }
    }
}

fn json_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    selector::compare(Some(a), b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouchdb_adapter_memory::MemoryAdapter;
    use rouchdb_core::document::{BulkDocsOptions, Document};
    use std::collections::HashMap;

    async fn seed(db: &MemoryAdapter) {
        for (id, age, dept) in [("a", 25, "eng"), ("b", 31, "eng"), ("c", 40, "sales")] {
            let doc = Document {
                id: id.into(),
                rev: None,
                deleted: false,
                data: serde_json::json!({"age": age, "dept": dept}),
                attachments: HashMap::new(),
                revisions: None,
            };
            db.bulk_docs(vec![doc], BulkDocsOptions::new()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn find_filters_and_sorts() {
        let db = MemoryAdapter::new("t");
        seed(&db).await;

        let result = find(
            &db,
            FindOptions {
                selector: serde_json::json!({"dept": "eng"}),
                sort: vec![SortField::WithDirection("age".into(), SortDirection::Desc)],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.docs.len(), 2);
        assert_eq!(result.docs[0]["_id"], "b");
        assert_eq!(result.docs[1]["_id"], "a");
    }

    #[tokio::test]
    async fn find_projects_fields() {
        let db = MemoryAdapter::new("t");
        seed(&db).await;

        let result = find(
            &db,
            FindOptions {
                selector: serde_json::json!({}),
                fields: Some(vec!["dept".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        for doc in &result.docs {
            assert!(doc.get("age").is_none());
            assert!(doc.get("dept").is_some());
            assert!(doc.get("_id").is_some());
        }
    }

    #[tokio::test]
    async fn query_view_groups_and_reduces() {
        let db = MemoryAdapter::new("t");
        seed(&db).await;

        let map = |doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value)| {
            emit(doc["dept"].clone(), doc["age"].clone());
        };

        let result = query_view(
            &db,
            &map,
            ViewQueryOptions { reduce: Some(ReduceFn::Sum), group: true, ..Default::default() },
        )
        .await
        .unwrap();

        assert_eq!(result.rows.len(), 2);
        let eng = result.rows.iter().find(|r| r.key == "eng").unwrap();
        assert_eq!(eng.value, 56.0);
    }

    #[tokio::test]
    async fn query_view_without_reduce_returns_all_rows() {
        let db = MemoryAdapter::new("t");
        seed(&db).await;

        let map = |doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value)| {
            emit(doc["age"].clone(), serde_json::Value::Null);
        };

        let result = query_view(&db, &map, ViewQueryOptions::default()).await.unwrap();
        assert_eq!(result.total_rows, 3);
        assert_eq!(result.rows[0].key, 25);
    }
}
