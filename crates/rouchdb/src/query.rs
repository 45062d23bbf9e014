//! Facade-level `find` and `query_view`: ergonomic option types that mirror
//! Mango's/CouchDB's own wire shapes, translated internally into
//! `rouchdb-query`'s lower-level (and stricter) option types.
use std::collections::HashMap;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::error::Result;

pub use rouchdb_query::{FindResponse, ReduceFn, ViewResults, ViewRow};

// ---------------------------------------------------------------------------
// find
// ---------------------------------------------------------------------------

/// A single entry in a [`FindOptions::sort`] list.
#[derive(Debug, Clone)]
pub enum SortField {
    /// Ascending sort on this field (Mango's `"field"` shorthand).
    Simple(String),
    /// `{"field": "asc"|"desc", ...}` — one entry per field.
    WithDirection(HashMap<String, String>),
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub selector: serde_json::Value,
    pub sort: Option<Vec<SortField>>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub fields: Option<Vec<String>>,
}

pub(crate) fn lower_find_options(opts: FindOptions) -> rouchdb_query::FindOptions {
    let mut sort = Vec::new();
    for field in opts.sort.unwrap_or_default() {
        match field {
            SortField::Simple(name) => sort.push(rouchdb_query::SortField::Simple(name)),
            SortField::WithDirection(dirs) => {
                for (name, dir) in dirs {
                    let direction = if dir.eq_ignore_ascii_case("desc") {
                        rouchdb_query::SortDirection::Desc
                    } else {
                        rouchdb_query::SortDirection::Asc
                    };
                    sort.push(rouchdb_query::SortField::WithDirection(name, direction));
                }
            }
        }
    }
    rouchdb_query::FindOptions {
        selector: opts.selector,
        sort,
        skip: opts.skip.unwrap_or(0),
        limit: opts.limit,
        fields: opts.fields,
    }
}

// ---------------------------------------------------------------------------
// query_view
// ---------------------------------------------------------------------------

/// A view map function: returns the `(key, value)` pairs a document emits,
/// directly rather than through an `emit()` callback.
pub trait ViewMapFn: Send + Sync {
    fn call(&self, doc: &serde_json::Value) -> Vec<(serde_json::Value, serde_json::Value)>;
}

impl<F> ViewMapFn for F
where
    F: Fn(&serde_json::Value) -> Vec<(serde_json::Value, serde_json::Value)> + Send + Sync,
{
    fn call(&self, doc: &serde_json::Value) -> Vec<(serde_json::Value, serde_json::Value)> {
        self(doc)
    }
}

struct EmitShim<'a>(&'a dyn ViewMapFn);

impl rouchdb_query::MapFn for EmitShim<'_> {
    fn map(&self, doc: &serde_json::Value, emit: &mut dyn FnMut(serde_json::Value, serde_json::Value)) {
        for (key, value) in self.0.call(doc) {
            emit(key, value);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewQueryOptions {
    pub start_key: Option<serde_json::Value>,
    pub end_key: Option<serde_json::Value>,
    pub descending: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    /// Apply `reduce` (the `Option<&ReduceFn>` argument to `query_view`) to
    /// the matched rows. When false, `reduce` is ignored and raw rows come
    /// back — matches CouchDB's `?reduce=false` query parameter.
    pub reduce: bool,
    /// `group=true`: reduce per distinct key instead of to a single value.
    pub group: bool,
}

impl ViewQueryOptions {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Run an ad hoc map/reduce view query: CouchDB "temporary view" style, no
/// index persisted between calls (`rouchdb-views` is for that).
pub async fn query_view(
    adapter: &dyn Adapter,
    map_fn: &dyn ViewMapFn,
    reduce: Option<&ReduceFn>,
    opts: ViewQueryOptions,
) -> Result<ViewResults> {
    let lower_opts = rouchdb_query::ViewQueryOptions {
        start_key: opts.start_key,
        end_key: opts.end_key,
        descending: opts.descending,
        skip: opts.skip,
        limit: opts.limit,
        reduce: if opts.reduce { reduce.copied() } else { None },
        group: opts.group,
    };
    rouchdb_query::query_view(adapter, &EmitShim(map_fn), lower_opts).await
}
