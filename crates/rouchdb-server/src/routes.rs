use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value, json};

use rouchdb::{
    AllDocsOptions, ChangesOptions, Database, Document, GetAttachmentOptions, GetOptions, PutResponse, RouchError,
    Seq,
};
use rouchdb_core::adapter::Adapter;
use rouchdb_core::document::{BulkDocsOptions, BulkGetItem};

use crate::assets::serve_ui;
use crate::error::{ServerError, ServerResult};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/_all_dbs", get(all_dbs))
        .route("/_utils", get(|| serve_ui(None)))
        .route("/_utils/{*path}", get(|path: Path<String>| serve_ui(Some(path))))
        .route("/{db}", get(db_info).put(create_db).delete(destroy_db))
        .route("/{db}/_compact", post(compact_db))
        .route("/{db}/_all_docs", get(all_docs))
        .route("/{db}/_bulk_docs", post(bulk_docs))
        .route("/{db}/_bulk_get", post(bulk_get))
        .route("/{db}/_revs_diff", post(revs_diff))
        .route("/{db}/_changes", get(changes))
        .route("/{db}/_local/{id}", get(get_local).put(put_local))
        .route("/{db}/{docid}/{attname}", get(get_attachment).put(put_attachment))
        .route("/{db}/{docid}", get(get_doc).put(put_doc).delete(delete_doc))
        .with_state(state)
}

async fn db_or_404(state: &AppState, name: &str) -> ServerResult<Arc<Database>> {
    state
        .get(name)
        .await
        .ok_or_else(|| ServerError(RouchError::NotFound("Database does not exist.".to_string())))
}

fn query_flag(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map(|v| v == "true").unwrap_or(false)
}

fn unquote(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

fn parse_seq(raw: &str) -> Seq {
    match raw.parse::<u64>() {
        Ok(n) => Seq::Num(n),
        Err(_) => Seq::Str(raw.to_string()),
    }
}

async fn welcome() -> Json<Value> {
    Json(json!({"rouchdb": "Welcome", "version": env!("CARGO_PKG_VERSION")}))
}

async fn all_dbs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.names().await)
}

async fn db_info(State(state): State<AppState>, Path(db_name): Path<String>) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    Ok(Json(serde_json::to_value(db.info().await?).map_err(RouchError::Json)?))
}

async fn create_db(State(state): State<AppState>, Path(db_name): Path<String>) -> ServerResult<impl IntoResponse> {
    state.create(&db_name).await?;
    Ok((StatusCode::CREATED, Json(json!({"ok": true}))))
}

async fn destroy_db(State(state): State<AppState>, Path(db_name): Path<String>) -> ServerResult<Json<Value>> {
    state.destroy(&db_name).await?;
    Ok(Json(json!({"ok": true})))
}

async fn compact_db(State(state): State<AppState>, Path(db_name): Path<String>) -> ServerResult<impl IntoResponse> {
    let db = db_or_404(&state, &db_name).await?;
    db.compact().await?;
    Ok((StatusCode::ACCEPTED, Json(json!({"ok": true}))))
}

async fn all_docs(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    let opts = AllDocsOptions {
        start_key: params.get("startkey").map(|s| unquote(s)),
        end_key: params.get("endkey").map(|s| unquote(s)),
        key: params.get("key").map(|s| unquote(s)),
        keys: params.get("keys").and_then(|s| serde_json::from_str(s).ok()),
        include_docs: query_flag(&params, "include_docs"),
        descending: query_flag(&params, "descending"),
        skip: params.get("skip").and_then(|s| s.parse().ok()).unwrap_or(0),
        limit: params.get("limit").and_then(|s| s.parse().ok()),
        inclusive_end: params.get("inclusive_end").map(|v| v != "false").unwrap_or(true),
    };
    let response = db.all_docs(opts).await?;
    Ok(Json(serde_json::to_value(response).map_err(RouchError::Json)?))
}

async fn bulk_docs(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Json(body): Json<Value>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    let new_edits = body.get("new_edits").and_then(Value::as_bool).unwrap_or(true);
    let docs_json = body
        .get("docs")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| RouchError::BadRequest("missing docs array".to_string()))?;

    let mut docs = Vec::with_capacity(docs_json.len());
    for doc_json in docs_json {
        docs.push(Document::from_json(doc_json)?);
    }

    let opts = if new_edits { BulkDocsOptions::new() } else { BulkDocsOptions::replication() };
    let results = db.adapter().bulk_docs(docs, opts).await?;
    Ok(Json(serde_json::to_value(results).map_err(RouchError::Json)?))
}

async fn bulk_get(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Json(body): Json<Value>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    let items_json = body
        .get("docs")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| RouchError::BadRequest("missing docs array".to_string()))?;

    let items: Vec<BulkGetItem> = items_json
        .into_iter()
        .map(|v| BulkGetItem {
            id: v.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            rev: v.get("rev").and_then(Value::as_str).map(str::to_string),
        })
        .collect();

    let response = db.adapter().bulk_get(items).await?;
    Ok(Json(serde_json::to_value(response).map_err(RouchError::Json)?))
}

async fn revs_diff(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Json(body): Json<HashMap<String, Vec<String>>>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    let response = db.adapter().revs_diff(body).await?;
    Ok(Json(serde_json::to_value(response).map_err(RouchError::Json)?))
}

async fn changes(
    State(state): State<AppState>,
    Path(db_name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    const RESERVED_PARAMS: &[&str] =
        &["since", "limit", "descending", "include_docs", "conflicts", "live", "doc_ids", "selector", "filter"];
    let filter_params =
        params.iter().filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect();
    let opts = ChangesOptions {
        since: params.get("since").map(|s| parse_seq(s)).unwrap_or_default(),
        limit: params.get("limit").and_then(|s| s.parse().ok()),
        descending: query_flag(&params, "descending"),
        include_docs: query_flag(&params, "include_docs"),
        include_conflicts: query_flag(&params, "conflicts"),
        live: false,
        doc_ids: params.get("doc_ids").and_then(|s| serde_json::from_str(s).ok()),
        selector: None,
        filter: params.get("filter").cloned(),
        filter_params,
    };
    let response = db.changes(opts).await?;
    Ok(Json(serde_json::to_value(response).map_err(RouchError::Json)?))
}

async fn get_doc(
    State(state): State<AppState>,
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    let opts = GetOptions {
        rev: params.get("rev").cloned(),
        conflicts: query_flag(&params, "conflicts"),
        open_revs: None,
        revs: query_flag(&params, "revs"),
    };
    let doc = db.get_with_opts(&doc_id, opts.clone()).await?;
    Ok(Json(doc.to_json_with(opts.revs)))
}

async fn put_doc(
    State(state): State<AppState>,
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> ServerResult<impl IntoResponse> {
    let db = db_or_404(&state, &db_name).await?;
    let mut doc = Document::from_json(body)?;
    doc.id = doc_id;
    if doc.rev.is_none() {
        if let Some(rev) = params.get("rev") {
            doc.rev = Some(rev.parse()?);
        }
    }

    let new_edits = params.get("new_edits").map(|v| v != "false").unwrap_or(true);
    let opts = if new_edits { BulkDocsOptions::new() } else { BulkDocsOptions::replication() };
    let mut results = db.adapter().bulk_docs(vec![doc], opts).await?;
    let result = results.remove(0);
    if result.ok {
        Ok((StatusCode::CREATED, Json(PutResponse { ok: true, id: result.id, rev: result.rev.unwrap_or_default() })))
    } else {
        Err(ServerError(RouchError::Conflict))
    }
}

async fn delete_doc(
    State(state): State<AppState>,
    Path((db_name, doc_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Json<PutResponse>> {
    let db = db_or_404(&state, &db_name).await?;
    let rev = params.get("rev").ok_or_else(|| RouchError::BadRequest("missing rev".to_string()))?;
    let result = db.remove(doc_id, rev).await?;
    Ok(Json(PutResponse { ok: result.ok, id: result.id, rev: result.rev.unwrap_or_default() }))
}

async fn get_local(
    State(state): State<AppState>,
    Path((db_name, id)): Path<(String, String)>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    match db.adapter().get_local(&id).await? {
        Some(value) => Ok(Json(value)),
        None => Err(ServerError(RouchError::NotFound("missing".to_string()))),
    }
}

async fn put_local(
    State(state): State<AppState>,
    Path((db_name, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ServerResult<Json<Value>> {
    let db = db_or_404(&state, &db_name).await?;
    db.adapter().put_local(&id, body).await?;
    Ok(Json(json!({"ok": true, "id": format!("_local/{id}")})))
}

async fn get_attachment(
    State(state): State<AppState>,
    Path((db_name, doc_id, attname)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ServerResult<Response> {
    let db = db_or_404(&state, &db_name).await?;
    let doc = db.get(&doc_id).await?;
    let meta = doc
        .attachments
        .get(&attname)
        .ok_or_else(|| RouchError::NotFound("missing attachment".to_string()))?
        .clone();

    let opts = GetAttachmentOptions { rev: params.get("rev").cloned() };
    let data = db.adapter().get_attachment(&doc_id, &attname, opts).await?;
    Ok(([(header::CONTENT_TYPE, meta.content_type)], data).into_response())
}

async fn put_attachment(
    State(state): State<AppState>,
    Path((db_name, doc_id, attname)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ServerResult<impl IntoResponse> {
    let db = db_or_404(&state, &db_name).await?;
    let rev = params.get("rev").cloned().ok_or_else(|| RouchError::BadRequest("missing rev".to_string()))?;
    let content_type =
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("application/octet-stream");
    let response = db.adapter().put_attachment(&doc_id, &attname, &rev, body.to_vec(), content_type).await?;
    Ok((StatusCode::CREATED, Json(response)))
}
