//! Maps `RouchError` onto CouchDB-shaped HTTP error responses: an
//! `{"error": ..., "reason": ...}` body with the status code CouchDB itself
//! would return for the same condition.
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rouchdb::RouchError;
use serde_json::json;

pub struct ServerError(pub RouchError);

impl From<RouchError> for ServerError {
    fn from(err: RouchError) -> Self {
        ServerError(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error, reason) = match &self.0 {
            RouchError::NotFound(reason) => (StatusCode::NOT_FOUND, "not_found", reason.clone()),
            RouchError::Conflict => (StatusCode::CONFLICT, "conflict", "Document update conflict.".to_string()),
            RouchError::BadRequest(reason) => (StatusCode::BAD_REQUEST, "bad_request", reason.clone()),
            RouchError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required.".to_string())
            }
            RouchError::Forbidden(reason) => (StatusCode::FORBIDDEN, "forbidden", reason.clone()),
            RouchError::InvalidRev(reason) => (StatusCode::BAD_REQUEST, "bad_request", reason.clone()),
            RouchError::MissingId => {
                (StatusCode::BAD_REQUEST, "bad_request", "Document id is missing".to_string())
            }
            RouchError::DatabaseExists(name) => {
                (StatusCode::PRECONDITION_FAILED, "file_exists", format!("Database {name} already exists."))
            }
            RouchError::DatabaseError(reason) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", reason.clone()),
            RouchError::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error", err.to_string()),
            RouchError::Json(err) => (StatusCode::BAD_REQUEST, "bad_request", err.to_string()),
            RouchError::Codec(reason) => (StatusCode::BAD_REQUEST, "bad_request", reason.clone()),
            RouchError::Upstream { status, message } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                (status, "upstream_error", message.clone())
            }
            RouchError::Cancelled => (StatusCode::INTERNAL_SERVER_ERROR, "cancelled", "Operation was cancelled.".to_string()),
        };
        (status, Json(json!({"error": error, "reason": reason}))).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
