use axum::body::Body;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "ui/"]
struct Ui;

/// Serves the bundled UI at `/_utils/*path`, the same mount point CouchDB's
/// Fauxton admin console uses. `path` empty or unknown falls back to
/// `index.html`, so client-side routes in the UI still resolve.
pub async fn serve_ui(path: Option<Path<String>>) -> Response {
    let requested = path.map(|Path(p)| p).filter(|p| !p.is_empty()).unwrap_or_else(|| "index.html".to_string());

    let file = Ui::get(&requested).or_else(|| Ui::get("index.html"));
    match file {
        Some(content) => {
            let mime = mime_guess::from_path(&requested).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref().to_string())], Body::from(content.data.into_owned())).into_response()
        }
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
