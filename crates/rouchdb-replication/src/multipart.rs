//! `multipart/related` codec for documents carrying inline attachments.
//!
//! Grounds the same wire shape TouchDB's `TDMultipartDocumentReader` reads:
//! the first part is the JSON document body, subsequent parts are
//! attachment bytes keyed by `Content-Disposition: filename`, and each is
//! checked against the digest its stub in `_attachments` declares. A
//! mismatch is fatal — the document is rejected, not partially applied.
use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};

use rouchdb_core::error::{Result, RouchError};

/// Encode `doc` plus `attachments` (name -> bytes) as a `multipart/related`
/// body. Only attachments present in `attachments` are inlined; the rest
/// are left as CouchDB "stub" references (`"stub": true`) for the peer to
/// fetch separately or that it's assumed to already hold.
///
/// Returns the encoded body and the `Content-Type` header value to send
/// alongside it.
pub fn encode(doc: &serde_json::Value, attachments: &HashMap<String, Vec<u8>>, boundary: &str) -> (Vec<u8>, String) {
    let mut doc = doc.clone();
    let mut included: Vec<String> = Vec::new();

    if let Some(meta) = doc.get_mut("_attachments").and_then(|v| v.as_object_mut()) {
        for (name, att) in meta.iter_mut() {
            let Some(bytes) = attachments.get(name) else { continue };
            let Some(obj) = att.as_object_mut() else { continue };
            obj.insert("follows".into(), serde_json::Value::Bool(true));
            obj.insert("length".into(), serde_json::Value::from(bytes.len() as u64));
            obj.remove("data");
            obj.remove("stub");
            included.push(name.clone());
        }
    }

    let mut body = Vec::new();
    write_part_header(&mut body, boundary, "application/json", None);
    body.extend_from_slice(doc.to_string().as_bytes());
    body.extend_from_slice(b"\r\n");

    for name in &included {
        let bytes = &attachments[name];
        write_part_header(&mut body, boundary, "application/octet-stream", Some(name));
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (body, format!("multipart/related; boundary=\"{boundary}\""))
}

fn write_part_header(out: &mut Vec<u8>, boundary: &str, content_type: &str, filename: Option<&str>) {
    out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    if let Some(name) = filename {
        out.extend_from_slice(format!("Content-Disposition: attachment; filename=\"{name}\"\r\n").as_bytes());
    }
    out.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
}

/// Decode a `multipart/related` body back into its JSON document and a
/// name-keyed map of attachment bytes, verifying each against the
/// document's declared digest.
pub fn decode(body: &[u8], content_type: &str) -> Result<(serde_json::Value, HashMap<String, Vec<u8>>)> {
    let boundary = extract_boundary(content_type)?;
    let mut parts = split_parts(body, &boundary).into_iter();

    let first = parts
        .next()
        .ok_or_else(|| RouchError::Codec("multipart body has no parts".into()))?;
    let doc: serde_json::Value = serde_json::from_slice(&first.body)?;

    let mut attachments = HashMap::new();
    let mut anonymous_index = 0usize;
    for part in parts {
        let name = part.filename().unwrap_or_else(|| {
            let name = anonymous_index.to_string();
            anonymous_index += 1;
            name
        });
        attachments.insert(name, part.body);
    }

    if let Some(meta) = doc.get("_attachments").and_then(|v| v.as_object()) {
        for (name, att) in meta {
            let Some(bytes) = attachments.get(name) else { continue };
            let Some(expected) = att.get("digest").and_then(|v| v.as_str()) else { continue };
            let actual = blob_digest(bytes);
            if actual != expected {
                return Err(RouchError::Codec(format!(
                    "attachment '{name}' digest mismatch: expected {expected}, got {actual}"
                )));
            }
        }
    }

    Ok((doc, attachments))
}

fn blob_digest(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("md5-{}", BASE64.encode(hasher.finalize()))
}

fn extract_boundary(content_type: &str) -> Result<String> {
    content_type
        .split(';')
        .skip(1)
        .find_map(|segment| {
            let segment = segment.trim();
            segment.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_string())
        })
        .ok_or_else(|| RouchError::Codec("Content-Type has no multipart boundary".into()))
}

struct Part {
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Part {
    fn filename(&self) -> Option<String> {
        let disposition = self.headers.get("content-disposition")?;
        disposition.split(';').find_map(|segment| {
            let segment = segment.trim();
            segment.strip_prefix("filename=").map(|f| f.trim_matches('"').to_string())
        })
    }
}

fn split_parts(body: &[u8], boundary: &str) -> Vec<Part> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut parts = Vec::new();

    let mut search_from = 0usize;
    let mut segments: Vec<(usize, usize)> = Vec::new();
    while let Some(start) = find_subslice(&body[search_from..], &delimiter) {
        let absolute = search_from + start;
        segments.push((absolute, absolute + delimiter.len()));
        search_from = absolute + delimiter.len();
    }

    for window in segments.windows(2) {
        let chunk_start = window[0].1;
        let chunk_end = window[1].0;
        if chunk_start >= chunk_end {
            continue;
        }
        let chunk = trim_crlf(&body[chunk_start..chunk_end]);
        if let Some(part) = parse_part(chunk) {
            parts.push(part);
        }
    }

    parts
}

/// Strip exactly the CRLF a delimiter line leaves at the start of a part
/// and the CRLF `encode` appends after a part's body — not a greedy trim,
/// so binary attachment bytes ending in `\r`/`\n` survive intact.
fn trim_crlf(chunk: &[u8]) -> &[u8] {
    let chunk = chunk.strip_prefix(b"\r\n").unwrap_or(chunk);
    chunk.strip_suffix(b"\r\n").unwrap_or(chunk)
}

fn parse_part(chunk: &[u8]) -> Option<Part> {
    let separator = b"\r\n\r\n";
    let header_end = find_subslice(chunk, separator)?;
    let header_text = std::str::from_utf8(&chunk[..header_end]).ok()?;
    let body = chunk[header_end + separator.len()..].to_vec();

    let mut headers = HashMap::new();
    for line in header_text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Some(Part { headers, body })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_document_with_one_attachment() {
        let doc = serde_json::json!({
            "_id": "a",
            "_rev": "1-abc",
            "_attachments": {
                "note.txt": {
                    "content_type": "text/plain",
                    "digest": blob_digest(b"hello"),
                    "length": 5,
                    "stub": false,
                    "revpos": 1,
                }
            }
        });
        let mut attachments = HashMap::new();
        attachments.insert("note.txt".to_string(), b"hello".to_vec());

        let (body, content_type) = encode(&doc, &attachments, "test-boundary");
        let (decoded_doc, decoded_attachments) = decode(&body, &content_type).unwrap();

        assert_eq!(decoded_doc["_id"], "a");
        assert_eq!(decoded_attachments.get("note.txt").unwrap(), b"hello");
    }

    #[test]
    fn rejects_tampered_attachment_bytes() {
        let doc = serde_json::json!({
            "_id": "a",
            "_attachments": {
                "note.txt": { "digest": blob_digest(b"hello"), "stub": false }
            }
        });
        let mut attachments = HashMap::new();
        attachments.insert("note.txt".to_string(), b"hello".to_vec());
        let (mut body, content_type) = encode(&doc, &attachments, "boundary2");

        let pos = find_subslice(&body, b"hello").unwrap();
        body[pos] = b'H';

        let err = decode(&body, &content_type).unwrap_err();
        assert!(matches!(err, RouchError::Codec(_)));
    }

    #[test]
    fn document_without_attachments_decodes_alone() {
        let doc = serde_json::json!({"_id": "a", "value": 1});
        let (body, content_type) = encode(&doc, &HashMap::new(), "boundary3");
        let (decoded, attachments) = decode(&body, &content_type).unwrap();
        assert_eq!(decoded["value"], 1);
        assert!(attachments.is_empty());
    }
}
