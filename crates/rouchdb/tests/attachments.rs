//! Attachment tests: put/get text and binary data.


use rouchdb::{Adapter, Database, GetAttachmentOptions};

#[tokio::test]
async fn attachment_put_and_get() {
    let db = Database::memory("remote");

    let r1 = db
        .put("doc1", serde_json::json!({"name": "test"}))
        .await
        .unwrap();
    let rev = r1.rev.unwrap();

    let data = b"Hello, CouchDB attachments!".to_vec();
    let result = db
        .adapter()
        .put_attachment("doc1", "greeting.txt", &rev, data.clone(), "text/plain")
        .await
        .unwrap();
    assert!(result.ok);

    let retrieved = db
        .adapter()
        .get_attachment("doc1", "greeting.txt", GetAttachmentOptions::default())
        .await
        .unwrap();
    assert_eq!(retrieved, data);

    let doc = db.get("doc1").await.unwrap();
    assert_eq!(doc.data["name"], "test");

}

#[tokio::test]
async fn attachment_binary_data() {
    let db = Database::memory("remote");

    let r1 = db.put("doc1", serde_json::json!({})).await.unwrap();
    let rev = r1.rev.unwrap();

    let binary_data: Vec<u8> = (0..=255).collect();
    let result = db
        .adapter()
        .put_attachment(
            "doc1",
            "bytes.bin",
            &rev,
            binary_data.clone(),
            "application/octet-stream",
        )
        .await
        .unwrap();
    assert!(result.ok);

    let retrieved = db
        .adapter()
        .get_attachment("doc1", "bytes.bin", GetAttachmentOptions::default())
        .await
        .unwrap();
    assert_eq!(retrieved, binary_data);

}

#[tokio::test]
async fn replication_carries_attachment_bytes_to_the_target() {
    let source = Database::memory("source");
    let target = Database::memory("target");

    let r1 = source.put("doc1", serde_json::json!({"name": "test"})).await.unwrap();
    let rev = r1.rev.unwrap();
    let data = b"Hello, replicated attachment!".to_vec();
    source
        .adapter()
        .put_attachment("doc1", "greeting.txt", &rev, data.clone(), "text/plain")
        .await
        .unwrap();

    let outcome = target.replicate_from(&source).await.unwrap();
    assert_eq!(outcome.docs_written, 1);

    let doc = target.get("doc1").await.unwrap();
    assert_eq!(doc.data["name"], "test");

    let retrieved = target
        .adapter()
        .get_attachment("doc1", "greeting.txt", GetAttachmentOptions::default())
        .await
        .unwrap();
    assert_eq!(retrieved, data);
}
