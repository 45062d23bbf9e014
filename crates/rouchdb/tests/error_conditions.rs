//! Error condition tests: nonexistent docs, wrong revisions, conflicts.


use rouchdb::{Database, RouchError};

#[tokio::test]
async fn error_get_nonexistent_doc() {
    let db = Database::memory("remote");

    let result = db.get("does_not_exist").await;
    assert!(matches!(result, Err(RouchError::NotFound(_))));

}

#[tokio::test]
async fn error_update_wrong_rev() {
    let db = Database::memory("remote");

    db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();

    let result = db
        .update("doc1", "1-bogusrevisionhash", serde_json::json!({"v": 2}))
        .await;
    assert!(result.is_err() || !result.unwrap().ok);

}

#[tokio::test]
async fn error_delete_wrong_rev() {
    let db = Database::memory("remote");

    db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();

    let result = db.remove("doc1", "1-bogusrevisionhash").await;
    assert!(result.is_err() || !result.unwrap().ok);

}

#[tokio::test]
async fn error_put_existing_without_rev() {
    let db = Database::memory("remote");

    db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();

    let result = db.put("doc1", serde_json::json!({"v": 2})).await;
    assert!(result.is_err() || !result.unwrap().ok);

}

#[tokio::test]
async fn error_get_deleted_doc() {
    let db = Database::memory("remote");

    let r1 = db.put("doc1", serde_json::json!({"v": 1})).await.unwrap();
    db.remove("doc1", &r1.rev.unwrap()).await.unwrap();

    let result = db.get("doc1").await;
    assert!(matches!(result, Err(RouchError::NotFound(_))));

}
