//! Push/pull replication: the sync loop that turns a `ChangeTracker`'s
//! output into `revs_diff` + `bulk_get` + `bulk_docs` round trips, with
//! progress checkpointed under `_local/{replication_id}` on the recipient
//! the way CouchDB's replicator does.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::config::DatabaseConfig;
use rouchdb_core::document::{BulkDocsOptions, BulkGetItem, ChangeEvent, Document, GetAttachmentOptions, Seq};
use rouchdb_core::error::Result;

use crate::change_tracker::{ChangeTracker, ChangeTrackerOptions, TrackerMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    OneShot,
    Continuous,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    pub docs_read: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
}

/// A stable id for a (source, target, direction, filter, doc allowlist)
/// replication session, used as the `_local/{id}` checkpoint document id —
/// the same scheme CouchDB uses so that resuming a replication after a
/// restart finds its checkpoint, and so that two replications against the
/// same peer/direction but a different filter or allowlist never collide
/// on one checkpoint.
pub fn replication_id(
    source_name: &str,
    target_name: &str,
    filter: Option<&str>,
    filter_params: &HashMap<String, String>,
    doc_ids: Option<&[String]>,
) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(source_name.as_bytes());
    hasher.update(b">");
    hasher.update(target_name.as_bytes());
    if let Some(f) = filter {
        hasher.update(b"?filter=");
        hasher.update(f.as_bytes());
        let mut keys: Vec<&String> = filter_params.keys().collect();
        keys.sort();
        for k in keys {
            hasher.update(b"&");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(filter_params[k].as_bytes());
        }
    }
    if let Some(ids) = doc_ids {
        let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        hasher.update(b"?doc_ids=");
        for id in sorted {
            hasher.update(id.as_bytes());
            hasher.update(b",");
        }
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Checkpoint {
    last_seq: Seq,
}

async fn read_checkpoint(adapter: &dyn Adapter, id: &str) -> Result<Seq> {
    let local_id = format!("_local/{id}");
    match adapter.get_local(&local_id).await? {
        Some(value) => Ok(serde_json::from_value::<Checkpoint>(value)
            .map(|c| c.last_seq)
            .unwrap_or_else(|_| Seq::zero())),
        None => Ok(Seq::zero()),
    }
}

async fn write_checkpoint(adapter: &dyn Adapter, id: &str, seq: Seq) -> Result<()> {
    let local_id = format!("_local/{id}");
    let value = serde_json::to_value(Checkpoint { last_seq: seq }).expect("Checkpoint always serializes");
    adapter.put_local(&local_id, value).await
}

/// Replicates documents one direction between two adapters.
pub struct Replicator {
    source: Arc<dyn Adapter>,
    target: Arc<dyn Adapter>,
    direction: Direction,
    mode: ReplicationMode,
    config: DatabaseConfig,
    filter: Option<String>,
    filter_params: HashMap<String, String>,
    doc_ids: Option<Vec<String>>,
}

impl Replicator {
    pub fn new(
        source: Arc<dyn Adapter>,
        target: Arc<dyn Adapter>,
        direction: Direction,
        mode: ReplicationMode,
        config: DatabaseConfig,
    ) -> Self {
        Self {
            source,
            target,
            direction,
            mode,
            config,
            filter: None,
            filter_params: HashMap::new(),
            doc_ids: None,
        }
    }

    /// Restrict this session to revisions a named, registered filter on
    /// `fetch_from` accepts. Two sessions against the same peer/direction
    /// with different filters/params get distinct checkpoints (see `id`).
    pub fn with_filter(mut self, name: impl Into<String>, params: HashMap<String, String>) -> Self {
        self.filter = Some(name.into());
        self.filter_params = params;
        self
    }

    /// Restrict this session to the given document ids only.
    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = Some(doc_ids);
        self
    }

    /// The remote (from the checkpoint's point of view) and local adapter,
    /// oriented so that `fetch_from` is always where we read changes and
    /// `recipient` is always where we write them and store the checkpoint.
    fn oriented(&self) -> (&Arc<dyn Adapter>, &Arc<dyn Adapter>) {
        match self.direction {
            Direction::Pull => (&self.source, &self.target),
            Direction::Push => (&self.target, &self.source),
        }
    }

    pub fn id(&self) -> String {
        let (fetch_from, recipient) = self.oriented();
        replication_id(
            fetch_from.name(),
            recipient.name(),
            self.filter.as_deref(),
            &self.filter_params,
            self.doc_ids.as_deref(),
        )
    }

    /// Run the replication to completion (`OneShot`) or until `cancel`
    /// fires (`Continuous`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<ReplicationStats> {
        let (fetch_from, recipient) = self.oriented();
        let fetch_from = fetch_from.clone();
        let recipient = recipient.clone();

        let id = self.id();
        let mut since = read_checkpoint(recipient.as_ref(), &id).await?;
        let mut stats = ReplicationStats::default();

        let tracker_mode = match self.mode {
            ReplicationMode::OneShot => TrackerMode::OneShot,
            ReplicationMode::Continuous => TrackerMode::Continuous,
        };

        loop {
            let tracker = ChangeTracker::new(
                fetch_from.clone(),
                ChangeTrackerOptions {
                    mode: tracker_mode,
                    since: since.clone(),
                    include_conflicts: true,
                    doc_ids: self.doc_ids.clone(),
                    filter: self.filter.clone(),
                    filter_params: self.filter_params.clone(),
                    ..Default::default()
                },
                self.config.clone(),
            );
            let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.config.replicator_batch_size);
            let run_handle = tokio::spawn(tracker.clone().run(tx));

            let mut batch: Vec<ChangeEvent> = Vec::new();
            while let Some(event) = rx.recv().await {
                batch.push(event);
                if batch.len() >= self.config.replicator_batch_size {
                    let taken = std::mem::take(&mut batch);
                    self.transfer_batch(fetch_from.as_ref(), recipient.as_ref(), taken, &mut stats).await?;
                }
            }
            if !batch.is_empty() {
                self.transfer_batch(fetch_from.as_ref(), recipient.as_ref(), batch, &mut stats).await?;
            }

            since = match run_handle.await {
                Ok(Ok(seq)) => seq,
                Ok(Err(e)) => return Err(e),
                Err(_) => since,
            };
            write_checkpoint(recipient.as_ref(), &id, since.clone()).await?;

            if self.mode == ReplicationMode::OneShot || cancel.is_cancelled() {
                break;
            }
        }

        Ok(stats)
    }

    async fn transfer_batch(
        &self,
        fetch_from: &dyn Adapter,
        recipient: &dyn Adapter,
        batch: Vec<ChangeEvent>,
        stats: &mut ReplicationStats,
    ) -> Result<()> {
        stats.docs_read += batch.len() as u64;

        let mut candidates: HashMap<String, Vec<String>> = HashMap::new();
        for event in &batch {
            candidates.insert(event.id.clone(), event.changes.iter().map(|c| c.rev.clone()).collect());
        }

        let diff = recipient.revs_diff(candidates).await?;
        let items: Vec<BulkGetItem> = diff
            .results
            .iter()
            .flat_map(|(id, result)| {
                result.missing.iter().map(move |rev| BulkGetItem { id: id.clone(), rev: Some(rev.clone()) })
            })
            .collect();
        if items.is_empty() {
            return Ok(());
        }

        let mut docs = Vec::with_capacity(items.len());
        for chunk in items.chunks(self.config.replicator_fetch_fanout.max(1)) {
            let response = fetch_from.bulk_get(chunk.to_vec()).await?;
            for result in response.results {
                for got in result.docs {
                    if let Some(value) = got.ok {
                        let mut doc = Document::from_json(value)?;
                        Self::hydrate_attachments(fetch_from, &mut doc).await?;
                        docs.push(doc);
                    }
                }
            }
        }
        if docs.is_empty() {
            return Ok(());
        }

        let results = recipient.bulk_docs(docs, BulkDocsOptions::replication()).await?;
        for result in &results {
            if result.ok {
                stats.docs_written += 1;
            } else {
                stats.doc_write_failures += 1;
            }
        }
        Ok(())
    }

    /// `bulk_get` hands back attachments as stubs — digest, length, and
    /// content type, never the bytes — the same way CouchDB's `_bulk_get`
    /// does. Force-inserting those stubs as-is on `recipient` would leave
    /// them pointing at a digest its own blob store never received, so for
    /// every stub without inline data we pull the bytes from `fetch_from`
    /// here and attach them before the write.
    async fn hydrate_attachments(fetch_from: &dyn Adapter, doc: &mut Document) -> Result<()> {
        if doc.attachments.is_empty() {
            return Ok(());
        }
        let rev = doc.rev.as_ref().map(|r| r.to_string());
        for (name, meta) in doc.attachments.iter_mut() {
            if meta.data.is_some() {
                continue;
            }
            let bytes =
                fetch_from.get_attachment(&doc.id, name, GetAttachmentOptions { rev: rev.clone() }).await?;
            meta.data = Some(bytes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rouchdb_adapter_memory::MemoryAdapter;
    use rouchdb_core::document::{BulkDocsOptions as PutOpts, Document as Doc};
    use std::collections::HashMap as Map;

    async fn put(db: &MemoryAdapter, id: &str, value: i64) {
        let doc = Doc {
            id: id.into(),
            rev: None,
            deleted: false,
            data: serde_json::json!({"value": value}),
            attachments: Map::new(),
            revisions: None,
        };
        db.bulk_docs(vec![doc], PutOpts::new()).await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_pull_copies_all_documents() {
        let source = Arc::new(MemoryAdapter::new("source"));
        put(&source, "a", 1).await;
        put(&source, "b", 2).await;
        let target = Arc::new(MemoryAdapter::new("target"));

        let replicator = Replicator::new(
            source.clone() as Arc<dyn Adapter>,
            target.clone() as Arc<dyn Adapter>,
            Direction::Pull,
            ReplicationMode::OneShot,
            DatabaseConfig::default(),
        );
        let stats = replicator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(stats.docs_written, 2);
        assert!(target.get("a", Default::default()).await.is_ok());
        assert!(target.get("b", Default::default()).await.is_ok());
    }

    #[tokio::test]
    async fn second_pull_is_a_no_op_once_caught_up() {
        let source = Arc::new(MemoryAdapter::new("source"));
        put(&source, "a", 1).await;
        let target = Arc::new(MemoryAdapter::new("target"));

        let replicator = Replicator::new(
            source.clone() as Arc<dyn Adapter>,
            target.clone() as Arc<dyn Adapter>,
            Direction::Pull,
            ReplicationMode::OneShot,
            DatabaseConfig::default(),
        );
        replicator.run(CancellationToken::new()).await.unwrap();

        let stats = replicator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.docs_written, 0);
        assert_eq!(stats.docs_read, 0);
    }

    #[tokio::test]
    async fn push_moves_documents_from_target_to_source() {
        let source = Arc::new(MemoryAdapter::new("source"));
        let target = Arc::new(MemoryAdapter::new("target"));
        put(&target, "a", 1).await;

        // Push replicates from `target` (the local db) to `source` (the
        // remote) — direction flips which side is "fetch_from" vs "recipient".
        let replicator = Replicator::new(
            source.clone() as Arc<dyn Adapter>,
            target.clone() as Arc<dyn Adapter>,
            Direction::Push,
            ReplicationMode::OneShot,
            DatabaseConfig::default(),
        );
        let stats = replicator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.docs_written, 1);
        assert!(source.get("a", Default::default()).await.is_ok());
    }

    #[tokio::test]
    async fn pull_replicates_attachment_bytes_along_with_the_document() {
        let source = Arc::new(MemoryAdapter::new("source"));
        put(&source, "a", 1).await;
        let rev = source.get("a", Default::default()).await.unwrap().rev.unwrap().to_string();
        source.put_attachment("a", "note.txt", &rev, b"hello attachment".to_vec(), "text/plain").await.unwrap();

        let target = Arc::new(MemoryAdapter::new("target"));
        let replicator = Replicator::new(
            source.clone() as Arc<dyn Adapter>,
            target.clone() as Arc<dyn Adapter>,
            Direction::Pull,
            ReplicationMode::OneShot,
            DatabaseConfig::default(),
        );
        let stats = replicator.run(CancellationToken::new()).await.unwrap();
        assert_eq!(stats.docs_written, 1);

        let bytes = target.get_attachment("a", "note.txt", GetAttachmentOptions::default()).await.unwrap();
        assert_eq!(bytes, b"hello attachment");
    }

    #[tokio::test]
    async fn pull_with_doc_ids_only_copies_the_allowed_documents() {
        let source = Arc::new(MemoryAdapter::new("source"));
        put(&source, "a", 1).await;
        put(&source, "b", 2).await;
        let target = Arc::new(MemoryAdapter::new("target"));

        let replicator = Replicator::new(
            source.clone() as Arc<dyn Adapter>,
            target.clone() as Arc<dyn Adapter>,
            Direction::Pull,
            ReplicationMode::OneShot,
            DatabaseConfig::default(),
        )
        .with_doc_ids(vec!["a".to_string()]);
        let stats = replicator.run(CancellationToken::new()).await.unwrap();

        assert_eq!(stats.docs_written, 1);
        assert!(target.get("a", Default::default()).await.is_ok());
        assert!(target.get("b", Default::default()).await.is_err());
    }

    #[test]
    fn replication_id_differs_by_filter_and_by_doc_allowlist() {
        let base = replication_id("source", "target", None, &HashMap::new(), None);

        let mut params_a = HashMap::new();
        params_a.insert("type".to_string(), "person".to_string());
        let filtered_a = replication_id("source", "target", Some("by_type"), &params_a, None);

        let mut params_b = HashMap::new();
        params_b.insert("type".to_string(), "city".to_string());
        let filtered_b = replication_id("source", "target", Some("by_type"), &params_b, None);

        let allowlisted = replication_id("source", "target", None, &HashMap::new(), Some(&["a".to_string()]));

        assert_ne!(base, filtered_a, "a filter must change the checkpoint id");
        assert_ne!(filtered_a, filtered_b, "different filter params must change the checkpoint id");
        assert_ne!(base, allowlisted, "a doc allowlist must change the checkpoint id");
    }

    #[test]
    fn replication_id_is_insensitive_to_filter_param_insertion_order() {
        let mut params_a = HashMap::new();
        params_a.insert("type".to_string(), "person".to_string());
        params_a.insert("city".to_string(), "nyc".to_string());

        let mut params_b = HashMap::new();
        params_b.insert("city".to_string(), "nyc".to_string());
        params_b.insert("type".to_string(), "person".to_string());

        assert_eq!(
            replication_id("source", "target", Some("by_type"), &params_a, None),
            replication_id("source", "target", Some("by_type"), &params_b, None),
        );
    }
}
