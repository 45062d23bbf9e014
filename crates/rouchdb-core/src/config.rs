/// Centralized configuration for a database instance and the replication
/// sessions it participates in (§6 "Configuration options").
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Non-empty; lowercase recommended (not enforced, matching CouchDB's
    /// own leniency for local databases).
    pub name: String,
    /// Revision-tree branches deeper than this many generations below a
    /// leaf are pruned on compaction.
    pub compaction_depth: u64,
    /// Revisions per replication batch/transaction.
    pub replicator_batch_size: usize,
    /// Maximum concurrent in-flight document fetches during a pull.
    pub replicator_fetch_fanout: usize,
    /// Change-tracker heartbeat for long-poll/continuous feeds.
    pub change_tracker_heartbeat: Duration,
    /// Per-HTTP-request timeout. Long-poll requests extend this so it
    /// comfortably exceeds the server's heartbeat.
    pub http_request_timeout: Duration,
    /// Explicit retry-count ceiling. `None` (the default) means "derive it
    /// from the session's mode at the point of use": continuous sessions
    /// retry indefinitely, one-shot/long-poll sessions stop after 3. Set
    /// this to override that default for either kind of session.
    pub max_retry_count: Option<u32>,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            compaction_depth: 1000,
            replicator_batch_size: 100,
            replicator_fetch_fanout: 4,
            change_tracker_heartbeat: Duration::from_secs(30),
            http_request_timeout: Duration::from_secs(60),
            max_retry_count: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.compaction_depth, 1000);
        assert_eq!(cfg.replicator_batch_size, 100);
        assert_eq!(cfg.replicator_fetch_fanout, 4);
        assert_eq!(cfg.change_tracker_heartbeat, Duration::from_secs(30));
        assert_eq!(cfg.http_request_timeout, Duration::from_secs(60));
        assert!(cfg.max_retry_count.is_none());
    }
}
