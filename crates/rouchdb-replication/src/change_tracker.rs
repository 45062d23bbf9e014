//! Polls a source `Adapter`'s changes feed on behalf of the replicator.
//!
//! The state machine mirrors TouchDB's `TDChangeTracker`: `Idle` until
//! `run` is first polled, `Connecting` while a request is outstanding,
//! `Receiving` once results arrive, and a terminal `Disconnected` (gave up
//! after retrying) or `Stopped` (finished normally or `stop()` was called).
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use rouchdb_core::adapter::Adapter;
use rouchdb_core::auth::Authorizer;
use rouchdb_core::config::DatabaseConfig;
use rouchdb_core::document::{ChangeEvent, ChangesOptions, Seq};
use rouchdb_core::error::{Result, RouchError};

/// A one-shot/long-poll session retries this many times by default when
/// `DatabaseConfig::max_retry_count` doesn't override it; continuous
/// sessions retry indefinitely.
const DEFAULT_ONE_SHOT_RETRY_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerMode {
    /// Fetch one batch and stop, regardless of whether it was empty.
    OneShot,
    /// Fetch, and if the batch was empty, wait and poll again; stop the
    /// first time a non-empty batch comes back.
    LongPoll,
    /// Poll forever (until `stop()` or an unrecoverable error).
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Connecting,
    Receiving,
    Disconnected,
    Stopped,
}

#[derive(Clone)]
pub struct ChangeTrackerOptions {
    pub mode: TrackerMode,
    pub since: Seq,
    pub include_conflicts: bool,
    pub limit: Option<u64>,
    pub doc_ids: Option<Vec<String>>,
    pub selector: Option<serde_json::Value>,
    pub filter: Option<String>,
    pub filter_params: std::collections::HashMap<String, String>,
    /// Consulted once after a 401 to obtain fresh credentials before
    /// retrying; a second consecutive 401 is always fatal.
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

impl std::fmt::Debug for ChangeTrackerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTrackerOptions")
            .field("mode", &self.mode)
            .field("since", &self.since)
            .field("include_conflicts", &self.include_conflicts)
            .field("limit", &self.limit)
            .field("doc_ids", &self.doc_ids)
            .field("selector", &self.selector)
            .field("filter", &self.filter)
            .field("filter_params", &self.filter_params)
            .field("authorizer", &self.authorizer.as_ref().map(|_| "<authorizer>"))
            .finish()
    }
}

impl Default for ChangeTrackerOptions {
    fn default() -> Self {
        Self {
            mode: TrackerMode::OneShot,
            since: Seq::zero(),
            include_conflicts: false,
            limit: None,
            doc_ids: None,
            selector: None,
            filter: None,
            filter_params: Default::default(),
            authorizer: None,
        }
    }
}

/// Drives one polling session against `adapter`'s `changes` feed.
pub struct ChangeTracker {
    adapter: Arc<dyn Adapter>,
    opts: ChangeTrackerOptions,
    config: DatabaseConfig,
    state: RwLock<TrackerState>,
    cancel: CancellationToken,
    retry_count: AtomicU32,
    unauthorized_retried: AtomicBool,
}

impl ChangeTracker {
    pub fn new(adapter: Arc<dyn Adapter>, opts: ChangeTrackerOptions, config: DatabaseConfig) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            opts,
            config,
            state: RwLock::new(TrackerState::Idle),
            cancel: CancellationToken::new(),
            retry_count: AtomicU32::new(0),
            unauthorized_retried: AtomicBool::new(false),
        })
    }

    /// The retry ceiling in effect for this session: `config.max_retry_count`
    /// if set, otherwise unbounded for continuous sessions and
    /// `DEFAULT_ONE_SHOT_RETRY_COUNT` for one-shot/long-poll sessions.
    fn effective_max_retry_count(&self) -> Option<u32> {
        self.config.max_retry_count.or(match self.opts.mode {
            TrackerMode::Continuous => None,
            TrackerMode::OneShot | TrackerMode::LongPoll => Some(DEFAULT_ONE_SHOT_RETRY_COUNT),
        })
    }

    pub async fn state(&self) -> TrackerState {
        *self.state.read().await
    }

    /// Ask the tracker to stop at the next opportunity. `run` returns
    /// `Ok(())` with state `Stopped` rather than erroring.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the poll loop, forwarding each change through `tx` in arrival
    /// order. Returns the sequence last observed, whether `run` stopped
    /// because the feed reached its mode's natural end or because
    /// `stop()`/channel-close intervened.
    pub async fn run(self: Arc<Self>, tx: mpsc::Sender<ChangeEvent>) -> Result<Seq> {
        *self.state.write().await = TrackerState::Connecting;
        let mut since = self.opts.since.clone();

        loop {
            if self.cancel.is_cancelled() {
                *self.state.write().await = TrackerState::Stopped;
                return Ok(since);
            }

            let changes_opts = ChangesOptions {
                since: since.clone(),
                limit: self.opts.limit,
                descending: false,
                include_docs: true,
                include_conflicts: self.opts.include_conflicts,
                live: false,
                doc_ids: self.opts.doc_ids.clone(),
                selector: self.opts.selector.clone(),
                filter: self.opts.filter.clone(),
                filter_params: self.opts.filter_params.clone(),
            };

            match self.adapter.changes(changes_opts).await {
                Ok(response) => {
                    self.retry_count.store(0, AtomicOrdering::SeqCst);
                    self.unauthorized_retried.store(false, AtomicOrdering::SeqCst);
                    *self.state.write().await = TrackerState::Receiving;
                    let got_any = !response.results.is_empty();
                    since = response.last_seq;

                    for event in response.results {
                        if tx.send(event).await.is_err() {
                            *self.state.write().await = TrackerState::Stopped;
                            return Ok(since);
                        }
                    }

                    match self.opts.mode {
                        TrackerMode::OneShot => {
                            *self.state.write().await = TrackerState::Stopped;
                            return Ok(since);
                        }
                        TrackerMode::LongPoll if got_any => {
                            *self.state.write().await = TrackerState::Stopped;
                            return Ok(since);
                        }
                        TrackerMode::LongPoll | TrackerMode::Continuous => {
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.change_tracker_heartbeat) => {}
                                _ = self.cancel.cancelled() => {}
                            }
                        }
                    }
                }
                Err(RouchError::Unauthorized) => {
                    let already_retried = self.unauthorized_retried.swap(true, AtomicOrdering::SeqCst);
                    let refreshed = !already_retried
                        && self.opts.authorizer.as_ref().map(|a| a.refresh()).unwrap_or(false);
                    if !refreshed {
                        *self.state.write().await = TrackerState::Disconnected;
                        return Err(RouchError::Unauthorized);
                    }
                    // Credentials refreshed; retry immediately without
                    // consuming the ordinary retry budget.
                }
                Err(e) => {
                    let retries = self.retry_count.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    let exhausted = match self.effective_max_retry_count() {
                        Some(max) => retries > max,
                        None => false,
                    };
                    if exhausted || !e.is_retryable() {
                        *self.state.write().await = TrackerState::Disconnected;
                        return Err(e);
                    }
                    tokio::time::sleep(backoff_delay(retries)).await;
                }
            }
        }
    }
}

fn backoff_delay(retries: u32) -> Duration {
    let capped = retries.min(6);
    Duration::from_millis(250u64 * 2u64.pow(capped))
}
