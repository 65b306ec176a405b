//! Pull engine: change-feed consumption.
//!
//! While connected, every `pull()` long-polls `_changes` and, once a batch is
//! processed, immediately pulls again. Failures are classified and recovered
//! from in the background (see [`crate::retry`]); they never reject outward.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use couchsync_common::{ChangeKind, Error, RemoteObject, Result};

use crate::codec;
use crate::events::EventPayload;
use crate::retry::{FailureKind, Retry};
use crate::store::RemoteStore;
use crate::task::{cancellable, Task};
use crate::transport::Method;

/// Result of a single pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The batch was received and processed.
    Applied(PullSummary),
    /// The request failed; recovery is already under way.
    Failed(FailureKind),
    /// A newer pull or a disconnect replaced this request; its response
    /// was ignored.
    Superseded,
}

impl PullOutcome {
    /// Whether the batch was processed.
    pub fn is_applied(&self) -> bool {
        matches!(self, PullOutcome::Applied(_))
    }
}

/// Counters for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// Rows without a document or outside the store prefix.
    pub skipped: usize,
    /// Checkpoint after the batch.
    pub checkpoint: u64,
}

/// Checkpoint and known-object bookkeeping, private to one store.
#[derive(Debug, Default)]
pub(crate) struct FeedState {
    checkpoint: u64,
    known: HashSet<(String, String)>,
}

impl FeedState {
    pub(crate) fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub(crate) fn set_checkpoint(&mut self, checkpoint: u64) {
        self.checkpoint = checkpoint;
    }

    /// Move the checkpoint forward; never backwards.
    fn advance(&mut self, seq: u64) {
        self.checkpoint = self.checkpoint.max(seq);
    }

    pub(crate) fn is_known(&self, object_type: &str, id: &str) -> bool {
        self.known
            .contains(&(object_type.to_string(), id.to_string()))
    }

    /// Classify a change and record it in the known-object set.
    fn classify(&mut self, object: &RemoteObject) -> ChangeKind {
        let key = (object.object_type.clone(), object.id.clone());
        if object.deleted {
            self.known.remove(&key);
            ChangeKind::Remove
        } else if self.known.insert(key) {
            ChangeKind::Add
        } else {
            ChangeKind::Update
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesFeed {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    #[serde(default)]
    seq: Option<Value>,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Map<String, Value>>,
}

/// Numeric part of a feed sequence. Accepts plain numbers and
/// `"<n>-<opaque>"` strings.
fn sequence_number(seq: &Value) -> Option<u64> {
    match seq {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => {
            let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Events emitted for one change, in emission order.
pub fn change_events(kind: ChangeKind, object: &RemoteObject) -> Vec<(String, EventPayload)> {
    let object_type = &object.object_type;
    let id = &object.id;
    let object_payload = || EventPayload::Object(object.clone());
    let change_payload = || EventPayload::Change(kind, object.clone());

    vec![
        (kind.to_string(), object_payload()),
        (format!("{}:{}", kind, object_type), object_payload()),
        (format!("{}:{}:{}", kind, object_type, id), object_payload()),
        ("change".to_string(), change_payload()),
        (format!("change:{}", object_type), change_payload()),
        (format!("change:{}:{}", object_type, id), change_payload()),
    ]
}

impl RemoteStore {
    /// Fetch changes since the checkpoint.
    ///
    /// While connected this is a long-poll guarded by a watchdog; otherwise a
    /// one-shot request. Any outstanding pull is superseded. The task
    /// resolves once the response has been handled and never fails because
    /// of the remote.
    pub fn pull(&self) -> Task<PullOutcome> {
        let (request_id, token, connected) = {
            let mut state = self.inner.state();
            let (request_id, token) = state.begin_pull();
            (request_id, token, state.is_connected())
        };

        let since = self.checkpoint();
        let heartbeat = connected.then_some(self.inner.config.heartbeat_ms);
        let path = self.path(&format!("/{}", codec::changes_query(since, heartbeat)));

        if connected {
            self.arm_watchdog(request_id);
        }
        debug!(store = %self.name(), since, longpoll = connected, "Pulling changes");

        let store = self.clone();
        let request_token = token.clone();
        Task::spawn(token, async move {
            let result = cancellable(&request_token, store.send(Method::Get, &path, None)).await;
            Ok(store.finish_pull(request_id, result))
        })
    }

    fn arm_watchdog(&self, request_id: u64) {
        let weak = Arc::downgrade(&self.inner);
        let watchdog = self.inner.scheduler.schedule(
            self.inner.config.watchdog(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    RemoteStore::from_inner(inner).restart_pull(request_id);
                }
            }),
        );
        self.inner.state().arm_watchdog(request_id, watchdog);
    }

    /// Abort a long-poll that stayed silent past the watchdog timeout. The
    /// abort is then handled like any client abort.
    fn restart_pull(&self, request_id: u64) {
        if self.inner.state().abort_pull(request_id) {
            debug!(store = %self.name(), "Long-poll watchdog fired, restarting pull");
        }
    }

    fn finish_pull(&self, request_id: u64, result: Result<Value>) -> PullOutcome {
        if !self.inner.state().finish_pull(request_id) {
            debug!(store = %self.name(), "Ignoring response of superseded pull");
            return PullOutcome::Superseded;
        }

        match result.and_then(|body| self.apply_changes(body)) {
            Ok(summary) => {
                if self.is_connected() {
                    self.pull();
                }
                PullOutcome::Applied(summary)
            }
            Err(err) => PullOutcome::Failed(self.recover(err)),
        }
    }

    fn apply_changes(&self, body: Value) -> Result<PullSummary> {
        let feed: ChangesFeed = serde_json::from_value(body)
            .map_err(|e| Error::Serialization(format!("Invalid change feed: {}", e)))?;
        let prefix = &self.inner.config.prefix;

        let mut summary = PullSummary::default();
        let mut events = Vec::new();
        {
            let mut state = self.inner.feed();
            let mut highest: Option<u64> = None;

            for row in feed.results {
                if let Some(seq) = row.seq.as_ref().and_then(sequence_number) {
                    highest = Some(highest.map_or(seq, |h| h.max(seq)));
                }
                let Some(mut object) = row
                    .doc
                    .as_ref()
                    .and_then(|doc| codec::from_document(doc, prefix))
                else {
                    summary.skipped += 1;
                    continue;
                };
                object.deleted |= row.deleted;

                let kind = state.classify(&object);
                match kind {
                    ChangeKind::Add => summary.added += 1,
                    ChangeKind::Update => summary.updated += 1,
                    ChangeKind::Remove => summary.removed += 1,
                }
                events.extend(change_events(kind, &object));
            }

            if let Some(seq) = feed.last_seq.as_ref().and_then(sequence_number).or(highest) {
                state.advance(seq);
            }
            summary.checkpoint = state.checkpoint();
        }

        debug!(
            store = %self.name(),
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            checkpoint = summary.checkpoint,
            "Applied change batch"
        );
        for (event, payload) in events {
            self.trigger(&event, payload);
        }
        Ok(summary)
    }

    /// Carry out the recovery plan for a failed pull.
    fn recover(&self, err: Error) -> FailureKind {
        let kind = FailureKind::from(&err);
        let recovery = self.inner.policy.recovery(kind, self.is_connected());
        if kind == FailureKind::Aborted {
            debug!(store = %self.name(), "Pull aborted");
        } else {
            warn!(store = %self.name(), ?kind, error = %err, "Pull failed");
        }

        if recovery.disconnect {
            self.disconnect();
        }
        match recovery.retry {
            Retry::Never => {}
            Retry::Immediately => {
                self.pull();
            }
            Retry::After(delay) => self.schedule_retry(delay),
        }
        if let Some(event) = recovery.event {
            self.trigger(event, EventPayload::Error(err));
        }
        if recovery.probe {
            self.inner.probe.check_connection();
        }
        kind
    }

    /// Pull again after `delay`, unless a disconnect happens first.
    fn schedule_retry(&self, delay: Duration) {
        let epoch = self.inner.state().epoch();
        let weak = Arc::downgrade(&self.inner);
        let retry = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let store = RemoteStore::from_inner(inner);
                if store.inner.state().epoch() != epoch {
                    debug!(store = %store.name(), "Dropping retry scheduled before disconnect");
                    return;
                }
                store.pull();
            }),
        );
        debug!(store = %self.name(), ?delay, "Scheduled pull retry");
        self.inner.state().set_retry(retry);
    }

    /// Current checkpoint; 0 until the first batch.
    pub fn checkpoint(&self) -> u64 {
        self.inner.feed().checkpoint()
    }

    /// Override the checkpoint.
    pub fn set_checkpoint(&self, checkpoint: u64) {
        self.inner.feed().set_checkpoint(checkpoint);
    }

    /// Whether the object was seen by a previous pull and not removed since.
    pub fn is_known_object(&self, object_type: &str, id: &str) -> bool {
        self.inner.feed().is_known(object_type, id)
    }
}
