//! Connection lifecycle.
//!
//! A store is either `Disconnected` (initial) or `Connected`. While
//! connected the pull loop long-polls the change feed; disconnecting
//! cancels the outstanding pull and push requests as well as any scheduled
//! retry.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::EventPayload;
use crate::pull::PullOutcome;
use crate::scheduler::TimerHandle;
use crate::store::RemoteStore;
use crate::task::Task;

/// Host capability to re-check network reachability after failures.
pub trait ConnectivityProbe: Send + Sync {
    /// Check whether the remote is reachable.
    fn check_connection(&self);
}

/// Probe that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

impl ConnectivityProbe for NoopProbe {
    fn check_connection(&self) {}
}

#[derive(Debug)]
struct PullHandle {
    id: u64,
    token: CancellationToken,
    watchdog: Option<TimerHandle>,
}

impl PullHandle {
    fn cancel(&self) {
        self.token.cancel();
        if let Some(watchdog) = &self.watchdog {
            watchdog.cancel();
        }
    }
}

#[derive(Debug)]
struct PushHandle {
    id: u64,
}

/// Connection flag plus the handles of the requests it owns.
///
/// Every request gets an id; a response is only acted upon while its id is
/// still the active handle, so responses arriving after a cancellation are
/// recognized as stale.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: bool,
    epoch: u64,
    next_id: u64,
    pull: Option<PullHandle>,
    push: Option<PushHandle>,
    push_scope: CancellationToken,
    retry: Option<TimerHandle>,
}

impl ConnectionState {
    /// Create a disconnected state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the store is connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Incremented by every disconnect.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a pull request is outstanding.
    pub fn is_pulling(&self) -> bool {
        self.pull.is_some()
    }

    /// Whether a push request is outstanding.
    pub fn is_pushing(&self) -> bool {
        self.push.is_some()
    }

    /// Whether a pull retry is scheduled.
    pub fn has_pending_retry(&self) -> bool {
        self.retry.as_ref().is_some_and(|retry| !retry.is_cancelled())
    }

    /// Enter the connected state.
    pub fn connect(&mut self) {
        self.connected = true;
    }

    /// Enter the disconnected state and cancel everything in flight.
    /// Safe to call with nothing outstanding.
    pub fn disconnect(&mut self) {
        self.connected = false;
        self.epoch += 1;

        if let Some(pull) = self.pull.take() {
            pull.cancel();
        }
        if self.push.take().is_some() {
            debug!("Cancelling outstanding push");
        }
        self.push_scope.cancel();
        self.push_scope = CancellationToken::new();
        if let Some(retry) = self.retry.take() {
            retry.cancel();
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a new pull request, superseding any outstanding one and
    /// any scheduled retry.
    pub fn begin_pull(&mut self) -> (u64, CancellationToken) {
        if let Some(previous) = self.pull.take() {
            previous.cancel();
        }
        if let Some(retry) = self.retry.take() {
            retry.cancel();
        }

        let id = self.allocate_id();
        let token = CancellationToken::new();
        self.pull = Some(PullHandle {
            id,
            token: token.clone(),
            watchdog: None,
        });
        (id, token)
    }

    /// Attach the long-poll watchdog to pull `id`. The watchdog is cancelled
    /// right away if that request is no longer active.
    pub fn arm_watchdog(&mut self, id: u64, watchdog: TimerHandle) {
        match self.pull.as_mut() {
            Some(pull) if pull.id == id => {
                if let Some(previous) = pull.watchdog.replace(watchdog) {
                    previous.cancel();
                }
            }
            _ => watchdog.cancel(),
        }
    }

    /// Abort pull `id` while keeping it the active handle, so its response
    /// is handled as a client abort. Returns false for a stale id.
    pub fn abort_pull(&mut self, id: u64) -> bool {
        match &self.pull {
            Some(pull) if pull.id == id => {
                pull.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Release pull `id` and disarm its watchdog. Returns false when the
    /// response is stale and must be ignored.
    pub fn finish_pull(&mut self, id: u64) -> bool {
        if !self.pull.as_ref().is_some_and(|pull| pull.id == id) {
            return false;
        }
        if let Some(watchdog) = self.pull.take().and_then(|pull| pull.watchdog) {
            watchdog.cancel();
        }
        true
    }

    /// Register a new push request. Its token is cancelled by the next
    /// disconnect.
    pub fn begin_push(&mut self) -> (u64, CancellationToken) {
        let id = self.allocate_id();
        self.push = Some(PushHandle { id });
        (id, self.push_scope.child_token())
    }

    /// Release push `id` if it is still the tracked handle.
    pub fn finish_push(&mut self, id: u64) {
        if self.push.as_ref().is_some_and(|push| push.id == id) {
            self.push = None;
        }
    }

    /// Track a scheduled retry, replacing any previous one.
    pub fn set_retry(&mut self, retry: TimerHandle) {
        if let Some(previous) = self.retry.replace(retry) {
            previous.cancel();
        }
    }
}

impl RemoteStore {
    /// Whether the store is connected. Has no side effects.
    pub fn is_connected(&self) -> bool {
        self.inner.state().is_connected()
    }

    /// Connect and bootstrap.
    ///
    /// Emits `bootstrap:start`, then performs the initial pull; the returned
    /// task resolves with that pull's outcome.
    pub fn connect(&self) -> Task<PullOutcome> {
        self.inner.state().connect();
        info!(store = %self.name(), "Connected");
        self.trigger("bootstrap:start", EventPayload::Empty);
        self.bootstrap()
    }

    /// Disconnect, cancelling outstanding requests and scheduled retries.
    pub fn disconnect(&self) {
        self.inner.state().disconnect();
        info!(store = %self.name(), "Disconnected");
    }

    /// Pull once and emit `bootstrap:end` when the pull succeeds.
    pub fn bootstrap(&self) -> Task<PullOutcome> {
        let pull = self.pull();
        let store = self.clone();
        Task::spawn(pull.cancel_token(), async move {
            let outcome = pull.await?;
            if outcome.is_applied() {
                store.trigger("bootstrap:end", EventPayload::Empty);
            }
            Ok(outcome)
        })
    }
}
