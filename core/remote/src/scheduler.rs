//! Timer scheduling for watchdogs and retry delays.
//!
//! The pull engine never sleeps itself; it asks a [`Scheduler`] to run a
//! callback later and keeps the returned [`TimerHandle`] so the callback can
//! be cancelled on disconnect.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Callback run when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Create a handle that is not yet cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the callback from running. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`TimerHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Capability to run a callback after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the handle is cancelled.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Scheduler backed by tokio timers.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let token = handle.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Timer cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        task();
                    }
                }
            }
        });
        handle
    }
}

struct ManualTimer {
    due: Duration,
    delay: Duration,
    handle: TimerHandle,
    task: TimerTask,
}

/// Scheduler driven by virtual time, for deterministic tests.
///
/// Nothing fires until [`ManualScheduler::advance`] moves the clock.
#[derive(Default)]
pub struct ManualScheduler {
    now: Mutex<Duration>,
    timers: Mutex<Vec<ManualTimer>>,
}

impl ManualScheduler {
    /// Create a scheduler at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn now_guard(&self) -> MutexGuard<'_, Duration> {
        self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timers_guard(&self) -> MutexGuard<'_, Vec<ManualTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        *self.now_guard()
    }

    /// Delays of the timers that are still armed, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.timers_guard()
            .iter()
            .filter(|timer| !timer.handle.is_cancelled())
            .map(|timer| timer.delay)
            .collect()
    }

    /// Move virtual time forward and run every timer that became due,
    /// including timers scheduled by callbacks along the way.
    ///
    /// Returns the number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = {
            let mut now = self.now_guard();
            *now += by;
            *now
        };

        let mut fired = 0;
        loop {
            let next = {
                let mut timers = self.timers_guard();
                timers.retain(|timer| !timer.handle.is_cancelled());
                let position = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, timer)| timer.due <= target)
                    .min_by_key(|(_, timer)| timer.due)
                    .map(|(index, _)| index);
                position.map(|index| timers.remove(index))
            };

            let Some(timer) = next else {
                break;
            };
            if !timer.handle.is_cancelled() {
                (timer.task)();
                fired += 1;
            }
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let due = self.now() + delay;
        self.timers_guard().push(ManualTimer {
            due,
            delay,
            handle: handle.clone(),
            task,
        });
        handle
    }
}
