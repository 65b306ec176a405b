//! Failure classification and recovery for the pull loop.
//!
//! The pull loop runs indefinitely in the background, so its failures never
//! reach a caller. Instead each failure maps to a [`Recovery`] plan: retry,
//! report, probe connectivity, or give up and disconnect.

use std::time::Duration;

use couchsync_common::Error;

/// Failure classes of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// HTTP 401.
    Unauthenticated,
    /// HTTP 404; the database may not be provisioned yet.
    NotYetProvisioned,
    /// HTTP 5xx.
    Server,
    /// Cancelled by the client (disconnect, watchdog, explicit cancel).
    Aborted,
    /// Anything else, including connection failures.
    Unknown,
}

impl From<&Error> for FailureKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::Unauthenticated(_) => FailureKind::Unauthenticated,
            Error::NotFound(_) => FailureKind::NotYetProvisioned,
            Error::Server { .. } => FailureKind::Server,
            Error::Aborted => FailureKind::Aborted,
            _ => FailureKind::Unknown,
        }
    }
}

/// When to issue the next pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Do not pull again.
    Never,
    /// Pull again right away.
    Immediately,
    /// Pull again after a delay.
    After(Duration),
}

/// What the pull loop does after a failure, in order: disconnect, retry,
/// emit the event, probe connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// Tear the connection down.
    pub disconnect: bool,
    /// Next pull.
    pub retry: Retry,
    /// Store event to emit with the error as payload.
    pub event: Option<&'static str>,
    /// Ask the host to check connectivity.
    pub probe: bool,
}

/// Maps failure classes to recovery plans.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    /// Create a policy retrying after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay used for scheduled retries.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Plan the recovery for `kind`, given the connection state at the
    /// time the failure is handled.
    pub fn recovery(&self, kind: FailureKind, connected: bool) -> Recovery {
        match kind {
            FailureKind::Unauthenticated => Recovery {
                disconnect: true,
                retry: Retry::Never,
                event: Some("error:unauthenticated"),
                probe: false,
            },
            FailureKind::NotYetProvisioned => Recovery {
                disconnect: false,
                retry: Retry::After(self.delay),
                event: None,
                probe: false,
            },
            FailureKind::Server => Recovery {
                disconnect: false,
                retry: Retry::After(self.delay),
                event: Some("error:server"),
                probe: true,
            },
            // The disconnect that caused a client abort owns the next state.
            FailureKind::Aborted => Recovery {
                disconnect: false,
                retry: if connected { Retry::Immediately } else { Retry::Never },
                event: None,
                probe: false,
            },
            FailureKind::Unknown => Recovery {
                disconnect: false,
                retry: if connected { Retry::After(self.delay) } else { Retry::Never },
                event: None,
                probe: true,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            FailureKind::from(&Error::from_status(401, "")),
            FailureKind::Unauthenticated
        );
        assert_eq!(
            FailureKind::from(&Error::from_status(404, "")),
            FailureKind::NotYetProvisioned
        );
        assert_eq!(FailureKind::from(&Error::from_status(500, "")), FailureKind::Server);
        assert_eq!(FailureKind::from(&Error::from_status(502, "")), FailureKind::Server);
        assert_eq!(FailureKind::from(&Error::Aborted), FailureKind::Aborted);
        assert_eq!(
            FailureKind::from(&Error::Network("reset".into())),
            FailureKind::Unknown
        );
        assert_eq!(FailureKind::from(&Error::from_status(409, "")), FailureKind::Unknown);
    }

    #[test]
    fn test_unauthenticated_disconnects_without_retry() {
        let recovery = RetryPolicy::default().recovery(FailureKind::Unauthenticated, true);
        assert!(recovery.disconnect);
        assert_eq!(recovery.retry, Retry::Never);
        assert_eq!(recovery.event, Some("error:unauthenticated"));
        assert!(!recovery.probe);
    }

    #[test]
    fn test_not_found_retries_silently() {
        let recovery = RetryPolicy::default().recovery(FailureKind::NotYetProvisioned, false);
        assert_eq!(recovery.retry, Retry::After(Duration::from_secs(3)));
        assert_eq!(recovery.event, None);
        assert!(!recovery.probe);
    }

    #[test]
    fn test_server_error_retries_reports_and_probes() {
        let recovery = RetryPolicy::default().recovery(FailureKind::Server, true);
        assert_eq!(recovery.retry, Retry::After(Duration::from_secs(3)));
        assert_eq!(recovery.event, Some("error:server"));
        assert!(recovery.probe);
    }

    #[test]
    fn test_abort_depends_on_connection() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.recovery(FailureKind::Aborted, true).retry, Retry::Immediately);
        assert_eq!(policy.recovery(FailureKind::Aborted, false).retry, Retry::Never);
    }

    #[test]
    fn test_unknown_retries_only_while_connected() {
        let policy = RetryPolicy::new(Duration::from_millis(250));
        let connected = policy.recovery(FailureKind::Unknown, true);
        assert_eq!(connected.retry, Retry::After(Duration::from_millis(250)));
        assert!(connected.probe);

        let disconnected = policy.recovery(FailureKind::Unknown, false);
        assert_eq!(disconnected.retry, Retry::Never);
        assert!(disconnected.probe);
    }
}
