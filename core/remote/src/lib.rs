//! Replication engine for CouchDB-style document databases.
//!
//! A [`RemoteStore`] keeps a local store eventually consistent with one
//! remote database:
//!
//! - [`RemoteStore::push`] writes batches with client-allocated revisions,
//! - [`RemoteStore::pull`] consumes the change feed and emits namespaced
//!   change events,
//! - [`RemoteStore::connect`] turns pulling into a self-healing long-poll
//!   loop until [`RemoteStore::disconnect`].
//!
//! HTTP, timers, the event bus and id generation are injected; see
//! [`Transport`], [`Scheduler`], [`EventBus`] and [`IdGenerator`].

pub mod codec;
pub mod config;
pub mod connection;
pub mod events;
pub mod pull;
mod push;
pub mod retry;
pub mod revision;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod transport;

pub use config::RemoteConfig;
pub use connection::{ConnectionState, ConnectivityProbe, NoopProbe};
pub use events::{EventBus, EventNamespace, EventPayload, Handler, MemoryBus};
pub use pull::{PullOutcome, PullSummary};
pub use retry::{FailureKind, Recovery, Retry, RetryPolicy};
pub use revision::{IdGenerator, UuidGenerator};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use store::{RemoteStore, RemoteStoreBuilder};
pub use task::Task;
pub use transport::{Method, MockTransport, RecordedRequest, RequestOptions, Transport};

pub use couchsync_common::{ChangeKind, Error, RemoteObject, Result, Revisions};
