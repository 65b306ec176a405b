//! Common types shared across the couchsync crates.
//!
//! This module provides the error taxonomy and the document model used by
//! the replication engine, the HTTP transport and the command line tool.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChangeKind, RemoteObject, Revisions};
