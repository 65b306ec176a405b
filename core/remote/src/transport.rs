//! Transport contract between the replication engine and HTTP.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use couchsync_common::Result;

/// JSON content type used for every request.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether the method carries a request body.
    pub fn has_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request options.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Always `application/json`.
    pub content_type: &'static str,
    /// Expected response type, `Some("json")` for POST and PUT.
    pub data_type: Option<&'static str>,
    /// Whether the body may be transformed by the transport. Always false
    /// for POST and PUT: the body is sent as serialized JSON.
    pub process_data: bool,
    /// JSON body.
    pub body: Option<Value>,
}

impl RequestOptions {
    /// Options for a JSON request with the given method and body.
    pub fn json(method: Method, body: Option<Value>) -> Self {
        if method.has_body() {
            Self {
                content_type: JSON_CONTENT_TYPE,
                data_type: Some("json"),
                process_data: false,
                body,
            }
        } else {
            Self {
                content_type: JSON_CONTENT_TYPE,
                data_type: None,
                process_data: true,
                body,
            }
        }
    }
}

/// Sends requests to the remote database.
///
/// Implementations classify failures with
/// [`couchsync_common::Error::from_status`] and report dropped connections
/// as `Error::Network`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a request and return the decoded JSON body.
    async fn request(&self, method: Method, path: &str, options: RequestOptions) -> Result<Value>;
}

/// A request observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub options: RequestOptions,
}

/// A scripted transport for testing.
///
/// Responses are consumed in order. A request arriving with no scripted
/// response stays pending forever, like an idle long-poll.
#[derive(Default)]
pub struct MockTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    responses: Mutex<VecDeque<Result<Value>>>,
    arrived: Notify,
}

impl MockTransport {
    /// Create a transport with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    fn requests_guard(&self) -> MutexGuard<'_, Vec<RecordedRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn responses_guard(&self) -> MutexGuard<'_, VecDeque<Result<Value>>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the result of the next unanswered request.
    pub fn respond(&self, response: Result<Value>) {
        self.responses_guard().push_back(response);
    }

    /// All requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests_guard().clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests_guard().len()
    }

    /// Wait until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        loop {
            let arrived = self.arrived.notified();
            if self.request_count() >= count {
                return;
            }
            arrived.await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, method: Method, path: &str, options: RequestOptions) -> Result<Value> {
        self.requests_guard().push(RecordedRequest {
            method,
            path: path.to_string(),
            options,
        });
        let response = self.responses_guard().pop_front();
        self.arrived.notify_waiters();

        match response {
            Some(response) => response,
            None => futures::future::pending().await,
        }
    }
}
