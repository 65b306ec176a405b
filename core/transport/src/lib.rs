//! HTTP transport for the replication engine, backed by reqwest.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use couchsync_common::{Error, Result};
use couchsync_remote::transport::{Method, RequestOptions, Transport};

/// Transport talking to a CouchDB-compatible server.
///
/// Store paths such as `/db/_changes?...` are resolved against the server
/// URL; absolute URLs (from a store `base_url`) are used as they are.
pub struct HttpTransport {
    http: Client,
    server: Url,
    credentials: Option<(String, String)>,
}

impl HttpTransport {
    /// Create a transport for `server`, e.g. `http://localhost:5984`.
    pub fn new(server: &str) -> Result<Self> {
        Self::with_client(server, Self::client_builder())
    }

    /// Create a transport whose requests time out after `timeout`.
    ///
    /// The timeout must exceed the long-poll heartbeat.
    pub fn with_timeout(server: &str, timeout: Duration) -> Result<Self> {
        Self::with_client(server, Self::client_builder().timeout(timeout))
    }

    fn client_builder() -> reqwest::ClientBuilder {
        Client::builder().user_agent(concat!("couchsync/", env!("CARGO_PKG_VERSION")))
    }

    fn with_client(server: &str, builder: reqwest::ClientBuilder) -> Result<Self> {
        let server = Url::parse(server)
            .map_err(|e| Error::InvalidInput(format!("Invalid server URL {}: {}", server, e)))?;
        let http = builder
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            server,
            credentials: None,
        })
    }

    /// Authenticate every request with HTTP basic auth.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Server URL requests are resolved against.
    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Resolve a store path to a full URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            return Ok(url);
        }
        // Keep percent-encoded segments intact: join the raw path onto the
        // server root instead of letting Url re-normalize it.
        let base = self.server.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path))
            .map_err(|e| Error::InvalidInput(format!("Invalid request path {}: {}", path, e)))
    }

    async fn handle_response(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response: {}", e)))?;

        if status.is_success() {
            if body.is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_slice(&body)?)
        } else {
            Err(Error::from_status(status.as_u16(), error_message(status, &body)))
        }
    }
}

/// Message for a failed request, from CouchDB's `{error, reason}` body when
/// present.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => {
            let error = value.get("error").and_then(Value::as_str);
            let reason = value.get("reason").and_then(Value::as_str);
            match (error, reason) {
                (Some(error), Some(reason)) => format!("{}: {}", error, reason),
                (Some(error), None) => error.to_string(),
                _ => status.to_string(),
            }
        }
        Err(_) if body.is_empty() => status.to_string(),
        Err(_) => format!("{} - {}", status, String::from_utf8_lossy(body)),
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: Method, path: &str, options: RequestOptions) -> Result<Value> {
        let url = self.resolve(path)?;
        debug!(%method, %url, "HTTP request");

        let mut request = self
            .http
            .request(to_reqwest(method), url)
            .header(CONTENT_TYPE, options.content_type)
            .header(ACCEPT, options.content_type);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        if let Some(body) = &options.body {
            request = request.body(serde_json::to_vec(body)?);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Request failed: {}", e)))?;
        self.handle_response(response).await
    }
}
