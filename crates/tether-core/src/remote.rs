//! HTTP remote abstraction for the sync endpoints.
//!
//! Per registered data type the server exposes:
//! - `GET {endpoint}/changes?since=<RFC3339>` → array of records, each
//!   optionally tagged `_deleted: true`
//! - `POST {endpoint}` (create)
//! - `PUT {endpoint}/{id}` (update)
//! - `DELETE {endpoint}/{id}` (delete)
//!
//! [`HttpRemote`] is the real client (bounded request timeout so a hung
//! server can't wedge the drain); [`MockRemote`] scripts responses for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("unexpected response shape: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The four sync operations the engine performs against the server.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch server-side deltas since the given timestamp (full fetch when
    /// `since` is None).
    async fn fetch_changes(
        &self,
        endpoint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>>;

    async fn create(&self, endpoint: &str, payload: &Value) -> Result<()>;

    async fn update(&self, endpoint: &str, id: &str, payload: &Value) -> Result<()>;

    async fn delete(&self, endpoint: &str, id: &str) -> Result<()>;
}

/// reqwest-backed [`RemoteApi`].
pub struct HttpRemote {
    client: reqwest::Client,
}

impl HttpRemote {
    /// Build a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn check_status(resp: &reqwest::Response) -> Result<()> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RemoteError::Status {
                status: resp.status().as_u16(),
                url: resp.url().to_string(),
            })
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_changes(
        &self,
        endpoint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        let url = format!("{endpoint}/changes");
        let mut request = self.client.get(&url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let resp = request.send().await?;
        Self::check_status(&resp)?;

        match resp.json::<Value>().await? {
            Value::Array(records) => Ok(records),
            other => Err(RemoteError::Shape(format!(
                "expected array of records from {url}, got {other}"
            ))),
        }
    }

    async fn create(&self, endpoint: &str, payload: &Value) -> Result<()> {
        let resp = self.client.post(endpoint).json(payload).send().await?;
        Self::check_status(&resp)
    }

    async fn update(&self, endpoint: &str, id: &str, payload: &Value) -> Result<()> {
        let url = format!("{endpoint}/{id}");
        let resp = self.client.put(&url).json(payload).send().await?;
        Self::check_status(&resp)
    }

    async fn delete(&self, endpoint: &str, id: &str) -> Result<()> {
        let url = format!("{endpoint}/{id}");
        let resp = self.client.delete(&url).send().await?;
        Self::check_status(&resp)
    }
}

/// A call captured by [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    FetchChanges {
        endpoint: String,
        since: Option<DateTime<Utc>>,
    },
    Create {
        endpoint: String,
        payload: Value,
    },
    Update {
        endpoint: String,
        id: String,
        payload: Value,
    },
    Delete {
        endpoint: String,
        id: String,
    },
}

/// Scriptable in-memory [`RemoteApi`] for tests.
#[derive(Default)]
pub struct MockRemote {
    calls: Mutex<Vec<MockCall>>,
    changes: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the delta batch returned by `fetch_changes` for an endpoint.
    pub fn set_changes(&self, endpoint: &str, records: Vec<Value>) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.to_string(), records);
    }

    /// Make the next `count` calls against an endpoint fail with a 500.
    pub fn fail_times(&self, endpoint: &str, count: u32) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.to_string(), count);
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, call: MockCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn check_failure(&self, endpoint: &str) -> Result<()> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(remaining) = failures.get_mut(endpoint) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Status {
                    status: 500,
                    url: endpoint.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn fetch_changes(
        &self,
        endpoint: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>> {
        self.record(MockCall::FetchChanges {
            endpoint: endpoint.to_string(),
            since,
        });
        self.check_failure(endpoint)?;
        Ok(self
            .changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(endpoint)
            .cloned()
            .unwrap_or_default())
    }

    async fn create(&self, endpoint: &str, payload: &Value) -> Result<()> {
        self.record(MockCall::Create {
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });
        self.check_failure(endpoint)
    }

    async fn update(&self, endpoint: &str, id: &str, payload: &Value) -> Result<()> {
        self.record(MockCall::Update {
            endpoint: endpoint.to_string(),
            id: id.to_string(),
            payload: payload.clone(),
        });
        self.check_failure(endpoint)
    }

    async fn delete(&self, endpoint: &str, id: &str) -> Result<()> {
        self.record(MockCall::Delete {
            endpoint: endpoint.to_string(),
            id: id.to_string(),
        });
        self.check_failure(endpoint)
    }
}
