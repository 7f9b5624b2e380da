//! Remote settings/telemetry store: a hierarchical JSON tree addressed by
//! slash-separated paths, in the style of a realtime database.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store answered HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("remote store sent unreadable data for {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// Minimal JSON tree operations the sync engine needs.
///
/// `put` replaces the value at `path` (null deletes it); `patch` merges the
/// children of an object into `path`, leaving other children untouched.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError>;
    async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError>;
    async fn patch(&self, path: &str, value: &Value) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Firebase Realtime Database over REST
// ---------------------------------------------------------------------------

pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FirebaseStore {
    pub fn new(
        database_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: database_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        match &self.auth_token {
            Some(token) => format!("{}/{path}.json?auth={token}", self.base_url),
            None => format!("{}/{path}.json", self.base_url),
        }
    }

    async fn check(path: &str, resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(RemoteError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            })
        }
    }
}

fn unavailable(e: reqwest::Error) -> RemoteError {
    RemoteError::Unavailable(e.without_url().to_string())
}

#[async_trait]
impl RemoteStore for FirebaseStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(unavailable)?;
        let value: Value = Self::check(path, resp)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Malformed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        let resp = self
            .client
            .put(self.url(path))
            .json(value)
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(path, resp).await.map(|_| ())
    }

    async fn patch(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        let resp = self
            .client
            .patch(self.url(path))
            .json(value)
            .send()
            .await
            .map_err(unavailable)?;
        Self::check(path, resp).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// In-memory tree
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    root: std::sync::Mutex<Value>,
    writes: std::sync::Mutex<usize>,
    offline: std::sync::Mutex<bool>,
}

#[cfg(test)]
fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
fn set_at(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for seg in parents {
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        node = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !node.is_object() {
        *node = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = node {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable store.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut o) = self.offline.lock() {
            *o = offline;
        }
    }

    /// Number of successful `put`/`patch` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    /// Write directly, as a dashboard would, without counting it.
    pub fn seed(&self, path: &str, value: Value) {
        if let Ok(mut root) = self.root.lock() {
            set_at(&mut root, &segments(path), value);
        }
    }

    pub fn snapshot(&self, path: &str) -> Option<Value> {
        let root = self.root.lock().ok()?;
        let mut node = &*root;
        for seg in segments(path) {
            node = node.get(seg)?;
        }
        let found = (!node.is_null()).then(|| node.clone());
        found
    }

    fn guard(&self) -> Result<(), RemoteError> {
        match self.offline.lock() {
            Ok(o) if *o => Err(RemoteError::Unavailable("connection refused".into())),
            _ => Ok(()),
        }
    }

    fn count_write(&self) {
        if let Ok(mut w) = self.writes.lock() {
            *w += 1;
        }
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, RemoteError> {
        self.guard()?;
        Ok(self.snapshot(path))
    }

    async fn put(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        self.guard()?;
        self.seed(path, value.clone());
        self.count_write();
        Ok(())
    }

    async fn patch(&self, path: &str, value: &Value) -> Result<(), RemoteError> {
        self.guard()?;
        let Value::Object(children) = value else {
            return Err(RemoteError::Malformed {
                path: path.to_string(),
                reason: "patch body must be an object".into(),
            });
        };
        for (key, child) in children {
            self.seed(&format!("{path}/{key}"), child.clone());
        }
        self.count_write();
        Ok(())
    }
}
