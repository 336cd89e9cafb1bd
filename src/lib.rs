//! kvconf keeps a typed, possibly nested configuration structure in sync with a
//! flat remote key-value store.
//!
//! Every leaf of a configuration structure lives at its own `/`-joined key under
//! a per-service base path (`Logging/File`, `Port`, ...). The crate converts
//! between the two shapes, pushes and pulls whole trees, and keeps long-running
//! watches that republish the decoded structure whenever the remote subtree
//! changes.
//!
//! ## Core Components
//! - [`codec`]: Flattening structures into key paths and back.
//! - [`engine`]: An in-process store backend with long-poll change detection.
//! - [`sdk`]: The [`sdk::ConfigurationClient`], token renewal, the TCP store
//!   adapter and the watch engine.
//! - [`server`]: TCP daemon exposing a store over a line protocol.

pub mod codec;
pub mod engine;
pub mod sdk;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by kvconf.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not be reached.
    #[error("connection error: {0}")]
    Connection(String),
    /// The backend rejected the access token.
    #[error("authorization denied: {0}")]
    Authorization(String),
    /// A value could not be mapped onto key/value pairs.
    #[error("encoding error: {0}")]
    Encoding(String),
    /// Stored data could not be decoded into the requested type.
    #[error("decoding error: {0}")]
    Decoding(String),
    /// The requested key does not exist.
    #[error("key not found: {0}")]
    KeyNotFound(String),
    /// No backend is known for the configured store type.
    #[error("unsupported configuration store type: {0}")]
    UnsupportedStoreType(String),
    /// The provider URL could not be parsed.
    #[error("invalid configuration provider url: {0}")]
    InvalidProviderUrl(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred on a network connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Prefixes connection failures with the operation that hit them.
    pub(crate) fn context(self, operation: &str) -> Self {
        match self {
            Error::Connection(msg) => Error::Connection(format!("{}: {}", operation, msg)),
            Error::Io(e) => Error::Connection(format!("{}: {}", operation, e)),
            other => other,
        }
    }
}

/// A specialized Result type for kvconf operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Flat key/value pairs, ordered by key.
pub type ConfigTree = BTreeMap<String, Vec<u8>>;

/// Opaque change marker handed out by a backend's [`KvStore::fetch_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(u64);

impl Cursor {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

/// Result of one [`KvStore::fetch_changed`] round.
#[derive(Debug, Clone, Default)]
pub struct Change {
    /// Subtree contents keyed relative to the requested prefix. Empty when `changed` is false.
    pub pairs: ConfigTree,
    /// Marker to pass to the next fetch.
    pub cursor: Option<Cursor>,
    pub changed: bool,
}

/// Contract every store backend satisfies.
///
/// Every call carries the caller's current access token. Backends report a
/// rejected token as [`Error::Authorization`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Liveness check.
    async fn ping(&self, token: Option<String>) -> Result<()>;
    /// Whether exactly `key` holds a value.
    async fn exists(&self, token: Option<String>, key: &str) -> Result<bool>;
    /// Whether any key lives at `prefix` or below it, matching on segment boundaries.
    async fn exists_any(&self, token: Option<String>, prefix: &str) -> Result<bool>;
    /// Reads one value, failing with [`Error::KeyNotFound`] when absent.
    async fn get(&self, token: Option<String>, key: &str) -> Result<Vec<u8>>;
    /// Writes one value.
    async fn put(&self, token: Option<String>, key: &str, value: &[u8]) -> Result<()>;
    /// Writes `pairs` (relative to `prefix`). Without `overwrite`, keys that
    /// already exist keep their stored value.
    async fn put_tree(&self, token: Option<String>, prefix: &str, pairs: &ConfigTree, overwrite: bool) -> Result<()>;
    /// Returns the subtree under `prefix` once it differs from `cursor`.
    ///
    /// Without a cursor this returns the current subtree immediately with
    /// `changed` set. With one it may block up to a backend-defined wait and
    /// then report `changed == false`.
    async fn fetch_changed(&self, token: Option<String>, prefix: &str, cursor: Option<Cursor>) -> Result<Change>;
    /// Same as [`fetch_changed`](Self::fetch_changed), asking the backend to
    /// give up after `wait`. Backends without a caller-side bound ignore it.
    async fn fetch_changed_within(
        &self,
        token: Option<String>,
        prefix: &str,
        cursor: Option<Cursor>,
        _wait: Duration,
    ) -> Result<Change> {
        self.fetch_changed(token, prefix, cursor).await
    }
}

/// Supplies a fresh access token when the backend rejects the current one.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Joins a key below `prefix`, dropping redundant slashes.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, key),
    }
}

/// Whether `key` lies at or below `prefix` on a path-segment boundary.
pub fn in_subtree(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
