use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{in_subtree, join_key, Change, ConfigTree, Cursor, Error, KvStore, Result};

/// Default bound on how long [`MemStore::fetch_changed`] waits for a change.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    modify_index: u64,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
}

/// In-process key/value backend.
///
/// Every write stamps the keys it touches with a new modify index; the cursor
/// of a subtree is the highest modify index below it, so `fetch_changed` can
/// long-poll until that number moves.
pub struct MemStore {
    state: RwLock<State>,
    index_tx: watch::Sender<u64>,
    access_token: RwLock<Option<String>>,
    wait_time: Duration,
}

impl MemStore {
    pub fn new(initial_data: ConfigTree) -> Self {
        let index = if initial_data.is_empty() { 0 } else { 1 };
        let entries = initial_data
            .into_iter()
            .map(|(key, value)| (key, Entry { value, modify_index: index }))
            .collect();
        let (index_tx, _) = watch::channel(index);
        Self {
            state: RwLock::new(State { entries, index }),
            index_tx,
            access_token: RwLock::new(None),
            wait_time: DEFAULT_WAIT_TIME,
        }
    }

    /// Sets how long a `fetch_changed` with a cursor blocks before reporting no change.
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Requires every call to present `token`. `None` disables the check.
    pub fn with_access_token(self, token: Option<String>) -> Self {
        self.set_access_token(token);
        self
    }

    /// Replaces the accepted access token, invalidating the previous one.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn authorize(&self, token: &Option<String>) -> Result<()> {
        let required = self.access_token.read().unwrap_or_else(PoisonError::into_inner);
        match required.as_deref() {
            None => Ok(()),
            Some(expected) if token.as_deref() == Some(expected) => Ok(()),
            Some(_) => Err(Error::Authorization("access token rejected".to_string())),
        }
    }

    /// Applies `writes` under one modify index. Returns whether anything was written.
    fn commit(&self, writes: Vec<(String, Vec<u8>)>, overwrite: bool) -> bool {
        let index = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let index = state.index + 1;
            let mut written = false;
            for (key, value) in writes {
                if !overwrite && state.entries.contains_key(&key) {
                    continue;
                }
                state.entries.insert(key, Entry { value, modify_index: index });
                written = true;
            }
            if !written {
                return false;
            }
            state.index = index;
            index
        };
        self.index_tx.send_replace(index);
        true
    }

    /// Returns the subtree under `prefix` (relative keys) and its highest modify index.
    fn subtree(&self, prefix: &str) -> (ConfigTree, u64) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut pairs = ConfigTree::new();
        let mut latest = 0;
        for (key, entry) in state.entries.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if !in_subtree(key, prefix) {
                continue;
            }
            latest = latest.max(entry.modify_index);
            let relative = key[prefix.len()..].trim_start_matches('/');
            if !relative.is_empty() {
                pairs.insert(relative.to_string(), entry.value.clone());
            }
        }
        (pairs, latest)
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn ping(&self, _token: Option<String>) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, token: Option<String>, key: &str) -> Result<bool> {
        self.authorize(&token)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.entries.contains_key(key))
    }

    async fn exists_any(&self, token: Option<String>, prefix: &str) -> Result<bool> {
        self.authorize(&token)?;
        let prefix = prefix.trim_matches('/');
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let found = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .any(|(key, _)| in_subtree(key, prefix));
        Ok(found)
    }

    async fn get(&self, token: Option<String>, key: &str) -> Result<Vec<u8>> {
        self.authorize(&token)?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .entries
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    async fn put(&self, token: Option<String>, key: &str, value: &[u8]) -> Result<()> {
        self.authorize(&token)?;
        self.commit(vec![(key.to_string(), value.to_vec())], true);
        Ok(())
    }

    async fn put_tree(&self, token: Option<String>, prefix: &str, pairs: &ConfigTree, overwrite: bool) -> Result<()> {
        self.authorize(&token)?;
        let writes = pairs
            .iter()
            .map(|(key, value)| (join_key(prefix, key), value.clone()))
            .collect();
        self.commit(writes, overwrite);
        Ok(())
    }

    async fn fetch_changed(&self, token: Option<String>, prefix: &str, cursor: Option<Cursor>) -> Result<Change> {
        self.fetch_changed_within(token, prefix, cursor, self.wait_time).await
    }

    /// Long-polls for at most `wait`, capped by the store's own wait time.
    async fn fetch_changed_within(
        &self,
        token: Option<String>,
        prefix: &str,
        cursor: Option<Cursor>,
        wait: Duration,
    ) -> Result<Change> {
        self.authorize(&token)?;
        let prefix = prefix.trim_matches('/');
        let deadline = Instant::now() + wait.min(self.wait_time);
        let mut version = self.index_tx.subscribe();

        loop {
            let (pairs, latest) = self.subtree(prefix);
            let changed = match cursor {
                None => true,
                Some(seen) => latest > seen.index(),
            };
            if changed {
                return Ok(Change {
                    pairs,
                    cursor: Some(Cursor::new(latest)),
                    changed: true,
                });
            }

            match tokio::time::timeout_at(deadline, version.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => {
                    return Ok(Change {
                        pairs: ConfigTree::new(),
                        cursor,
                        changed: false,
                    })
                }
            }
        }
    }
}
