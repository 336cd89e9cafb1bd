use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::sync::Mutex;

use crate::{Change, ConfigTree, Cursor, Error, KvStore, Result, TokenProvider};

#[derive(Debug, Default)]
struct Credential {
    token: Option<String>,
    /// Bumped on every renewal so a caller can tell whether someone else already renewed.
    generation: u64,
}

/// Wraps a [`KvStore`] and renews the access token once when the backend rejects it.
///
/// Concurrent callers that hit the same rejection share a single renewal: the
/// first one asks the provider, the rest wait on the renewal lock and reuse the
/// token it produced.
pub struct AuthGuard {
    store: Arc<dyn KvStore>,
    provider: Option<Arc<dyn TokenProvider>>,
    credential: RwLock<Credential>,
    renewal: Mutex<()>,
}

impl AuthGuard {
    pub fn new(store: Arc<dyn KvStore>, token: Option<String>, provider: Option<Arc<dyn TokenProvider>>) -> Self {
        Self {
            store,
            provider,
            credential: RwLock::new(Credential { token, generation: 0 }),
            renewal: Mutex::new(()),
        }
    }

    /// Token attached to the next outgoing call.
    pub fn current_token(&self) -> Option<String> {
        self.credential.read().unwrap_or_else(PoisonError::into_inner).token.clone()
    }

    fn snapshot(&self) -> (Option<String>, u64) {
        let credential = self.credential.read().unwrap_or_else(PoisonError::into_inner);
        (credential.token.clone(), credential.generation)
    }

    /// Runs `op` with the current token, renewing and retrying once on an authorization failure.
    ///
    /// Without a provider, or when renewal fails or the retry is rejected
    /// again, the original authorization error is returned. Any other retry
    /// error is returned as is.
    async fn call<'f, R, F>(&self, op: F) -> Result<R>
    where
        F: Fn(Option<String>) -> BoxFuture<'f, Result<R>> + Send + Sync,
        R: Send,
    {
        let (token, generation) = self.snapshot();
        let denied = match op(token).await {
            Err(Error::Authorization(msg)) => msg,
            other => return other,
        };

        let Some(provider) = &self.provider else {
            return Err(Error::Authorization(denied));
        };

        let fresh = match self.renew(generation, provider.as_ref()).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Access token renewal failed: {}", e);
                return Err(Error::Authorization(denied));
            }
        };

        match op(fresh).await {
            Err(Error::Authorization(msg)) => {
                debug!("Renewed access token rejected as well: {}", msg);
                Err(Error::Authorization(denied))
            }
            other => other,
        }
    }

    /// Replaces the token unless a renewal already happened since `failed_generation`.
    async fn renew(&self, failed_generation: u64, provider: &dyn TokenProvider) -> Result<Option<String>> {
        let _renewal = self.renewal.lock().await;

        let (token, generation) = self.snapshot();
        if generation != failed_generation {
            return Ok(token);
        }

        let fresh = provider.access_token().await?;
        let mut credential = self.credential.write().unwrap_or_else(PoisonError::into_inner);
        credential.token = Some(fresh.clone());
        credential.generation += 1;
        debug!("Access token renewed (generation {})", credential.generation);
        Ok(Some(fresh))
    }

    pub async fn ping(&self) -> Result<()> {
        let store = self.store.as_ref();
        self.call(move |token| store.ping(token)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let store = self.store.as_ref();
        self.call(move |token| store.exists(token, key)).await
    }

    pub async fn exists_any(&self, prefix: &str) -> Result<bool> {
        let store = self.store.as_ref();
        self.call(move |token| store.exists_any(token, prefix)).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let store = self.store.as_ref();
        self.call(move |token| store.get(token, key)).await
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let store = self.store.as_ref();
        self.call(move |token| store.put(token, key, value)).await
    }

    pub async fn put_tree(&self, prefix: &str, pairs: &ConfigTree, overwrite: bool) -> Result<()> {
        let store = self.store.as_ref();
        self.call(move |token| store.put_tree(token, prefix, pairs, overwrite)).await
    }

    pub async fn fetch_changed(&self, prefix: &str, cursor: Option<Cursor>) -> Result<Change> {
        let store = self.store.as_ref();
        self.call(move |token| store.fetch_changed(token, prefix, cursor)).await
    }
}
