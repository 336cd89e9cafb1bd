use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::codec::{flatten, unflatten, Configuration};
use crate::sdk::watcher::{self, WatchHandle};
use crate::sdk::{AuthGuard, ServiceConfig};
use crate::{join_key, Error, KvStore, Result};

/// Reads, writes and watches one service's configuration under its base path.
///
/// All keys passed to this client are relative to [`ServiceConfig::base_path`].
/// Every store call goes through an [`AuthGuard`], so an expired token is
/// renewed and the call retried without the caller noticing.
pub struct ConfigurationClient {
    config: ServiceConfig,
    base_path: String,
    store: Arc<AuthGuard>,
    watches: Mutex<Vec<WatchHandle>>,
    active_watches: Arc<AtomicUsize>,
}

impl ConfigurationClient {
    /// Builds a client over any [`KvStore`] backend.
    pub fn with_store(config: ServiceConfig, store: Arc<dyn KvStore>) -> Self {
        let guard = AuthGuard::new(store, config.access_token.clone(), config.token_provider.clone());
        Self {
            base_path: config.base_path.trim_matches('/').to_string(),
            config,
            store: Arc::new(guard),
            watches: Mutex::new(Vec::new()),
            active_watches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Full store key for `key` under the base path.
    pub fn full_path(&self, key: &str) -> String {
        join_key(&self.base_path, key)
    }

    /// Whether the backend answers at all. Never fails.
    pub async fn is_alive(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Configuration store at {} is not alive: {}", self.config.url(), e);
                false
            }
        }
    }

    /// Whether any key exists under the base path.
    pub async fn has_configuration(&self) -> Result<bool> {
        self.store
            .exists_any(&self.base_path)
            .await
            .map_err(|e| e.context("checking configuration existence"))
    }

    /// Whether any key exists at or below `base/sub_path`, matching whole path segments.
    pub async fn has_sub_configuration(&self, sub_path: &str) -> Result<bool> {
        self.store
            .exists_any(&self.full_path(sub_path))
            .await
            .map_err(|e| e.context("checking sub configuration existence"))
    }

    pub async fn configuration_value_exists(&self, key: &str) -> Result<bool> {
        self.store
            .exists(&self.full_path(key))
            .await
            .map_err(|e| e.context("checking configuration value existence"))
    }

    /// Reads one raw value. An absent key is [`Error::KeyNotFound`].
    pub async fn get_configuration_value(&self, key: &str) -> Result<Vec<u8>> {
        self.store
            .get(&self.full_path(key))
            .await
            .map_err(|e| e.context("getting configuration value"))
    }

    pub async fn put_configuration_value(&self, key: &str, value: &[u8]) -> Result<()> {
        self.store
            .put(&self.full_path(key), value)
            .await
            .map_err(|e| e.context("putting configuration value"))
    }

    /// Decodes everything under the base path into `T`.
    pub async fn get_configuration<T: Configuration>(&self) -> Result<T> {
        let snapshot = self
            .store
            .fetch_changed(&self.base_path, None)
            .await
            .map_err(|e| e.context("getting configuration"))?;
        unflatten(&snapshot.pairs)
    }

    /// Stores every leaf of `configuration`. Without `overwrite`, leaves that
    /// already exist keep their stored value.
    pub async fn put_configuration<S: Serialize + ?Sized>(&self, configuration: &S, overwrite: bool) -> Result<()> {
        let pairs = flatten(configuration, "")?;
        self.store
            .put_tree(&self.base_path, &pairs, overwrite)
            .await
            .map_err(|e| e.context("putting configuration"))
    }

    /// Same as [`put_configuration`](Self::put_configuration) for an untyped nested map.
    pub async fn put_configuration_map(&self, configuration: &Map<String, Value>, overwrite: bool) -> Result<()> {
        self.put_configuration(configuration, overwrite).await
    }

    /// Publishes `T` decoded from `base/sub_path` on `updates` now and after every change.
    ///
    /// Returns immediately; polling happens on a background task. Failures are
    /// sent to `errors` and never stop the watch. Must be called within a Tokio
    /// runtime.
    pub fn watch_for_changes<T: Configuration>(
        &self,
        updates: mpsc::Sender<T>,
        errors: mpsc::Sender<Error>,
        sub_path: &str,
    ) {
        let handle = watcher::spawn(
            self.store.clone(),
            self.full_path(sub_path),
            updates,
            errors,
            self.config.retry_interval(),
            self.active_watches.clone(),
        );
        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        watches.retain(|h| !h.is_finished());
        watches.push(handle);
    }

    /// Cancels every watch registered through this client. Safe to call repeatedly.
    pub fn stop_watching(&self) {
        let handles: Vec<WatchHandle> = self
            .watches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in &handles {
            handle.stop();
        }
    }

    /// Number of polling tasks still running.
    pub fn active_watches(&self) -> usize {
        self.active_watches.load(Ordering::SeqCst)
    }
}

impl Drop for ConfigurationClient {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::ConfigTree;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
    #[serde(rename_all = "PascalCase", default)]
    struct LoggingInfo {
        enable_remote: bool,
        file: String,
    }

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
    #[serde(rename_all = "PascalCase", default)]
    struct TestConfig {
        logging: LoggingInfo,
        port: i32,
        host: String,
        log_level: String,
        temp: f64,
    }

    fn expected() -> TestConfig {
        TestConfig {
            logging: LoggingInfo {
                enable_remote: true,
                file: "NONE".to_string(),
            },
            port: 8000,
            host: "localhost".to_string(),
            log_level: "debug".to_string(),
            temp: 36.123456,
        }
    }

    fn make_client(store: Arc<MemStore>, base_path: &str) -> ConfigurationClient {
        let config = ServiceConfig {
            host: "localhost".to_string(),
            port: 0,
            store_type: "memory".to_string(),
            base_path: base_path.to_string(),
            retry_interval_ms: 50,
            ..Default::default()
        };
        ConfigurationClient::with_store(config, store)
    }

    fn memstore() -> Arc<MemStore> {
        Arc::new(MemStore::new(ConfigTree::new()).with_wait_time(Duration::from_millis(200)))
    }

    #[tokio::test]
    async fn test_has_configuration() {
        let client = make_client(memstore(), "edgex/core/svc");
        assert!(!client.has_configuration().await.unwrap());

        client.put_configuration_value("Dummy", b"Value").await.unwrap();
        assert!(client.has_configuration().await.unwrap());
    }

    #[tokio::test]
    async fn test_has_configuration_partial_service_key() {
        let store = memstore();
        store.put(None, "edgex/core/svc-test/some-key", b"Nothing").await.unwrap();

        let client = make_client(store, "edgex/core/svc/");
        assert!(!client.has_configuration().await.unwrap());
    }

    #[tokio::test]
    async fn test_has_sub_configuration() {
        let store = memstore();
        let client = make_client(store.clone(), "svc");
        assert!(!client.has_sub_configuration("foo").await.unwrap());

        store.put(None, "svc/foo-other/x", b"1").await.unwrap();
        assert!(!client.has_sub_configuration("foo").await.unwrap());

        client.put_configuration_value("foo/y", b"2").await.unwrap();
        assert!(client.has_sub_configuration("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_configuration_value_round_trip() {
        let store = memstore();
        let client = make_client(store.clone(), "svc");

        assert!(!client.configuration_value_exists("Foo").await.unwrap());
        assert!(matches!(client.get_configuration_value("Foo").await, Err(Error::KeyNotFound(_))));

        client.put_configuration_value("Foo", b"bar").await.unwrap();
        assert!(client.configuration_value_exists("Foo").await.unwrap());
        assert_eq!(client.get_configuration_value("Foo").await.unwrap(), b"bar".to_vec());
        assert_eq!(store.get(None, "svc/Foo").await.unwrap(), b"bar".to_vec());
    }

    #[tokio::test]
    async fn test_put_and_get_configuration() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), true).await.unwrap();

        for key in ["Logging/EnableRemote", "Logging/File", "Port", "Host", "LogLevel", "Temp"] {
            assert!(client.configuration_value_exists(key).await.unwrap(), "{} missing", key);
        }

        let actual: TestConfig = client.get_configuration().await.unwrap();
        assert_eq!(actual, expected());
    }

    #[tokio::test]
    async fn test_get_configuration_from_individual_values() {
        let client = make_client(memstore(), "svc");
        client.put_configuration_value("Logging/EnableRemote", b"true").await.unwrap();
        client.put_configuration_value("Logging/File", b"NONE").await.unwrap();
        client.put_configuration_value("Port", b"8000").await.unwrap();
        client.put_configuration_value("Host", b"localhost").await.unwrap();
        client.put_configuration_value("LogLevel", b"debug").await.unwrap();
        client.put_configuration_value("Temp", b"36.123456").await.unwrap();
        client.put_configuration_value("Unrelated", b"ignored").await.unwrap();

        let actual: TestConfig = client.get_configuration().await.unwrap();
        assert_eq!(actual, expected());
    }

    #[tokio::test]
    async fn test_put_configuration_without_overwrite_keeps_values() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), false).await.unwrap();

        let mut changed = expected();
        changed.port = 9000;
        changed.logging.file = "other".to_string();
        client.put_configuration(&changed, false).await.unwrap();

        let actual: TestConfig = client.get_configuration().await.unwrap();
        assert_eq!(actual, expected());

        client.put_configuration(&changed, true).await.unwrap();
        let actual: TestConfig = client.get_configuration().await.unwrap();
        assert_eq!(actual, changed);
    }

    fn config_map() -> Map<String, Value> {
        let value = json!({
            "int": 1,
            "int64": 64,
            "float64": 1.4,
            "string": "hello",
            "bool": true,
            "nestedNode": { "field1": "value1", "field2": "value2" }
        });
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_put_configuration_map_overwrite() {
        let client = make_client(memstore(), "svc");
        let mut map = config_map();
        client.put_configuration_map(&map, false).await.unwrap();
        assert_eq!(client.get_configuration_value("float64").await.unwrap(), b"1.4".to_vec());

        map.insert("nestedNode".to_string(), json!({ "field1": "overwrite1", "field2": "overwrite2" }));
        map.insert("int".to_string(), json!(2));
        client.put_configuration_map(&map, false).await.unwrap();
        assert_eq!(client.get_configuration_value("nestedNode/field1").await.unwrap(), b"value1".to_vec());
        assert_eq!(client.get_configuration_value("int").await.unwrap(), b"1".to_vec());

        client.put_configuration_map(&map, true).await.unwrap();
        assert_eq!(client.get_configuration_value("nestedNode/field1").await.unwrap(), b"overwrite1".to_vec());
        assert_eq!(client.get_configuration_value("int").await.unwrap(), b"2".to_vec());
    }

    #[tokio::test]
    async fn test_put_configuration_rejects_unsupported_shapes() {
        let client = make_client(memstore(), "svc");
        let res = client.put_configuration(&json!({ "Hosts": ["a"] }), true).await;
        assert!(matches!(res, Err(Error::Encoding(_))));
    }

    #[tokio::test]
    async fn test_watch_for_changes() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), true).await.unwrap();

        let (updates_tx, mut updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, mut errors) = mpsc::channel(8);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");
        assert_eq!(client.active_watches(), 1);

        let first = timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();
        assert_eq!(first.file, "NONE");

        let nothing = timeout(Duration::from_millis(400), updates.recv()).await;
        assert!(nothing.is_err(), "no update expected without a change");

        client.put_configuration_value("Logging/File", b"random").await.unwrap();
        let second = timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();
        assert_eq!(second.file, "random");
        assert!(second.enable_remote);

        let nothing = timeout(Duration::from_millis(400), updates.recv()).await;
        assert!(nothing.is_err(), "exactly one update per change");
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_decode_errors_and_keeps_polling() {
        let client = make_client(memstore(), "svc");
        client.put_configuration_value("Logging/EnableRemote", b"maybe").await.unwrap();

        let (updates_tx, mut updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, mut errors) = mpsc::channel(8);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");

        let err = timeout(Duration::from_secs(5), errors.recv()).await.unwrap().unwrap();
        assert!(matches!(err, Error::Decoding(_)));

        client.put_configuration_value("Logging/EnableRemote", b"true").await.unwrap();
        let update = timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();
        assert!(update.enable_remote);
    }

    #[tokio::test]
    async fn test_independent_watches() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), true).await.unwrap();

        let (logging_tx, mut logging) = mpsc::channel::<LoggingInfo>(8);
        let (all_tx, mut all) = mpsc::channel::<TestConfig>(8);
        let (errors_tx, _errors) = mpsc::channel(8);
        client.watch_for_changes(logging_tx, errors_tx.clone(), "Logging");
        client.watch_for_changes(all_tx, errors_tx, "");
        assert_eq!(client.active_watches(), 2);

        assert_eq!(timeout(Duration::from_secs(5), all.recv()).await.unwrap().unwrap(), expected());
        client.put_configuration_value("Port", b"9001").await.unwrap();
        assert_eq!(timeout(Duration::from_secs(5), all.recv()).await.unwrap().unwrap().port, 9001);

        // logging never drained its first update until now and has seen no change since
        assert_eq!(timeout(Duration::from_secs(5), logging.recv()).await.unwrap().unwrap().file, "NONE");
        assert!(timeout(Duration::from_millis(300), logging.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_watching() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), true).await.unwrap();

        let (updates_tx, mut updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, _errors) = mpsc::channel(8);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");
        timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();

        client.stop_watching();
        client.stop_watching();

        timeout(Duration::from_secs(2), async {
            while client.active_watches() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        client.put_configuration_value("Logging/File", b"after-stop").await.unwrap();
        let closed = timeout(Duration::from_secs(2), updates.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_finished_watches_are_pruned() {
        let client = make_client(memstore(), "svc");
        client.put_configuration(&expected(), true).await.unwrap();

        let (updates_tx, updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, errors) = mpsc::channel(8);
        drop(updates);
        drop(errors);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");

        timeout(Duration::from_secs(2), async {
            while client.active_watches() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (updates_tx, _updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, _errors) = mpsc::channel(8);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");
        assert_eq!(client.watches.lock().unwrap().len(), 1);
    }

    struct RotatedToken {
        token: String,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl crate::TokenProvider for RotatedToken {
        async fn access_token(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.token.clone())
        }
    }

    #[tokio::test]
    async fn test_watch_survives_token_rotation() {
        let store = memstore();
        store.set_access_token(Some("t1".to_string()));
        let provider = Arc::new(RotatedToken {
            token: "t2".to_string(),
            calls: AtomicUsize::new(0),
        });
        let config = ServiceConfig {
            base_path: "svc".to_string(),
            store_type: "memory".to_string(),
            access_token: Some("t1".to_string()),
            retry_interval_ms: 50,
            ..Default::default()
        }
        .with_token_provider(provider.clone());
        let client = ConfigurationClient::with_store(config, store.clone());
        client.put_configuration(&expected(), true).await.unwrap();

        let (updates_tx, mut updates) = mpsc::channel::<LoggingInfo>(8);
        let (errors_tx, mut errors) = mpsc::channel(8);
        client.watch_for_changes(updates_tx, errors_tx, "Logging");
        assert_eq!(timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap().file, "NONE");

        store.set_access_token(Some("t2".to_string()));
        let t2 = Some("t2".to_string());
        store.put(t2.clone(), "svc/Logging/File", b"rotated").await.unwrap();
        assert_eq!(timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap().file, "rotated");

        store.put(t2, "svc/Logging/File", b"again").await.unwrap();
        assert_eq!(timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap().file, "again");

        assert!(errors.try_recv().is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_watching_without_watches() {
        let client = make_client(memstore(), "svc");
        client.stop_watching();
        assert_eq!(client.active_watches(), 0);
    }
}
