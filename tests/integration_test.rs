use async_trait::async_trait;
use kvconf::engine::MemStore;
use kvconf::sdk::{self, ServiceConfig};
use kvconf::server::Router;
use kvconf::sdk::RemoteStore;
use kvconf::{ConfigTree, Error, KvStore, TokenProvider};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "PascalCase", default)]
struct LoggingInfo {
    enable_remote: bool,
    file: String,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "PascalCase", default)]
struct MyConfig {
    logging: LoggingInfo,
    port: i32,
    host: String,
    log_level: String,
}

fn expected() -> MyConfig {
    MyConfig {
        logging: LoggingInfo {
            enable_remote: true,
            file: "NONE".to_string(),
        },
        port: 8000,
        host: "localhost".to_string(),
        log_level: "debug".to_string(),
    }
}

async fn start_server(store: Arc<MemStore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let router = Router::new(store);
    tokio::spawn(async move {
        let _ = router.serve(listener).await;
    });
    addr
}

fn tcp_config(addr: SocketAddr, base_path: &str) -> ServiceConfig {
    let mut config = ServiceConfig {
        base_path: base_path.to_string(),
        retry_interval_ms: 50,
        ..Default::default()
    };
    config.populate_from_url(&format!("tcp.http://{}", addr)).unwrap();
    config
}

fn memstore() -> Arc<MemStore> {
    Arc::new(MemStore::new(ConfigTree::new()).with_wait_time(Duration::from_millis(200)))
}

#[tokio::test]
async fn test_configuration_over_tcp() {
    let addr = start_server(memstore()).await;
    let client = sdk::new_configuration_client(tcp_config(addr, "edgex/core/1.0/svc")).unwrap();

    assert!(client.is_alive().await);
    assert!(!client.has_configuration().await.unwrap());

    client.put_configuration(&expected(), true).await.unwrap();
    assert!(client.has_configuration().await.unwrap());
    assert!(client.has_sub_configuration("Logging").await.unwrap());
    assert!(!client.has_sub_configuration("Log").await.unwrap());
    assert_eq!(client.get_configuration_value("Logging/File").await.unwrap(), b"NONE".to_vec());
    assert!(matches!(client.get_configuration_value("Missing").await, Err(Error::KeyNotFound(_))));

    let actual: MyConfig = client.get_configuration().await.unwrap();
    assert_eq!(actual, expected());
}

#[tokio::test]
async fn test_watch_over_tcp() {
    let addr = start_server(memstore()).await;
    let client = sdk::new_configuration_client(tcp_config(addr, "svc")).unwrap();
    client.put_configuration(&expected(), true).await.unwrap();

    let (updates_tx, mut updates) = mpsc::channel::<LoggingInfo>(8);
    let (errors_tx, mut errors) = mpsc::channel(8);
    client.watch_for_changes(updates_tx, errors_tx, "Logging");

    let first = timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();
    assert_eq!(first.file, "NONE");

    client.put_configuration_value("Logging/File", b"random").await.unwrap();
    let second = timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap();
    assert_eq!(second.file, "random");
    assert!(errors.try_recv().is_err());

    client.stop_watching();
    timeout(Duration::from_secs(2), async {
        while client.active_watches() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

struct RotatingProvider {
    token: String,
    calls: AtomicUsize,
}

#[async_trait]
impl TokenProvider for RotatingProvider {
    async fn access_token(&self) -> kvconf::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}

#[tokio::test]
async fn test_token_renewal_over_tcp() {
    let store = memstore();
    store.set_access_token(Some("t2".to_string()));
    let addr = start_server(store.clone()).await;

    let provider = Arc::new(RotatingProvider {
        token: "t2".to_string(),
        calls: AtomicUsize::new(0),
    });
    let mut config = tcp_config(addr, "svc").with_token_provider(provider.clone());
    config.access_token = Some("t1".to_string());
    let client = sdk::new_configuration_client(config).unwrap();

    client.put_configuration_value("Foo", b"bar").await.unwrap();
    assert_eq!(client.get_configuration_value("Foo").await.unwrap(), b"bar".to_vec());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let mut no_renewal = tcp_config(addr, "svc");
    no_renewal.access_token = Some("t1".to_string());
    let client = sdk::new_configuration_client(no_renewal).unwrap();
    assert!(matches!(client.configuration_value_exists("Foo").await, Err(Error::Authorization(_))));
}

#[tokio::test]
async fn test_client_wait_time_bounds_long_poll() {
    let store = Arc::new(MemStore::new(ConfigTree::new()).with_wait_time(Duration::from_secs(30)));
    let addr = start_server(store).await;

    let remote = RemoteStore::new(&addr.to_string()).with_wait_time(Duration::from_millis(100));
    remote.put(None, "svc/Port", b"8000").await.unwrap();
    let first = remote.fetch_changed(None, "svc", None).await.unwrap();

    let started = std::time::Instant::now();
    let idle = remote.fetch_changed(None, "svc", first.cursor).await.unwrap();
    assert!(!idle.changed);
    assert_eq!(idle.cursor, first.cursor);
    assert!(started.elapsed() < Duration::from_secs(5));

    let mut config = tcp_config(addr, "svc");
    config.wait_time_ms = 100;
    let client = sdk::new_configuration_client(config).unwrap();
    let (updates_tx, mut updates) = mpsc::channel::<MyConfig>(8);
    let (errors_tx, mut errors) = mpsc::channel(8);
    client.watch_for_changes(updates_tx, errors_tx, "");
    assert_eq!(timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap().port, 8000);

    tokio::time::sleep(Duration::from_millis(350)).await;
    client.put_configuration_value("Port", b"9000").await.unwrap();
    assert_eq!(timeout(Duration::from_secs(5), updates.recv()).await.unwrap().unwrap().port, 9000);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn test_unreachable_store() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = sdk::new_configuration_client(tcp_config(addr, "svc")).unwrap();
    assert!(!client.is_alive().await);

    let err = client.has_configuration().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(err.to_string().contains("checking configuration existence"));
}

#[tokio::test]
async fn test_full_protocol_integration() {
    let addr = start_server(memstore()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    writer.write_all(b"PING\n").await.unwrap();
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "PONG");

    writer.write_all(b"PUT - svc/k1 7631\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "OK");

    writer.write_all(b"GET - svc/k1\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "OK 7631");

    writer.write_all(b"EXISTS_ANY - svc\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "OK true");

    writer.write_all(b"FETCH - svc -\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert!(response.starts_with("OK "));
    assert!(response.contains("\"k1\":\"7631\""));
    assert!(response.contains("\"changed\":true"));

    writer.write_all(b"FETCH - svc 1 20\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert!(response.contains("\"changed\":false"));

    writer.write_all(b"GET - svc/missing\n").await.unwrap();
    response.clear();
    reader.read_line(&mut response).await.unwrap();
    assert_eq!(response.trim(), "ERR not_found svc/missing");
}
