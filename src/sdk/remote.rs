use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::server::protocol::{
    encode_cursor, encode_path, encode_token, encode_tree, parse_reply, FetchReply,
};
use crate::{Change, ConfigTree, Cursor, Error, KvStore, Result};

const MAX_ATTEMPTS: u64 = 3;
const MAX_IDLE_CONNECTIONS: usize = 4;

/// [`KvStore`] backed by a `kvconfd` daemon over TCP.
///
/// Connections are opened lazily and pooled, so a long-polling watch holds its
/// own connection while other calls proceed on another.
pub struct RemoteStore {
    addr: String,
    wait_time: Option<Duration>,
    idle: Mutex<Vec<Connection>>,
}

struct Connection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl RemoteStore {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            wait_time: None,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Asks the daemon to end each long-poll after `wait_time`. The daemon's
    /// own `--wait-ms` still caps it.
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send_and_receive(&self, cmd: String) -> Result<String> {
        for attempt in 0..MAX_ATTEMPTS {
            let mut conn = match self.checkout().await {
                Ok(conn) => conn,
                Err(e) => {
                    if attempt == MAX_ATTEMPTS - 1 {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis((attempt + 1) * 200)).await;
                    continue;
                }
            };

            if conn.writer.write_all(format!("{}\n", cmd).as_bytes()).await.is_err() {
                continue;
            }

            let mut resp = String::new();
            match conn.reader.read_line(&mut resp).await {
                Ok(0) | Err(_) => continue,
                Ok(_) => {
                    self.checkin(conn);
                    return parse_reply(resp.trim());
                }
            }
        }

        Err(Error::Connection(format!("{}: failed after {} attempts", self.addr, MAX_ATTEMPTS)))
    }

    async fn checkout(&self) -> Result<Connection> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        if let Some(conn) = pooled {
            return Ok(conn);
        }

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", self.addr, e)))?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
        })
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    async fn command(&self, name: &str, token: &Option<String>, args: &[String]) -> Result<String> {
        let mut cmd = format!("{} {}", name, encode_token(token)?);
        for arg in args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        self.send_and_receive(cmd).await
    }
}

fn parse_flag(payload: &str) -> Result<bool> {
    payload
        .parse::<bool>()
        .map_err(|_| Error::Internal(format!("invalid response {:?}", payload)))
}

#[async_trait]
impl KvStore for RemoteStore {
    async fn ping(&self, _token: Option<String>) -> Result<()> {
        self.send_and_receive("PING".to_string()).await.map(|_| ())
    }

    async fn exists(&self, token: Option<String>, key: &str) -> Result<bool> {
        let resp = self.command("EXISTS", &token, &[encode_path(key)?]).await?;
        parse_flag(&resp)
    }

    async fn exists_any(&self, token: Option<String>, prefix: &str) -> Result<bool> {
        let resp = self.command("EXISTS_ANY", &token, &[encode_path(prefix)?]).await?;
        parse_flag(&resp)
    }

    async fn get(&self, token: Option<String>, key: &str) -> Result<Vec<u8>> {
        let resp = self.command("GET", &token, &[encode_path(key)?]).await?;
        hex::decode(&resp).map_err(|e| Error::Internal(format!("invalid value for {}: {}", key, e)))
    }

    async fn put(&self, token: Option<String>, key: &str, value: &[u8]) -> Result<()> {
        self.command("PUT", &token, &[encode_path(key)?, hex::encode(value)]).await?;
        Ok(())
    }

    async fn put_tree(&self, token: Option<String>, prefix: &str, pairs: &ConfigTree, overwrite: bool) -> Result<()> {
        let args = [encode_path(prefix)?, overwrite.to_string(), encode_tree(pairs)?];
        self.command("PUT_TREE", &token, &args).await?;
        Ok(())
    }

    async fn fetch_changed(&self, token: Option<String>, prefix: &str, cursor: Option<Cursor>) -> Result<Change> {
        let mut args = vec![encode_path(prefix)?, encode_cursor(cursor)];
        if let Some(wait) = self.wait_time {
            args.push(wait.as_millis().to_string());
        }
        let resp = self.command("FETCH", &token, &args).await?;
        let reply: FetchReply = serde_json::from_str(&resp)?;
        Change::try_from(reply)
    }

    async fn fetch_changed_within(
        &self,
        token: Option<String>,
        prefix: &str,
        cursor: Option<Cursor>,
        wait: Duration,
    ) -> Result<Change> {
        let args = [encode_path(prefix)?, encode_cursor(cursor), wait.as_millis().to_string()];
        let resp = self.command("FETCH", &token, &args).await?;
        let reply: FetchReply = serde_json::from_str(&resp)?;
        Change::try_from(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_store_reports_connection_error() {
        let store = RemoteStore::new("127.0.0.1:1");
        let res = store.exists(None, "svc/Foo").await;
        assert!(matches!(res, Err(Error::Connection(ref msg)) if msg.contains("127.0.0.1:1")));
    }

    #[tokio::test]
    async fn test_rejects_whitespace_in_keys() {
        let store = RemoteStore::new("127.0.0.1:1");
        assert!(matches!(store.get(None, "bad key").await, Err(Error::Encoding(_))));
    }
}
