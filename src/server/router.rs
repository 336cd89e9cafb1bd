use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::server::protocol::{
    decode_cursor, decode_path, decode_token, decode_tree, error_reply, FetchReply,
};
use crate::{Error, KvStore, Result};

const MAX_CONNECTIONS: usize = 100;

pub struct Router {
    store: Arc<dyn KvStore>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    pub async fn listen(&self, port: &str) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        info!("kvconf store listening on port {}", port);
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until it fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, _) = listener.accept().await?;
            let store = self.store.clone();
            let sem = self.semaphore.clone();

            tokio::spawn(async move {
                let _permit = match sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        error!("Server busy: too many concurrent connections. Rejecting...");
                        let mut socket = socket;
                        let _ = socket.shutdown().await;
                        return;
                    }
                };

                if let Err(e) = handle_connection(socket, store).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }
}

pub async fn handle_connection(mut socket: TcpStream, store: Arc<dyn KvStore>) -> Result<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            break;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let command = parts[0].to_uppercase();
        let response = match command.as_str() {
            "PING" => "PONG".to_string(),
            "QUIT" => break,
            _ if parts.len() < 2 => "ERR invalid missing arguments".to_string(),
            _ => match dispatch(store.as_ref(), &command, decode_token(parts[1]), &parts[2..]).await {
                Ok(None) => "OK".to_string(),
                Ok(Some(payload)) => format!("OK {}", payload),
                Err(e) => error_reply(&e),
            },
        };

        writer.write_all(format!("{}\n", response).as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(store: &dyn KvStore, command: &str, token: Option<String>, args: &[&str]) -> Result<Option<String>> {
    match command {
        "EXISTS" => {
            let found = store.exists(token, decode_path(arg(args, 0)?)).await?;
            Ok(Some(found.to_string()))
        }
        "EXISTS_ANY" => {
            let found = store.exists_any(token, decode_path(arg(args, 0)?)).await?;
            Ok(Some(found.to_string()))
        }
        "GET" => {
            let value = store.get(token, decode_path(arg(args, 0)?)).await?;
            Ok(Some(hex::encode(value)))
        }
        "PUT" => {
            let key = decode_path(arg(args, 0)?);
            let value = hex::decode(args.get(1).copied().unwrap_or(""))
                .map_err(|e| Error::Encoding(format!("invalid value for {}: {}", key, e)))?;
            store.put(token, key, &value).await?;
            Ok(None)
        }
        "PUT_TREE" => {
            let prefix = decode_path(arg(args, 0)?);
            let overwrite = arg(args, 1)?
                .parse::<bool>()
                .map_err(|_| Error::Encoding("overwrite must be true or false".to_string()))?;
            let pairs = decode_tree(&args[2.min(args.len())..].join(" "))
                .map_err(|e| Error::Encoding(e.to_string()))?;
            store.put_tree(token, prefix, &pairs, overwrite).await?;
            Ok(None)
        }
        "FETCH" => {
            let prefix = decode_path(arg(args, 0)?);
            let cursor = decode_cursor(arg(args, 1)?)?;
            let change = match args.get(2) {
                Some(ms) => {
                    let wait = ms
                        .parse::<u64>()
                        .map_err(|_| Error::Encoding(format!("invalid wait time {:?}", ms)))?;
                    store.fetch_changed_within(token, prefix, cursor, Duration::from_millis(wait)).await?
                }
                None => store.fetch_changed(token, prefix, cursor).await?,
            };
            Ok(Some(serde_json::to_string(&FetchReply::from(change))?))
        }
        _ => Err(Error::Encoding("unknown command".to_string())),
    }
}

fn arg<'a>(args: &[&'a str], i: usize) -> Result<&'a str> {
    args.get(i)
        .copied()
        .ok_or_else(|| Error::Encoding("missing arguments".to_string()))
}
