//! Line protocol shared by the [`Router`](crate::server::Router) and the
//! [`RemoteStore`](crate::sdk::RemoteStore).
//!
//! Requests are `<CMD> <token|-> <args...>` and replies are either
//! `OK [payload]` or `ERR <code> <message>`. Values travel hex encoded and the
//! empty root path is spelled `.`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Change, ConfigTree, Cursor, Error, Result};

pub const NO_TOKEN: &str = "-";
pub const ROOT_PATH: &str = ".";
pub const NO_CURSOR: &str = "-";

/// Reply payload of a `FETCH` request.
#[derive(Debug, Serialize, Deserialize)]
pub struct FetchReply {
    pub pairs: BTreeMap<String, String>,
    pub cursor: Option<Cursor>,
    pub changed: bool,
}

impl From<Change> for FetchReply {
    fn from(change: Change) -> Self {
        Self {
            pairs: change.pairs.iter().map(|(k, v)| (k.clone(), hex::encode(v))).collect(),
            cursor: change.cursor,
            changed: change.changed,
        }
    }
}

impl TryFrom<FetchReply> for Change {
    type Error = Error;

    fn try_from(reply: FetchReply) -> Result<Self> {
        Ok(Change {
            pairs: decode_hex_map(reply.pairs)?,
            cursor: reply.cursor,
            changed: reply.changed,
        })
    }
}

fn single_arg(kind: &str, value: &str) -> Result<()> {
    if value.chars().any(char::is_whitespace) {
        return Err(Error::Encoding(format!("{} {:?} must not contain whitespace", kind, value)));
    }
    Ok(())
}

pub fn encode_path(path: &str) -> Result<String> {
    let path = path.trim_matches('/');
    single_arg("key", path)?;
    if path.is_empty() {
        Ok(ROOT_PATH.to_string())
    } else {
        Ok(path.to_string())
    }
}

pub fn decode_path(arg: &str) -> &str {
    if arg == ROOT_PATH {
        ""
    } else {
        arg
    }
}

pub fn encode_token(token: &Option<String>) -> Result<String> {
    match token.as_deref() {
        None | Some("") => Ok(NO_TOKEN.to_string()),
        Some(t) => {
            single_arg("access token", t)?;
            Ok(t.to_string())
        }
    }
}

pub fn decode_token(arg: &str) -> Option<String> {
    if arg == NO_TOKEN {
        None
    } else {
        Some(arg.to_string())
    }
}

pub fn encode_cursor(cursor: Option<Cursor>) -> String {
    match cursor {
        Some(c) => c.index().to_string(),
        None => NO_CURSOR.to_string(),
    }
}

pub fn decode_cursor(arg: &str) -> Result<Option<Cursor>> {
    if arg == NO_CURSOR {
        return Ok(None);
    }
    arg.parse::<u64>()
        .map(|i| Some(Cursor::new(i)))
        .map_err(|_| Error::Internal(format!("invalid cursor {:?}", arg)))
}

pub fn encode_tree(pairs: &ConfigTree) -> Result<String> {
    for key in pairs.keys() {
        single_arg("key", key)?;
    }
    let encoded: BTreeMap<&str, String> = pairs.iter().map(|(k, v)| (k.as_str(), hex::encode(v))).collect();
    Ok(serde_json::to_string(&encoded)?)
}

pub fn decode_tree(json: &str) -> Result<ConfigTree> {
    let encoded: BTreeMap<String, String> = serde_json::from_str(json)?;
    decode_hex_map(encoded)
}

fn decode_hex_map(encoded: BTreeMap<String, String>) -> Result<ConfigTree> {
    encoded
        .into_iter()
        .map(|(k, v)| {
            let bytes = hex::decode(&v).map_err(|e| Error::Internal(format!("{}: {}", k, e)))?;
            Ok((k, bytes))
        })
        .collect()
}

/// Renders an error as an `ERR` reply line.
pub fn error_reply(e: &Error) -> String {
    match e {
        Error::Authorization(msg) => format!("ERR forbidden {}", msg),
        Error::KeyNotFound(key) => format!("ERR not_found {}", key),
        Error::Encoding(msg) | Error::Decoding(msg) => format!("ERR invalid {}", msg),
        other => format!("ERR internal {}", other),
    }
}

/// Splits a reply line into its payload, mapping `ERR` replies back to errors.
pub fn parse_reply(line: &str) -> Result<String> {
    if line == "OK" || line == "PONG" {
        return Ok(String::new());
    }
    if let Some(payload) = line.strip_prefix("OK ") {
        return Ok(payload.to_string());
    }
    let Some(err) = line.strip_prefix("ERR ") else {
        return Err(Error::Internal(format!("invalid response {:?}", line)));
    };
    let (code, msg) = err.split_once(' ').unwrap_or((err, ""));
    Err(match code {
        "forbidden" => Error::Authorization(msg.to_string()),
        "not_found" => Error::KeyNotFound(msg.to_string()),
        "invalid" => Error::Encoding(msg.to_string()),
        _ => Error::Internal(msg.to_string()),
    })
}
