use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result, TokenProvider};

const DEFAULT_PROTOCOL: &str = "http";

fn default_wait_time_ms() -> u64 {
    5000
}

fn default_retry_interval_ms() -> u64 {
    1000
}

/// Describes how to reach the configuration store and where this service's
/// configuration lives in it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceConfig {
    /// Protocol used to reach the store. `http` when empty.
    #[serde(default)]
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Backend implementation, e.g. `tcp` or `memory`.
    #[serde(rename = "Type")]
    pub store_type: String,
    /// Namespace root for this service's keys.
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Called when the store rejects the current access token.
    #[serde(skip)]
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Upper bound on one long-poll round of a watch. A `tcp` daemon applies the
    /// smaller of this and its own `--wait-ms`.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    /// Pause before a watch retries after a failed fetch.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            protocol: String::new(),
            host: String::new(),
            port: 0,
            store_type: String::new(),
            base_path: String::new(),
            access_token: None,
            token_provider: None,
            wait_time_ms: default_wait_time_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("protocol", &self.protocol())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("store_type", &self.store_type)
            .field("base_path", &self.base_path)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("token_provider", &self.token_provider.is_some())
            .field("wait_time_ms", &self.wait_time_ms)
            .field("retry_interval_ms", &self.retry_interval_ms)
            .finish()
    }
}

impl ServiceConfig {
    pub fn protocol(&self) -> &str {
        if self.protocol.is_empty() {
            DEFAULT_PROTOCOL
        } else {
            &self.protocol
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol(), self.host, self.port)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Fills type, protocol, host and port from a `<type>.<protocol>://host:port` URL.
    pub fn populate_from_url(&mut self, provider_url: &str) -> Result<()> {
        let url = Url::parse(provider_url).map_err(|e| {
            Error::InvalidProviderUrl(format!("the format of the configuration provider url is wrong: {}", e))
        })?;

        let port = url.port().ok_or_else(|| {
            Error::InvalidProviderUrl(format!("the configuration provider url {:?} has no port", provider_url))
        })?;

        let scheme: Vec<&str> = url.scheme().split('.').collect();
        let (store_type, protocol) = match scheme.as_slice() {
            [store_type, protocol] if !store_type.is_empty() && !protocol.is_empty() => (*store_type, *protocol),
            _ => {
                return Err(Error::InvalidProviderUrl(format!(
                    "the type and protocol of the configuration provider url {:?} must look like <type>.<protocol>",
                    provider_url
                )))
            }
        };

        let host = url.host_str().ok_or_else(|| {
            Error::InvalidProviderUrl(format!("the configuration provider url {:?} has no host", provider_url))
        })?;

        self.store_type = store_type.to_string();
        self.protocol = protocol.to_string();
        self.host = host.to_string();
        self.port = port;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults_to_http() {
        let config = ServiceConfig {
            host: "localhost".to_string(),
            port: 8500,
            ..Default::default()
        };
        assert_eq!(config.protocol(), "http");
        assert_eq!(config.url(), "http://localhost:8500");
        assert_eq!(config.address(), "localhost:8500");
    }

    #[test]
    fn test_populate_from_url() {
        let mut config = ServiceConfig::default();
        config.populate_from_url("tcp.http://localhost:7001").unwrap();
        assert_eq!(config.store_type, "tcp");
        assert_eq!(config.protocol, "http");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 7001);
    }

    #[test]
    fn test_populate_from_bad_urls() {
        let mut config = ServiceConfig::default();
        assert!(matches!(config.populate_from_url("not a url"), Err(Error::InvalidProviderUrl(_))));
        assert!(matches!(config.populate_from_url("tcp://localhost:7001"), Err(Error::InvalidProviderUrl(_))));
        assert!(matches!(config.populate_from_url("tcp.http://localhost"), Err(Error::InvalidProviderUrl(_))));
    }

    #[test]
    fn test_deserialize_and_redacted_debug() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{ "Host": "localhost", "Port": 7001, "Type": "tcp", "BasePath": "edgex/core", "AccessToken": "secret" }"#,
        )
        .unwrap();
        assert_eq!(config.wait_time_ms, 5000);
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.access_token.as_deref(), Some("secret"));
        assert!(!format!("{:?}", config).contains("secret"));
    }
}
