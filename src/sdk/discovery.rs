use std::env;
use std::sync::Arc;

use crate::engine::MemStore;
use crate::sdk::{ConfigurationClient, RemoteStore, ServiceConfig};
use crate::{ConfigTree, Error, KvStore, Result};

/// Store type served by a `kvconfd` daemon.
pub const TCP_STORE: &str = "tcp";
/// Store type kept in this process only.
pub const MEMORY_STORE: &str = "memory";

/// Creates a [`ConfigurationClient`] for the backend named by `config.store_type`.
///
/// Connecting is deferred to the first call, so this succeeds even while the
/// store is down.
///
/// # Examples
///
/// ```no_run
/// use kvconf::sdk::{self, ServiceConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut config = ServiceConfig { base_path: "edgex/core/1.0/my-service".to_string(), ..Default::default() };
///     config.populate_from_url("tcp.http://localhost:7001")?;
///     let client = sdk::new_configuration_client(config)?;
///     println!("alive: {}", client.is_alive().await);
///     Ok(())
/// }
/// ```
pub fn new_configuration_client(config: ServiceConfig) -> Result<ConfigurationClient> {
    let store: Arc<dyn KvStore> = match config.store_type.as_str() {
        TCP_STORE => Arc::new(RemoteStore::new(&config.address()).with_wait_time(config.wait_time())),
        MEMORY_STORE => Arc::new(MemStore::new(ConfigTree::new()).with_wait_time(config.wait_time())),
        other => return Err(Error::UnsupportedStoreType(other.to_string())),
    };
    Ok(ConfigurationClient::with_store(config, store))
}

/// Builds a [`ServiceConfig`] from the environment.
///
/// `KVCONF_PROVIDER_URL` (`<type>.<protocol>://host:port`) is required;
/// `KVCONF_BASE_PATH` and `KVCONF_ACCESS_TOKEN` are optional.
pub fn from_env() -> Result<ServiceConfig> {
    let url = env::var("KVCONF_PROVIDER_URL")
        .map_err(|_| Error::InvalidProviderUrl("KVCONF_PROVIDER_URL is not set".to_string()))?;

    let mut config = ServiceConfig::default();
    config.populate_from_url(&url)?;
    config.base_path = env::var("KVCONF_BASE_PATH").unwrap_or_default();
    config.access_token = env::var("KVCONF_ACCESS_TOKEN").ok().filter(|t| !t.is_empty());
    Ok(config)
}
