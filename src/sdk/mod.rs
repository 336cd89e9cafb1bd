/// Client-side API for kvconf.
///
/// This module provides the [`ConfigurationClient`], the backend factory, the
/// token-renewing [`AuthGuard`] and the TCP [`RemoteStore`].
pub mod auth;
pub mod config;
pub mod configuration;
/// Backend selection from a [`ServiceConfig`] or the environment.
pub mod discovery;
pub mod remote;
mod watcher;

pub use auth::AuthGuard;
pub use config::ServiceConfig;
pub use configuration::ConfigurationClient;
pub use discovery::{from_env, new_configuration_client, MEMORY_STORE, TCP_STORE};
pub use remote::RemoteStore;
