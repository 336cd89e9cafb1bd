/// TCP server implementation for the kvconf store daemon.
///
/// This module provides the [`Router`] which handles incoming TCP connections
/// and dispatches commands to the underlying store.
pub mod protocol;
pub mod router;

pub use router::Router;
