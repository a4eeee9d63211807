pub mod client_factory;
pub mod http_client;

/// Re-export commonly used types from adapters
pub use client_factory::{ClientFactoryError, ForwardingClientContext, ForwardingClientFactory};
pub use http_client::ForwardingClient;
