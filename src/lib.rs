// Public API for integration tests and embedding

pub mod client;
pub mod config;
pub mod i18n;
pub mod protocol;
pub mod transport;
pub mod types;

pub use client::{
    PendingConnection, RelayClient, RelayClientBuilder, RelayError, RelayResult, SessionOptions,
};
pub use i18n::{Dictionary, DictionaryError};
pub use types::{ConnectionState, Endpoint, Message, SessionInfo, SubscriptionHandle};

/// Alias matching the component's descriptive name
pub type BroadcastRelayClient = RelayClient;
