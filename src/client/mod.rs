//! Broadcast relay client
//!
//! `RelayClient` owns at most one STOMP session at a time. Every public
//! operation returns immediately: work is handed to the session task over an
//! unbounded channel and results come back through callbacks, the
//! `PendingConnection` future, or the state watch.

mod session;

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::protocol::{Frame, APPLICATION_JSON, TEXT_PLAIN};
use crate::transport::{Connector, WsConnector};
use crate::types::{
    ConnectionState, Endpoint, EndpointError, Message, SessionInfo, SubscriptionHandle,
};

use session::{ConnectCallbacks, SessionCommand, SessionContext, StateCell};

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors reported by the relay client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("A session is already open")]
    AlreadyConnected,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker error: {message}")]
    Broker { message: String, details: String },

    #[error("No heart-beat from broker within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Could not serialize body: {0}")]
    Serialization(String),
}

/// Receives every decoded message (or per-message decode error) for one topic
pub type MessageHandler = Box<dyn FnMut(RelayResult<Message>) + Send + 'static>;

/// Called when an open session fails
pub type ErrorObserver = Arc<dyn Fn(RelayError) + Send + Sync + 'static>;

/// Session tuning shared by every connect
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// STOMP `host` header (None = endpoint host)
    pub host: Option<String>,
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Offered (outgoing, incoming) heart-beat in milliseconds
    pub heartbeat: (u64, u64),
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host: None,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(2),
            heartbeat: (10_000, 10_000),
        }
    }
}

pub struct RelayClientBuilder {
    endpoint: Endpoint,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    error_observer: Option<ErrorObserver>,
}

impl RelayClientBuilder {
    /// Seed a builder from environment-derived config
    pub fn from_config(config: &RelayConfig) -> Result<Self, EndpointError> {
        let endpoint = config.endpoint()?;
        Ok(RelayClient::builder(endpoint).options(config.session_options()))
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = Some(host.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.options.disconnect_timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, outgoing_ms: u64, incoming_ms: u64) -> Self {
        self.options.heartbeat = (outgoing_ms, incoming_ms);
        self
    }

    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Observer for failures of an open session (socket error, peer close,
    /// broker ERROR frame, missed heart-beats)
    pub fn on_error(mut self, observer: impl Fn(RelayError) + Send + Sync + 'static) -> Self {
        self.error_observer = Some(Arc::new(observer));
        self
    }

    pub fn build(self) -> RelayClient {
        RelayClient {
            endpoint: self.endpoint,
            options: self.options,
            connector: self.connector,
            error_observer: self.error_observer,
            state: Arc::new(StateCell::new()),
            next_subscription: AtomicU64::new(0),
            link: None,
        }
    }
}

/// Handle to the live session task
struct SessionLink {
    commands: mpsc::UnboundedSender<SessionCommand>,
    open: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl SessionLink {
    fn is_live(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.commands.is_closed()
    }
}

pub struct RelayClient {
    endpoint: Endpoint,
    options: SessionOptions,
    connector: Arc<dyn Connector>,
    error_observer: Option<ErrorObserver>,
    state: Arc<StateCell>,
    next_subscription: AtomicU64,
    link: Option<SessionLink>,
}

impl RelayClient {
    pub fn builder(endpoint: Endpoint) -> RelayClientBuilder {
        RelayClientBuilder {
            endpoint,
            options: SessionOptions::default(),
            connector: Arc::new(WsConnector),
            error_observer: None,
        }
    }

    /// Client with default options over a WebSocket
    pub fn new(endpoint: Endpoint) -> Self {
        Self::builder(endpoint).build()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Watch connection state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open a session. Must be called from within a tokio runtime.
    ///
    /// The outcome is reported to exactly one of the callbacks and also
    /// resolves the returned future. Nothing is retried.
    pub fn connect<S, F>(&mut self, on_connected: S, on_failure: F) -> PendingConnection
    where
        S: FnOnce(SessionInfo) + Send + 'static,
        F: FnOnce(RelayError) + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let callbacks = ConnectCallbacks::new(on_connected, on_failure, result_tx);

        if self.link.as_ref().is_some_and(SessionLink::is_live) {
            tracing::warn!(endpoint = %self.endpoint, "connect called with a session already open");
            callbacks.fail(RelayError::AlreadyConnected);
            return PendingConnection { rx: result_rx };
        }

        let epoch = self.state.begin();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let ctx = SessionContext {
            endpoint: self.endpoint.clone(),
            options: self.options.clone(),
            connector: self.connector.clone(),
            state: self.state.clone(),
            epoch,
            open: open.clone(),
            commands: command_rx,
            error_observer: self.error_observer.clone(),
        };

        tracing::info!(endpoint = %self.endpoint, "Connecting");
        let task = tokio::spawn(session::run(ctx, callbacks));

        self.link = Some(SessionLink {
            commands,
            open,
            task,
        });

        PendingConnection { rx: result_rx }
    }

    /// Register `handler` for every frame addressed to `topic`.
    /// Fails with `NotConnected`, sending nothing, unless Connected.
    pub fn subscribe<H>(&self, topic: &str, handler: H) -> RelayResult<SubscriptionHandle>
    where
        H: FnMut(RelayResult<Message>) + Send + 'static,
    {
        let link = self.live_link()?;

        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let active = Arc::new(AtomicBool::new(true));

        link.commands
            .send(SessionCommand::Subscribe {
                id: id.clone(),
                topic: topic.to_string(),
                active: active.clone(),
                handler: Box::new(handler),
            })
            .map_err(|_| RelayError::NotConnected)?;

        tracing::debug!(id = %id, topic, "Subscribed");
        Ok(SubscriptionHandle::new(
            id,
            topic.to_string(),
            active,
            link.open.clone(),
        ))
    }

    /// Like `subscribe`, but delivers into a channel
    pub fn subscribe_channel(
        &self,
        topic: &str,
    ) -> RelayResult<(
        SubscriptionHandle,
        mpsc::UnboundedReceiver<RelayResult<Message>>,
    )> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(topic, move |message| {
            let _ = tx.send(message);
        })?;
        Ok((handle, rx))
    }

    /// Stop delivery for `handle`. Safe to call any number of times.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if !handle.deactivate() {
            return;
        }

        let Some(link) = &self.link else {
            return;
        };
        if link.is_live() && handle.belongs_to(&link.open) {
            let _ = link.commands.send(SessionCommand::Unsubscribe {
                id: handle.id().to_string(),
            });
            tracing::debug!(id = handle.id(), topic = handle.topic(), "Unsubscribed");
        }
    }

    /// Fire-and-forget one SEND frame with a text body
    pub fn publish(&self, destination: &str, body: impl Into<String>) -> RelayResult<()> {
        let link = self.live_link()?;
        let frame = Frame::send(destination, body, TEXT_PLAIN);
        link.commands
            .send(SessionCommand::Send(frame))
            .map_err(|_| RelayError::NotConnected)
    }

    /// Fire-and-forget one SEND frame with a JSON body
    pub fn publish_json<T: Serialize>(&self, destination: &str, body: &T) -> RelayResult<()> {
        let link = self.live_link()?;
        let json =
            serde_json::to_string(body).map_err(|e| RelayError::Serialization(e.to_string()))?;
        let frame = Frame::send(destination, json, APPLICATION_JSON);
        link.commands
            .send(SessionCommand::Send(frame))
            .map_err(|_| RelayError::NotConnected)
    }

    /// Close the session and drop every subscription. Idempotent.
    pub fn disconnect(&mut self) {
        self.detach();
    }

    /// Disconnect and wait for the session task to finish its goodbye
    pub async fn close(mut self) {
        if let Some(link) = self.detach() {
            if let Err(e) = link.task.await {
                tracing::warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    fn detach(&mut self) -> Option<SessionLink> {
        let link = self.link.take()?;
        let was_open = link.open.swap(false, Ordering::SeqCst);
        let _ = link.commands.send(SessionCommand::Disconnect);
        self.state.reset();
        if was_open {
            tracing::info!(endpoint = %self.endpoint, "Disconnecting");
        }
        Some(link)
    }

    fn live_link(&self) -> RelayResult<&SessionLink> {
        if self.state.current() != ConnectionState::Connected {
            return Err(RelayError::NotConnected);
        }
        self.link
            .as_ref()
            .filter(|link| link.is_live())
            .ok_or(RelayError::NotConnected)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Resolves once the handshake started by `connect` has succeeded or failed
#[must_use = "the outcome is also delivered to the connect callbacks"]
pub struct PendingConnection {
    rx: oneshot::Receiver<RelayResult<SessionInfo>>,
}

impl Future for PendingConnection {
    type Output = RelayResult<SessionInfo>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(RelayError::Connection(
                    "session ended before the handshake finished".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;

    fn endpoint() -> Endpoint {
        Endpoint::parse("ws://localhost:8080/logs/websocket").unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.heartbeat, (10_000, 10_000));
        assert!(options.host.is_none());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = RelayClient::new(endpoint());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.endpoint().host(), "localhost");
    }

    #[test]
    fn test_publish_and_subscribe_fail_when_disconnected() {
        let (connector, mut listener) = memory::pair();
        let client = RelayClient::builder(endpoint()).connector(connector).build();

        assert_eq!(
            client.publish("/app/guestbook", "hi"),
            Err(RelayError::NotConnected)
        );
        assert_eq!(
            client.publish_json("/app/guestbook", &serde_json::json!({"a": 1})),
            Err(RelayError::NotConnected)
        );
        assert!(matches!(
            client.subscribe("/topic/entries", |_| {}),
            Err(RelayError::NotConnected)
        ));
        // No session was ever opened
        assert!(listener.try_accept().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let mut client = RelayClient::new(endpoint());
        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        let mut client = RelayClient::builder(endpoint())
            .connector(memory::MemoryConnector::refusing("no route to host"))
            .build();

        let (tx, rx) = oneshot::channel();
        let result = client
            .connect(
                |_| panic!("must not connect"),
                move |err| {
                    let _ = tx.send(err);
                },
            )
            .await;

        assert_eq!(
            result,
            Err(RelayError::Connection("no route to host".to_string()))
        );
        assert_eq!(
            rx.await.unwrap(),
            RelayError::Connection("no route to host".to_string())
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
