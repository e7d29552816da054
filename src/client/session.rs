//! The session task
//!
//! One task per session owns the transport and the subscription table, so
//! nothing here needs a lock. It runs the STOMP handshake, then multiplexes
//! client commands, inbound frames and heart-beat timers until the client
//! disconnects or the transport fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::{ErrorObserver, MessageHandler, RelayError, RelayResult, SessionOptions};
use crate::protocol::{self, Command, Frame};
use crate::transport::{Connector, Transport};
use crate::types::{ConnectionState, Endpoint, Message, SessionInfo, SubscriptionId};

/// Connection state shared between the client and its sessions.
///
/// Every connect and disconnect starts a new epoch; a session may only
/// publish state while its epoch is current, so a slow-dying session can
/// never overwrite the state of its successor.
pub(crate) struct StateCell {
    tx: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Start a new epoch and return it
    pub fn begin(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidate the current epoch and force Disconnected
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tx.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
    }

    /// Publish `next` if `epoch` is still current
    pub fn set(&self, epoch: u64, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

pub(crate) enum SessionCommand {
    Subscribe {
        id: SubscriptionId,
        topic: String,
        active: Arc<AtomicBool>,
        handler: MessageHandler,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Send(Frame),
    Disconnect,
}

type ConnectedCallback = Box<dyn FnOnce(SessionInfo) + Send + 'static>;
type FailureCallback = Box<dyn FnOnce(RelayError) + Send + 'static>;

/// The two connect callbacks plus the `PendingConnection` sender.
/// Consumed by whichever outcome happens first.
pub(crate) struct ConnectCallbacks {
    on_connected: ConnectedCallback,
    on_failure: FailureCallback,
    result_tx: oneshot::Sender<RelayResult<SessionInfo>>,
}

impl ConnectCallbacks {
    pub fn new<S, F>(
        on_connected: S,
        on_failure: F,
        result_tx: oneshot::Sender<RelayResult<SessionInfo>>,
    ) -> Self
    where
        S: FnOnce(SessionInfo) + Send + 'static,
        F: FnOnce(RelayError) + Send + 'static,
    {
        Self {
            on_connected: Box::new(on_connected),
            on_failure: Box::new(on_failure),
            result_tx,
        }
    }

    pub fn succeed(self, info: SessionInfo) {
        (self.on_connected)(info.clone());
        let _ = self.result_tx.send(Ok(info));
    }

    pub fn fail(self, err: RelayError) {
        (self.on_failure)(err.clone());
        let _ = self.result_tx.send(Err(err));
    }
}

pub(crate) struct SessionContext {
    pub endpoint: Endpoint,
    pub options: SessionOptions,
    pub connector: Arc<dyn Connector>,
    pub state: Arc<StateCell>,
    pub epoch: u64,
    pub open: Arc<AtomicBool>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub error_observer: Option<ErrorObserver>,
}

struct Subscription {
    topic: String,
    active: Arc<AtomicBool>,
    handler: MessageHandler,
}

enum Exit {
    /// Client asked to disconnect (or dropped its handle)
    Requested,
    Failed(RelayError),
}

pub(crate) async fn run(mut ctx: SessionContext, callbacks: ConnectCallbacks) {
    let opened = handshake(&ctx.endpoint, &ctx.options, ctx.connector.as_ref()).await;
    let (mut transport, info) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(endpoint = %ctx.endpoint, "Connection failed: {}", e);
            ctx.open.store(false, Ordering::SeqCst);
            callbacks.fail(e);
            return;
        }
    };

    // disconnect() may have raced the handshake
    if !ctx.open.load(Ordering::SeqCst) || !ctx.state.set(ctx.epoch, ConnectionState::Connected)
    {
        ctx.open.store(false, Ordering::SeqCst);
        transport.close().await;
        callbacks.fail(RelayError::Connection(
            "disconnected before the handshake finished".to_string(),
        ));
        return;
    }

    tracing::info!(
        endpoint = %ctx.endpoint,
        version = %info.version,
        server = ?info.server,
        heartbeat = ?info.heartbeat,
        "Connected"
    );
    callbacks.succeed(info.clone());

    let mut subscriptions: HashMap<SubscriptionId, Subscription> = HashMap::new();
    let exit = dispatch(&mut ctx, transport.as_mut(), &info, &mut subscriptions).await;

    ctx.open.store(false, Ordering::SeqCst);
    for sub in subscriptions.values() {
        sub.active.store(false, Ordering::SeqCst);
    }
    subscriptions.clear();

    match exit {
        Exit::Requested => {
            goodbye(transport.as_mut(), ctx.options.disconnect_timeout).await;
            ctx.state.set(ctx.epoch, ConnectionState::Disconnected);
            tracing::info!(endpoint = %ctx.endpoint, "Disconnected");
        }
        Exit::Failed(err) => {
            // Closing may stall on a half-open peer; report first
            ctx.state.set(ctx.epoch, ConnectionState::Disconnected);
            tracing::error!(endpoint = %ctx.endpoint, "Session lost: {}", err);
            if let Some(observer) = &ctx.error_observer {
                observer(err);
            }
            transport.close().await;
        }
    }
}

/// Open the transport and exchange CONNECT/CONNECTED, all within
/// `connect_timeout`
async fn handshake(
    endpoint: &Endpoint,
    options: &SessionOptions,
    connector: &dyn Connector,
) -> RelayResult<(Box<dyn Transport>, SessionInfo)> {
    let timeout = options.connect_timeout;
    match time::timeout(timeout, open_session(endpoint, options, connector)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Connection(format!(
            "handshake did not finish within {timeout:?}"
        ))),
    }
}

async fn open_session(
    endpoint: &Endpoint,
    options: &SessionOptions,
    connector: &dyn Connector,
) -> RelayResult<(Box<dyn Transport>, SessionInfo)> {
    let mut transport = connector.open(endpoint).await.map_err(|e| match e {
        RelayError::Connection(_) => e,
        other => RelayError::Connection(other.to_string()),
    })?;

    let host = options
        .host
        .clone()
        .unwrap_or_else(|| endpoint.host().to_string());
    let connect = Frame::connect(&host, options.heartbeat);

    if let Err(e) = transport.send(connect.encode()).await {
        transport.close().await;
        return Err(RelayError::Connection(e.to_string()));
    }

    match await_connected(transport.as_mut()).await {
        Ok(connected) => {
            let info = session_info(&connected, options.heartbeat);
            Ok((transport, info))
        }
        Err(e) => {
            transport.close().await;
            Err(e)
        }
    }
}

async fn await_connected(transport: &mut dyn Transport) -> RelayResult<Frame> {
    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(RelayError::Connection(e.to_string())),
            None => {
                return Err(RelayError::Connection(
                    "connection closed during handshake".to_string(),
                ))
            }
        };

        let frames = protocol::decode(&text)
            .map_err(|e| RelayError::Connection(format!("invalid handshake reply: {e}")))?;

        for frame in frames {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => {
                    let message = frame.get("message").unwrap_or("rejected").to_string();
                    return Err(RelayError::Connection(format!(
                        "broker rejected CONNECT: {message}"
                    )));
                }
                other => tracing::debug!("Ignoring {} during handshake", other),
            }
        }
    }
}

fn session_info(connected: &Frame, offered: (u64, u64)) -> SessionInfo {
    let server_heartbeat = connected
        .get("heart-beat")
        .and_then(protocol::parse_heartbeat)
        .unwrap_or((0, 0));

    SessionInfo {
        version: connected.get("version").unwrap_or("1.0").to_string(),
        server: connected.get("server").map(str::to_string),
        session: connected.get("session").map(str::to_string),
        heartbeat: protocol::negotiate_heartbeat(offered, server_heartbeat),
    }
}

async fn dispatch(
    ctx: &mut SessionContext,
    transport: &mut dyn Transport,
    info: &SessionInfo,
    subscriptions: &mut HashMap<SubscriptionId, Subscription>,
) -> Exit {
    let (outgoing_ms, incoming_ms) = info.heartbeat;

    let mut pulse: Option<Interval> = (outgoing_ms > 0).then(|| {
        let period = Duration::from_millis(outgoing_ms);
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    // Allow one missed beat before giving up
    let silence_limit =
        (incoming_ms > 0).then(|| Duration::from_millis(incoming_ms.saturating_mul(2)));
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            biased;

            command = ctx.commands.recv() => {
                let Some(command) = command else {
                    return Exit::Requested;
                };
                match command {
                    SessionCommand::Subscribe { id, topic, active, handler } => {
                        let frame = Frame::subscribe(&id, &topic);
                        subscriptions.insert(id, Subscription { topic, active, handler });
                        if let Err(e) = transport.send(frame.encode()).await {
                            return Exit::Failed(e);
                        }
                    }
                    SessionCommand::Unsubscribe { id } => {
                        if subscriptions.remove(&id).is_some() {
                            if let Err(e) = transport.send(Frame::unsubscribe(&id).encode()).await {
                                return Exit::Failed(e);
                            }
                        }
                    }
                    SessionCommand::Send(frame) => {
                        tracing::debug!(destination = ?frame.get("destination"), "Publishing");
                        if let Err(e) = transport.send(frame.encode()).await {
                            return Exit::Failed(e);
                        }
                    }
                    SessionCommand::Disconnect => return Exit::Requested,
                }
            }

            inbound = transport.recv() => {
                let text = match inbound {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => return Exit::Failed(e),
                    None => {
                        return Exit::Failed(RelayError::Transport(
                            "connection closed by peer".to_string(),
                        ))
                    }
                };
                last_inbound = Instant::now();

                let frames = match protocol::decode(&text) {
                    Ok(frames) => frames,
                    Err(e) => {
                        return Exit::Failed(RelayError::Transport(format!(
                            "undecodable frame: {e}"
                        )))
                    }
                };
                for frame in frames {
                    if let Err(e) = handle_frame(ctx, frame, subscriptions) {
                        return Exit::Failed(e);
                    }
                }
            }

            _ = async {
                match pulse.as_mut() {
                    Some(interval) => interval.tick().await,
                    None => std::future::pending::<Instant>().await,
                }
            } => {
                if let Err(e) = transport.send("\n".to_string()).await {
                    return Exit::Failed(e);
                }
            }

            _ = async {
                match silence_limit {
                    Some(limit) => time::sleep_until(last_inbound + limit).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some(limit) = silence_limit {
                    return Exit::Failed(RelayError::HeartbeatTimeout(limit));
                }
            }
        }
    }
}

fn handle_frame(
    ctx: &SessionContext,
    frame: Frame,
    subscriptions: &mut HashMap<SubscriptionId, Subscription>,
) -> RelayResult<()> {
    match frame.command {
        Command::Message => {
            deliver(ctx, &frame, subscriptions);
            Ok(())
        }
        Command::Receipt => {
            tracing::debug!(receipt = ?frame.get("receipt-id"), "Receipt");
            Ok(())
        }
        Command::Error => Err(RelayError::Broker {
            message: frame.get("message").unwrap_or_default().to_string(),
            details: frame.body,
        }),
        other => {
            tracing::warn!("Ignoring unexpected {} frame", other);
            Ok(())
        }
    }
}

fn deliver(
    ctx: &SessionContext,
    frame: &Frame,
    subscriptions: &mut HashMap<SubscriptionId, Subscription>,
) {
    // Match on the subscription id. 1.0 brokers may only echo the
    // destination, in which case every subscription to it gets a copy.
    let targets: Vec<&mut Subscription> = match frame.get("subscription") {
        Some(id) => subscriptions.get_mut(id).into_iter().collect(),
        None => {
            let destination = frame.get("destination").unwrap_or_default();
            subscriptions
                .values_mut()
                .filter(|sub| sub.topic == destination)
                .collect()
        }
    };

    if targets.is_empty() {
        tracing::warn!(
            subscription = ?frame.get("subscription"),
            destination = ?frame.get("destination"),
            "Dropping MESSAGE for unknown subscription"
        );
        return;
    }

    let message = Message::from_frame(frame);
    for sub in targets {
        if !ctx.open.load(Ordering::SeqCst) || !sub.active.load(Ordering::SeqCst) {
            tracing::debug!(topic = %sub.topic, "Dropping MESSAGE for removed subscription");
            continue;
        }
        if let Err(e) = &message {
            tracing::warn!(topic = %sub.topic, "Malformed message: {}", e);
        }
        (sub.handler)(message.clone());
    }
}

/// Send DISCONNECT and wait briefly for its RECEIPT before closing
async fn goodbye(transport: &mut dyn Transport, wait: Duration) {
    let receipt = format!("disconnect-{}", ulid::Ulid::new());

    if transport
        .send(Frame::disconnect(&receipt).encode())
        .await
        .is_ok()
    {
        let acknowledged = time::timeout(wait, async {
            while let Some(Ok(text)) = transport.recv().await {
                let Ok(frames) = protocol::decode(&text) else {
                    continue;
                };
                if frames.iter().any(|f| {
                    f.command == Command::Receipt && f.get("receipt-id") == Some(receipt.as_str())
                }) {
                    return true;
                }
            }
            false
        })
        .await;

        match acknowledged {
            Ok(true) => tracing::debug!("DISCONNECT acknowledged"),
            _ => tracing::debug!("No receipt for DISCONNECT, closing anyway"),
        }
    }

    transport.close().await;
}
