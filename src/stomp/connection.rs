//! STOMP connection handler.
//!
//! One `StompConnection` drives one transport. All connection state lives in
//! the task running [`StompConnection::run`]; every asynchronous collaborator
//! call (virtual-host lookup, authentication, route connect, route refill,
//! store completion) is awaited from that task, which suspends frame reads
//! for the duration. That single await discipline replaces the lock-free
//! dispatch-queue confinement of classic broker cores: no frame is ever
//! dispatched concurrently with a pending collaborator call.
//!
//! State machine: INIT -> NEGOTIATING -> AUTHENTICATING -> OPEN, with
//! DRAINING_ERROR entered by `die` (one ERROR frame, then a grace period for
//! the client to read it) and CLOSED on transport loss or DISCONNECT.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::broker::{
    BindingSpec, Delivery, Destination, HostRegistry, Router, SecurityContext, StoreUow,
    VirtualHost,
};
use crate::core::config::ConnectionConfig;
use crate::stomp::acks::AckMode;
use crate::stomp::codec::{CodecHandle, StompCodec};
use crate::stomp::consumer::{ConsumerSession, FallbackAckIndex};
use crate::stomp::frame::{command, header, Frame, StompItem};
use crate::stomp::heartbeat::{negotiate, HeartBeatMonitor};
use crate::stomp::routes::ProducerRoutes;
use crate::stomp::selector::Selector;
use crate::stomp::transactions::{TransactionRegistry, TxAction};

/// Protocol versions this core speaks, in preference order.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0", "1.1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
        }
    }

    /// Pick the first supported entry of a comma-separated `accept-version`
    /// header. An absent header selects 1.0.
    fn from_accept_header(value: Option<&str>) -> Option<Self> {
        let Some(list) = value else {
            return Some(ProtocolVersion::V1_0);
        };
        list.split(',').map(str::trim).find_map(|v| match v {
            "1.0" => Some(ProtocolVersion::V1_0),
            "1.1" => Some(ProtocolVersion::V1_1),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Init,
    Negotiating,
    Authenticating,
    Open,
    DrainingError,
    Closed,
}

/// Local escape for fatal protocol errors. Unwinds frame dispatch via `?`
/// and is swallowed at the dispatch boundary so the read loop can keep
/// draining until the error grace period elapses.
struct Died;

type DispatchResult = std::result::Result<(), Died>;

/// Cloneable diagnostic view of a connection. `waiting_on` names the reason
/// the connection task is parked on a collaborator, or is empty.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDiagnostics {
    waiting_on: Arc<Mutex<String>>,
}

impl ConnectionDiagnostics {
    pub fn waiting_on(&self) -> String {
        self.waiting_on.lock().clone()
    }

    fn suspend(&self, reason: impl Into<String>) {
        *self.waiting_on.lock() = reason.into();
    }

    fn resume(&self) {
        self.waiting_on.lock().clear();
    }
}

fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let mut parts = value.split(',');
    let cx = parts.next()?.trim().parse().ok()?;
    let cy = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((cx, cy))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub struct StompConnection {
    config: ConnectionConfig,
    hosts: Arc<dyn HostRegistry>,
    diagnostics: ConnectionDiagnostics,

    state: ConnectionState,
    version: Option<ProtocolVersion>,
    session_id: Option<String>,
    security: SecurityContext,
    host: Option<Arc<dyn VirtualHost>>,

    out: mpsc::Sender<StompItem>,
    codec: CodecHandle,
    heartbeat: Option<HeartBeatMonitor>,
    dead: Arc<Notify>,

    consumers: HashMap<String, Arc<ConsumerSession>>,
    routes: ProducerRoutes,
    transactions: TransactionRegistry,
    fallback_acks: FallbackAckIndex,

    message_counter: u64,
    die_deadline: Option<tokio::time::Instant>,
}

impl StompConnection {
    pub fn new(hosts: Arc<dyn HostRegistry>, config: ConnectionConfig) -> Self {
        // Senders are installed in `run`; this placeholder is never used.
        let (out, _) = mpsc::channel(1);
        let routes = ProducerRoutes::new(config.producer_route_cache_size);
        Self {
            config,
            hosts,
            diagnostics: ConnectionDiagnostics::default(),
            state: ConnectionState::Init,
            version: None,
            session_id: None,
            security: SecurityContext::default(),
            host: None,
            out,
            codec: CodecHandle::default(),
            heartbeat: None,
            dead: Arc::new(Notify::new()),
            consumers: HashMap::new(),
            routes,
            transactions: TransactionRegistry::new(),
            fallback_acks: Arc::new(Mutex::new(HashMap::new())),
            message_counter: 0,
            die_deadline: None,
        }
    }

    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        self.diagnostics.clone()
    }

    /// Drive the connection until the client disconnects, the transport
    /// drops, or a fatal protocol error finishes draining.
    pub async fn run<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let read_codec = StompCodec::new(self.config.max_frame_size);
        self.codec = read_codec.handle();
        let write_codec = read_codec.share();

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, read_codec);
        let mut writer = FramedWrite::new(write_half, write_codec);

        let (out_tx, mut out_rx) = mpsc::channel(self.config.outbound_buffer_frames);
        self.out = out_tx;

        let stop_writer = Arc::new(Notify::new());
        let writer_stop = stop_writer.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = out_rx.recv() => match item {
                        Some(item) => {
                            if writer.send(item).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_stop.notified() => {
                        // Flush whatever is already queued, then close.
                        while let Ok(item) = out_rx.try_recv() {
                            if writer.send(item).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            let mut io = writer.into_inner();
            let _ = io.shutdown().await;
        });

        let result = self.read_loop(&mut reader).await;
        self.teardown().await;
        stop_writer.notify_one();
        let _ = writer_task.await;
        result
    }

    async fn read_loop<R>(&mut self, reader: &mut FramedRead<R, StompCodec>) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let deadline = self.die_deadline;
            let drain_elapsed = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            let dead = self.dead.clone();

            tokio::select! {
                _ = drain_elapsed => {
                    // The client had its chance to read the ERROR frame.
                    return Ok(());
                }
                _ = dead.notified() => {
                    tracing::warn!(
                        session = self.session_id.as_deref().unwrap_or(""),
                        "stomp connection heart-beat expired"
                    );
                    return Ok(());
                }
                item = reader.next(), if self.state != ConnectionState::DrainingError => match item {
                    None => return Ok(()),
                    Some(Err(error)) => {
                        let _ = self.die(format!("Invalid frame: {error}")).await;
                    }
                    Some(Ok(StompItem::Heartbeat)) => {
                        // Keep-alives only feed the codec's read counter.
                    }
                    Some(Ok(StompItem::Frame(frame))) => {
                        let _ = self.dispatch(frame).await;
                        if self.state == ConnectionState::Closed {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> DispatchResult {
        match self.state {
            ConnectionState::Init
            | ConnectionState::Negotiating
            | ConnectionState::Authenticating => {
                if frame.command == command::CONNECT || frame.command == command::STOMP {
                    self.on_connect(frame).await
                } else {
                    self.die("Client must first send a connect frame").await
                }
            }
            ConnectionState::Open => match frame.command.as_str() {
                command::SEND => self.on_send(frame).await,
                command::ACK => self.on_ack(frame).await,
                command::BEGIN => self.on_begin(frame).await,
                command::COMMIT => self.on_commit(frame).await,
                command::ABORT => self.on_abort(frame).await,
                command::SUBSCRIBE => self.on_subscribe(frame).await,
                command::UNSUBSCRIBE => self.on_unsubscribe(frame).await,
                command::DISCONNECT => self.on_disconnect(frame).await,
                command::CONNECT | command::STOMP => {
                    self.die("Client is already connected").await
                }
                other => self.die(format!("Unsupported STOMP action: {other}")).await,
            },
            ConnectionState::DrainingError | ConnectionState::Closed => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    async fn on_connect(&mut self, frame: Frame) -> DispatchResult {
        self.state = ConnectionState::Negotiating;

        let Some(version) = ProtocolVersion::from_accept_header(frame.get(header::ACCEPT_VERSION))
        else {
            let supported = SUPPORTED_VERSIONS.join(",");
            let error = Frame::error("version not supported")
                .header(header::VERSION, supported.clone())
                .body(format!("Supported protocol versions are {supported}"));
            return self.die_with(error).await;
        };
        self.version = Some(version);

        let heart_beat = frame.get(header::HEART_BEAT).unwrap_or("0,0");
        let Some((client_cx, client_cy)) = parse_heart_beat(heart_beat) else {
            let message = format!("Invalid heart-beat header: {heart_beat}");
            return self.die(message).await;
        };

        self.security = SecurityContext {
            user: frame.get(header::LOGIN).map(str::to_string),
            password: frame.get(header::PASSCODE).map(str::to_string),
        };

        self.diagnostics.suspend("virtual host lookup");
        let host = self.hosts.lookup(frame.get(header::HOST)).await;
        self.diagnostics.resume();
        let Some(host) = host else {
            let named = frame.get(header::HOST).unwrap_or("<default>");
            return self.die(format!("Invalid virtual host: {named}")).await;
        };

        self.state = ConnectionState::Authenticating;
        if let Some(authenticator) = host.authenticator() {
            self.diagnostics.suspend("authentication");
            let authenticated = authenticator.authenticate(&self.security).await;
            self.diagnostics.resume();
            if !authenticated {
                return self.die("Authentication failed.").await;
            }
        }

        let session_id = format!("{}:{}", host.id(), host.next_session());
        if let Some(pool) = host.buffer_pool() {
            self.codec.attach_pool(pool);
        }

        let advertised = format!(
            "{},{}",
            self.config.outbound_heartbeat_ms, self.config.inbound_heartbeat_ms
        );
        self.send_frame(Frame::connected(version.as_str(), &session_id, &advertised))
            .await?;

        let times = negotiate(
            self.config.outbound_heartbeat_ms,
            self.config.inbound_heartbeat_ms,
            client_cx,
            client_cy,
        );
        let mut monitor = HeartBeatMonitor::new();
        if !times.write_interval.is_zero() {
            let out = self.out.clone();
            monitor = monitor.write_side(times.write_interval, self.codec.write_counter(), move || {
                let _ = out.try_send(StompItem::Heartbeat);
            });
        }
        if !times.read_interval.is_zero() {
            let dead = self.dead.clone();
            monitor = monitor.read_side(times.read_interval, self.codec.read_counter(), move || {
                dead.notify_one();
            });
        }
        monitor.start();
        self.heartbeat = Some(monitor);

        tracing::debug!(
            session = %session_id,
            version = version.as_str(),
            "stomp connection open"
        );
        self.session_id = Some(session_id);
        self.host = Some(host);
        self.state = ConnectionState::Open;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // SEND
    // -----------------------------------------------------------------------

    async fn on_send(&mut self, mut frame: Frame) -> DispatchResult {
        let destination = match frame.get(header::DESTINATION) {
            Some(value) => match Destination::parse(value) {
                Ok(destination) => destination,
                Err(error) => {
                    let message = error.to_string();
                    return self.die(message).await;
                }
            },
            None => return self.die("SEND must include a destination header").await,
        };

        if let Some(tx_id) = frame.remove(header::TRANSACTION) {
            let receipt = frame.remove(header::RECEIPT);
            self.transactions
                .enqueue(&tx_id, TxAction::Send { destination, frame });
            if let Some(receipt) = receipt {
                self.send_frame(Frame::receipt(&receipt)).await?;
            }
            return Ok(());
        }

        self.perform_send(destination, frame, None).await
    }

    async fn perform_send(
        &mut self,
        destination: Destination,
        mut frame: Frame,
        uow: Option<Arc<dyn StoreUow>>,
    ) -> DispatchResult {
        let router = self.router()?;
        let route = match self.routes.get(&destination) {
            Some(route) => route,
            None => {
                let producer = self.session_id.clone().unwrap_or_default();
                self.diagnostics
                    .suspend(format!("connecting to destination: {destination}"));
                let connected = router.connect(&destination, &producer).await;
                self.diagnostics.resume();
                let route = match connected {
                    Ok(route) => route,
                    Err(error) => {
                        let message = format!("Could not connect to {destination}: {error}");
                        return self.die(message).await;
                    }
                };
                self.routes
                    .insert(destination.clone(), route.clone(), router.as_ref());
                route
            }
        };

        let receipt = frame.remove(header::RECEIPT);

        if !route.has_targets() {
            // Nothing is listening; the message is dropped but the client
            // still gets its receipt.
            if let Some(receipt) = receipt {
                self.send_frame(Frame::receipt(&receipt)).await?;
            }
            return Ok(());
        }

        if frame.get(header::MESSAGE_ID).is_none() {
            self.message_counter += 1;
            frame.set(header::MESSAGE_ID, format!("msg:{}", self.message_counter));
        }

        let delivery = Delivery::new(frame).with_uow(uow);
        if !route.offer(delivery) {
            let message = format!("Destination {destination} refused the message");
            return self.die(message).await;
        }

        if route.is_full() {
            self.diagnostics
                .suspend(format!("blocked destination: {destination}"));
            route.refilled().await;
            self.diagnostics.resume();
        }

        if let Some(receipt) = receipt {
            self.send_frame(Frame::receipt(&receipt)).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // ACK
    // -----------------------------------------------------------------------

    async fn on_ack(&mut self, frame: Frame) -> DispatchResult {
        let Some(message_id) = frame.get(header::MESSAGE_ID).map(str::to_string) else {
            return self.die("ACK must include a message-id header").await;
        };

        let consumer = match frame.get(header::SUBSCRIPTION) {
            Some(subscription) => match self.consumers.get(subscription) {
                Some(consumer) => consumer.clone(),
                None => {
                    let message = format!("Subscription '{subscription}' not found");
                    return self.die(message).await;
                }
            },
            None => {
                if self.version != Some(ProtocolVersion::V1_0) {
                    return self.die("ACK must include a subscription header").await;
                }
                let key = self.fallback_acks.lock().get(&message_id).cloned();
                match key.and_then(|key| self.consumers.get(&key).cloned()) {
                    Some(consumer) => consumer,
                    None => {
                        let message = format!("ACK failed, invalid message id: {message_id}");
                        return self.die(message).await;
                    }
                }
            }
        };

        if let Some(tx_id) = frame.get(header::TRANSACTION) {
            self.transactions.enqueue(
                tx_id,
                TxAction::Ack {
                    subscription: consumer.key().to_string(),
                    message_id,
                },
            );
        } else if let Err(error) = consumer.perform_ack(&message_id, None) {
            let message = error.to_string();
            return self.die(message).await;
        }

        self.send_receipt(&frame).await
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    async fn on_begin(&mut self, frame: Frame) -> DispatchResult {
        let tx_id = self.transaction_id(&frame).await?;
        if let Err(error) = self.transactions.begin(&tx_id) {
            let message = error.to_string();
            return self.die(message).await;
        }
        self.send_receipt(&frame).await
    }

    async fn on_commit(&mut self, frame: Frame) -> DispatchResult {
        let tx_id = self.transaction_id(&frame).await?;
        let actions = match self.transactions.commit(&tx_id) {
            Ok(actions) => actions,
            Err(error) => {
                let message = error.to_string();
                return self.die(message).await;
            }
        };

        let store = self.host.as_ref().and_then(|host| host.store());
        match store {
            Some(store) => {
                let uow = store.create_uow();
                for action in actions {
                    self.replay(action, Some(uow.clone())).await?;
                }
                let (done_tx, done_rx) = oneshot::channel();
                uow.on_complete(Box::new(move || {
                    let _ = done_tx.send(());
                }));
                uow.release();
                self.diagnostics.suspend("transaction commit");
                let _ = done_rx.await;
                self.diagnostics.resume();
            }
            None => {
                for action in actions {
                    self.replay(action, None).await?;
                }
            }
        }

        self.send_receipt(&frame).await
    }

    async fn on_abort(&mut self, frame: Frame) -> DispatchResult {
        let tx_id = self.transaction_id(&frame).await?;
        if let Err(error) = self.transactions.abort(&tx_id) {
            let message = error.to_string();
            return self.die(message).await;
        }
        self.send_receipt(&frame).await
    }

    async fn transaction_id(&mut self, frame: &Frame) -> std::result::Result<String, Died> {
        match frame.get(header::TRANSACTION) {
            Some(tx_id) => Ok(tx_id.to_string()),
            None => {
                let message = format!("{} must include a transaction header", frame.command);
                self.die(message).await.and(Err(Died))
            }
        }
    }

    async fn replay(&mut self, action: TxAction, uow: Option<Arc<dyn StoreUow>>) -> DispatchResult {
        match action {
            TxAction::Send { destination, frame } => {
                self.perform_send(destination, frame, uow).await
            }
            TxAction::Ack {
                subscription,
                message_id,
            } => {
                let Some(consumer) = self.consumers.get(&subscription).cloned() else {
                    let message =
                        format!("Subscription '{subscription}' was removed during the transaction");
                    return self.die(message).await;
                };
                if let Err(error) = consumer.perform_ack(&message_id, uow.as_deref()) {
                    let message = error.to_string();
                    return self.die(message).await;
                }
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // SUBSCRIBE / UNSUBSCRIBE
    // -----------------------------------------------------------------------

    async fn on_subscribe(&mut self, frame: Frame) -> DispatchResult {
        let destination = match frame.get(header::DESTINATION) {
            Some(value) => match Destination::parse(value) {
                Ok(destination) => destination,
                Err(error) => {
                    let message = error.to_string();
                    return self.die(message).await;
                }
            },
            None => return self.die("SUBSCRIBE must include a destination header").await,
        };

        let explicit_id = frame.get(header::ID).map(str::to_string);
        if explicit_id.is_none() && self.version != Some(ProtocolVersion::V1_0) {
            return self.die("SUBSCRIBE must include an id header").await;
        }
        let key = explicit_id
            .clone()
            .unwrap_or_else(|| destination.to_string());
        if self.consumers.contains_key(&key) {
            let message = format!("Subscription with id '{key}' already exists");
            return self.die(message).await;
        }

        let ack_mode = match AckMode::parse(frame.get(header::ACK)) {
            Ok(mode) => mode,
            Err(error) => {
                let message = error.to_string();
                return self.die(message).await;
            }
        };

        let selector = match frame.get(header::SELECTOR) {
            None => None,
            Some(raw) => match Selector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(error) => {
                    let message = format!("Invalid selector: {error}");
                    return self.die(message).await;
                }
            },
        };

        let persistent = frame.get(header::PERSISTENT) == Some("true");
        let binding = if destination.is_topic() {
            if persistent {
                Some(BindingSpec::DurableSubscription {
                    destination: destination.clone(),
                    subscription_id: key.clone(),
                    selector: selector.as_ref().map(|s| s.raw().to_string()),
                })
            } else {
                None
            }
        } else {
            Some(BindingSpec::PointToPoint {
                destination: destination.clone(),
            })
        };

        let fallback =
            (self.version == Some(ProtocolVersion::V1_0)).then(|| self.fallback_acks.clone());
        let consumer = Arc::new(ConsumerSession::new(
            explicit_id,
            destination.clone(),
            ack_mode,
            selector,
            binding.clone(),
            self.out.clone(),
            fallback,
        ));

        let router = self.router()?;
        match &binding {
            None => {
                self.diagnostics
                    .suspend(format!("binding to destination: {destination}"));
                let bound = router.bind(&destination, &consumer).await;
                self.diagnostics.resume();
                if let Err(error) = bound {
                    let message = format!("Subscribe to {destination} failed: {error}");
                    return self.die(message).await;
                }
            }
            Some(binding) => {
                self.diagnostics
                    .suspend(format!("creating queue for: {destination}"));
                let queue = router.create_queue(binding).await;
                self.diagnostics.resume();
                let Some(queue) = queue else {
                    let message = format!("Could not create queue for {destination}");
                    return self.die(message).await;
                };
                queue.bind(vec![consumer.clone()]);
            }
        }

        self.consumers.insert(key, consumer);
        self.send_receipt(&frame).await
    }

    async fn on_unsubscribe(&mut self, frame: Frame) -> DispatchResult {
        let key = match frame.get(header::ID) {
            Some(id) => id.to_string(),
            None => {
                if self.version != Some(ProtocolVersion::V1_0) {
                    return self.die("UNSUBSCRIBE must include an id header").await;
                }
                match frame.get(header::DESTINATION) {
                    Some(value) => match Destination::parse(value) {
                        Ok(destination) => destination.to_string(),
                        Err(error) => {
                            let message = error.to_string();
                            return self.die(message).await;
                        }
                    },
                    None => {
                        return self
                            .die("UNSUBSCRIBE must include an id or destination header")
                            .await
                    }
                }
            }
        };

        let Some(consumer) = self.consumers.remove(&key) else {
            let message = format!("Subscription '{key}' not found");
            return self.die(message).await;
        };
        consumer.close();

        let router = self.router()?;
        let binding = consumer.binding().cloned();
        match &binding {
            None => router.unbind(consumer.destination(), &consumer),
            Some(binding) => {
                self.diagnostics
                    .suspend(format!("resolving queue for: {}", binding.destination()));
                let queue = router.get_queue(binding).await;
                self.diagnostics.resume();
                if let Some(queue) = queue {
                    queue.unbind(vec![consumer.clone()]);
                }

                let persistent = frame.get(header::PERSISTENT) == Some("true");
                if persistent && binding.is_durable() {
                    self.diagnostics
                        .suspend(format!("destroying queue for: {}", binding.destination()));
                    let destroyed = router.destroy_queue(binding).await;
                    self.diagnostics.resume();
                    if !destroyed {
                        tracing::warn!(
                            destination = %binding.destination(),
                            "durable queue destroy did not complete"
                        );
                    }
                }
            }
        }

        self.fallback_acks.lock().retain(|_, owner| owner != &key);
        self.send_receipt(&frame).await
    }

    async fn on_disconnect(&mut self, _frame: Frame) -> DispatchResult {
        self.state = ConnectionState::Closed;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn router(&self) -> std::result::Result<Arc<dyn Router>, Died> {
        self.host.as_ref().map(|host| host.router()).ok_or(Died)
    }

    async fn send_frame(&mut self, frame: Frame) -> DispatchResult {
        if self.out.send(StompItem::Frame(frame)).await.is_err() {
            // Writer is gone; the transport already failed.
            return Err(Died);
        }
        Ok(())
    }

    async fn send_receipt(&mut self, frame: &Frame) -> DispatchResult {
        if let Some(receipt) = frame.get(header::RECEIPT) {
            let receipt = receipt.to_string();
            self.send_frame(Frame::receipt(&receipt)).await?;
        }
        Ok(())
    }

    async fn die(&mut self, message: impl Into<String>) -> DispatchResult {
        let message = message.into();
        self.die_with(Frame::error(&message)).await
    }

    /// Emit one ERROR frame, stop heart-beats, and give the client
    /// `die_delay` to read the error before the transport closes. Frames
    /// arriving while draining are ignored.
    async fn die_with(&mut self, error: Frame) -> DispatchResult {
        if self.state != ConnectionState::DrainingError && self.state != ConnectionState::Closed {
            tracing::info!(
                session = self.session_id.as_deref().unwrap_or(""),
                reason = error.get(header::MESSAGE).unwrap_or(""),
                "closing stomp connection after error"
            );
            let _ = self.out.send(StompItem::Frame(error)).await;
            if let Some(heartbeat) = &self.heartbeat {
                heartbeat.stop();
            }
            self.state = ConnectionState::DrainingError;
            self.die_deadline = Some(tokio::time::Instant::now() + self.config.die_delay());
        }
        Err(Died)
    }

    /// Idempotent resource release: unbind every subscription, disconnect
    /// every cached route, drop transaction and fallback state.
    async fn teardown(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.stop();
        }
        let Some(host) = self.host.clone() else {
            return;
        };
        let router = host.router();

        let consumers: Vec<_> = self.consumers.drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.close();
            match consumer.binding().cloned() {
                None => router.unbind(consumer.destination(), &consumer),
                Some(binding) => {
                    if let Some(queue) = router.get_queue(&binding).await {
                        queue.unbind(vec![consumer.clone()]);
                    }
                }
            }
        }

        for route in self.routes.drain() {
            router.disconnect(&route);
        }
        self.fallback_acks.lock().clear();
        self.transactions.clear();

        tracing::debug!(
            session = self.session_id.as_deref().unwrap_or(""),
            "stomp connection closed"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
