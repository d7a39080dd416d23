//! Common in-memory broker harness for connection tests.
//!
//! Provides collaborator doubles for the broker surface (router, routes,
//! queues, virtual host, store, authenticator), a framed STOMP client over
//! an in-memory duplex transport, and a builder that wires a running
//! connection out of them.

// Not all test files use all helpers; silence dead_code warnings.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::Notify;
use tokio_util::codec::Framed;

use photon::broker::{
    Authenticator, BindingSpec, BrokerFuture, BrokerQueue, Delivery, Destination, HostRegistry,
    Route, Router, SecurityContext, Store, StoreUow, VirtualHost,
};
use photon::core::config::ConnectionConfig;
use photon::stomp::codec::StompCodec;
use photon::stomp::connection::{ConnectionDiagnostics, StompConnection};
use photon::stomp::consumer::ConsumerSession;
use photon::stomp::frame::{command, header, Frame, StompItem};

/// Virtual host name every test connects to.
pub const HOST: &str = "photon";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Store double
// ---------------------------------------------------------------------------

pub struct TestUow {
    released: Mutex<bool>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl TestUow {
    fn new() -> Self {
        Self {
            released: Mutex::new(false),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }
}

impl StoreUow for TestUow {
    fn on_complete(&self, callback: Box<dyn FnOnce() + Send>) {
        if *self.released.lock() {
            callback();
        } else {
            self.callbacks.lock().push(callback);
        }
    }

    fn release(&self) {
        *self.released.lock() = true;
        let callbacks: Vec<_> = self.callbacks.lock().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }
}

#[derive(Default)]
pub struct TestStore {
    pub uows: Mutex<Vec<Arc<TestUow>>>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uow_count(&self) -> usize {
        self.uows.lock().len()
    }
}

impl Store for TestStore {
    fn create_uow(&self) -> Arc<dyn StoreUow> {
        let uow = Arc::new(TestUow::new());
        self.uows.lock().push(uow.clone());
        uow
    }
}

// ---------------------------------------------------------------------------
// Router double
// ---------------------------------------------------------------------------

type ConsumerMap = Arc<Mutex<HashMap<Destination, Vec<Arc<ConsumerSession>>>>>;

/// Route double. Without a configured capacity it fans deliveries straight
/// out to bound consumers; with one it buffers them so tests can exercise
/// producer backpressure, draining manually with [`TestRoute::take_buffered`].
pub struct TestRoute {
    destination: Destination,
    consumers: ConsumerMap,
    capacity: Option<usize>,
    buffered: Arc<Mutex<VecDeque<Delivery>>>,
    refill: Arc<Notify>,
}

impl TestRoute {
    pub fn buffered_len(&self) -> usize {
        self.buffered.lock().len()
    }

    pub fn take_buffered(&self) -> Vec<Delivery> {
        let drained: Vec<_> = self.buffered.lock().drain(..).collect();
        self.refill.notify_waiters();
        drained
    }

    fn consumers(&self) -> Vec<Arc<ConsumerSession>> {
        self.consumers
            .lock()
            .get(&self.destination)
            .cloned()
            .unwrap_or_default()
    }
}

impl Route for TestRoute {
    fn offer(&self, delivery: Delivery) -> bool {
        if self.capacity.is_some() {
            self.buffered.lock().push_back(delivery);
            return true;
        }
        let consumers = self.consumers();
        if let Some(consumer) = consumers.iter().find(|c| c.matches(&delivery)) {
            consumer.offer(delivery);
        }
        true
    }

    fn has_targets(&self) -> bool {
        self.capacity.is_some() || !self.consumers().is_empty()
    }

    fn is_full(&self) -> bool {
        self.capacity
            .map_or(false, |capacity| self.buffered.lock().len() >= capacity)
    }

    fn refilled(&self) -> BrokerFuture<()> {
        let refill = self.refill.clone();
        let buffered = self.buffered.clone();
        let capacity = self.capacity;
        Box::pin(async move {
            loop {
                let waiter = refill.notified();
                if capacity.map_or(true, |c| buffered.lock().len() < c) {
                    return;
                }
                waiter.await;
            }
        })
    }
}

pub struct TestQueue {
    pub binding: BindingSpec,
    pub consumers: Mutex<Vec<Arc<ConsumerSession>>>,
}

impl TestQueue {
    /// Deliver to the first bound consumer whose selector matches. Returns
    /// `false` when no consumer accepted it.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        let consumers = self.consumers.lock().clone();
        match consumers.iter().find(|c| c.matches(&delivery)) {
            Some(consumer) => consumer.offer(delivery),
            None => false,
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl BrokerQueue for TestQueue {
    fn bind(&self, consumers: Vec<Arc<ConsumerSession>>) {
        self.consumers.lock().extend(consumers);
    }

    fn unbind(&self, consumers: Vec<Arc<ConsumerSession>>) {
        self.consumers
            .lock()
            .retain(|existing| !consumers.iter().any(|c| Arc::ptr_eq(c, existing)));
    }
}

#[derive(Default)]
pub struct TestRouter {
    consumers: ConsumerMap,
    queues: Mutex<HashMap<BindingSpec, Arc<TestQueue>>>,
    routes: Mutex<HashMap<Destination, Arc<TestRoute>>>,
    route_capacity: Mutex<HashMap<Destination, usize>>,
    pub disconnects: AtomicUsize,
    pub destroyed: Mutex<Vec<BindingSpec>>,
}

impl TestRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make routes to `destination` buffer deliveries with the given
    /// capacity instead of fanning out, to exercise backpressure.
    pub fn set_route_capacity(&self, destination: &str, capacity: usize) {
        let destination = Destination::parse(destination).expect("test destination");
        self.route_capacity.lock().insert(destination, capacity);
    }

    pub fn route(&self, destination: &str) -> Option<Arc<TestRoute>> {
        let destination = Destination::parse(destination).expect("test destination");
        self.routes.lock().get(&destination).cloned()
    }

    pub fn queue(&self, binding: &BindingSpec) -> Option<Arc<TestQueue>> {
        self.queues.lock().get(binding).cloned()
    }

    pub fn first_queue(&self) -> Option<Arc<TestQueue>> {
        self.queues.lock().values().next().cloned()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn bound_consumers(&self, destination: &str) -> usize {
        let destination = Destination::parse(destination).expect("test destination");
        self.consumers
            .lock()
            .get(&destination)
            .map_or(0, Vec::len)
    }
}

impl Router for TestRouter {
    fn connect(
        &self,
        destination: &Destination,
        _producer_id: &str,
    ) -> BrokerFuture<anyhow::Result<Arc<dyn Route>>> {
        let destination = destination.clone();
        let consumers = self.consumers.clone();
        let capacity = self.route_capacity.lock().get(&destination).copied();
        let route = Arc::new(TestRoute {
            destination: destination.clone(),
            consumers,
            capacity,
            buffered: Arc::new(Mutex::new(VecDeque::new())),
            refill: Arc::new(Notify::new()),
        });
        self.routes.lock().insert(destination, route.clone());
        Box::pin(async move { Ok(route as Arc<dyn Route>) })
    }

    fn disconnect(&self, _route: &Arc<dyn Route>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn bind(
        &self,
        destination: &Destination,
        consumer: &Arc<ConsumerSession>,
    ) -> BrokerFuture<anyhow::Result<()>> {
        self.consumers
            .lock()
            .entry(destination.clone())
            .or_default()
            .push(consumer.clone());
        Box::pin(async { Ok(()) })
    }

    fn unbind(&self, destination: &Destination, consumer: &Arc<ConsumerSession>) {
        if let Some(bound) = self.consumers.lock().get_mut(destination) {
            bound.retain(|existing| !Arc::ptr_eq(existing, consumer));
        }
    }

    fn create_queue(&self, binding: &BindingSpec) -> BrokerFuture<Option<Arc<dyn BrokerQueue>>> {
        let queue = self
            .queues
            .lock()
            .entry(binding.clone())
            .or_insert_with(|| {
                Arc::new(TestQueue {
                    binding: binding.clone(),
                    consumers: Mutex::new(Vec::new()),
                })
            })
            .clone();
        Box::pin(async move { Some(queue as Arc<dyn BrokerQueue>) })
    }

    fn destroy_queue(&self, binding: &BindingSpec) -> BrokerFuture<bool> {
        let existed = self.queues.lock().remove(binding).is_some();
        if existed {
            self.destroyed.lock().push(binding.clone());
        }
        Box::pin(async move { existed })
    }

    fn get_queue(&self, binding: &BindingSpec) -> BrokerFuture<Option<Arc<dyn BrokerQueue>>> {
        let queue = self
            .queues
            .lock()
            .get(binding)
            .cloned()
            .map(|q| q as Arc<dyn BrokerQueue>);
        Box::pin(async move { queue })
    }
}

// ---------------------------------------------------------------------------
// Host double
// ---------------------------------------------------------------------------

pub struct StaticAuthenticator {
    pub user: String,
    pub password: String,
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, ctx: &SecurityContext) -> BrokerFuture<bool> {
        let ok = ctx.user.as_deref() == Some(self.user.as_str())
            && ctx.password.as_deref() == Some(self.password.as_str());
        Box::pin(async move { ok })
    }
}

pub struct TestHost {
    id: String,
    session_counter: AtomicU64,
    router: Arc<TestRouter>,
    authenticator: Option<Arc<dyn Authenticator>>,
    store: Option<Arc<TestStore>>,
}

impl VirtualHost for TestHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn next_session(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn router(&self) -> Arc<dyn Router> {
        self.router.clone()
    }

    fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.authenticator.clone()
    }

    fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone().map(|s| s as Arc<dyn Store>)
    }

    fn buffer_pool(&self) -> Option<Arc<dyn photon::broker::BufferPool>> {
        None
    }
}

pub struct TestRegistry {
    pub host: Arc<TestHost>,
}

impl HostRegistry for TestRegistry {
    fn lookup(&self, name: Option<&str>) -> BrokerFuture<Option<Arc<dyn VirtualHost>>> {
        let matches = name.map_or(true, |n| n == self.host.id);
        let host = self.host.clone();
        Box::pin(async move { matches.then_some(host as Arc<dyn VirtualHost>) })
    }
}

// ---------------------------------------------------------------------------
// Framed client
// ---------------------------------------------------------------------------

pub struct StompClient {
    framed: Framed<DuplexStream, StompCodec>,
}

impl StompClient {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            framed: Framed::new(io, StompCodec::default()),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed
            .send(StompItem::Frame(frame))
            .await
            .expect("send frame");
    }

    pub async fn recv(&mut self) -> Option<StompItem> {
        match self.framed.next().await {
            Some(Ok(item)) => Some(item),
            Some(Err(error)) => panic!("client codec error: {error}"),
            None => None,
        }
    }

    /// Next full frame, skipping keep-alive newlines.
    pub async fn recv_frame(&mut self) -> Frame {
        loop {
            match self.recv().await {
                Some(StompItem::Frame(frame)) => return frame,
                Some(StompItem::Heartbeat) => continue,
                None => panic!("connection closed while expecting a frame"),
            }
        }
    }

    /// Read until the server closes the transport.
    pub async fn read_to_eof(&mut self) -> Vec<StompItem> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }

    /// CONNECT and expect CONNECTED.
    pub async fn connect(&mut self, accept_version: &str) -> Frame {
        self.send(
            Frame::new(command::CONNECT)
                .header(header::ACCEPT_VERSION, accept_version)
                .header(header::HOST, HOST)
                .header(header::HEART_BEAT, "0,0"),
        )
        .await;
        let connected = self.recv_frame().await;
        assert_eq!(connected.command, command::CONNECTED);
        connected
    }

    /// Round-trip a frame carrying a receipt header and wait for it.
    pub async fn send_with_receipt(&mut self, frame: Frame, receipt_id: &str) {
        self.send(frame.header(header::RECEIPT, receipt_id)).await;
        let receipt = self.recv_frame().await;
        assert_eq!(receipt.command, command::RECEIPT);
        assert_eq!(receipt.get(header::RECEIPT_ID), Some(receipt_id));
    }
}

// ---------------------------------------------------------------------------
// Broker fixture
// ---------------------------------------------------------------------------

pub struct Broker {
    pub router: Arc<TestRouter>,
    pub host: Arc<TestHost>,
    pub store: Option<Arc<TestStore>>,
    pub diagnostics: ConnectionDiagnostics,
    pub client: StompClient,
    pub connection: tokio::task::JoinHandle<anyhow::Result<()>>,
}

pub struct BrokerBuilder {
    config: ConnectionConfig,
    store: bool,
    authenticator: Option<Arc<dyn Authenticator>>,
    route_capacity: Vec<(String, usize)>,
}

impl BrokerBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            store: false,
            authenticator: None,
            route_capacity: Vec::new(),
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self) -> Self {
        self.store = true;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn route_capacity(mut self, destination: &str, capacity: usize) -> Self {
        self.route_capacity.push((destination.to_string(), capacity));
        self
    }

    pub fn start(self) -> Broker {
        init_tracing();

        let router = TestRouter::new();
        for (destination, capacity) in &self.route_capacity {
            router.set_route_capacity(destination, *capacity);
        }
        let store = self.store.then(TestStore::new);
        let host = Arc::new(TestHost {
            id: HOST.to_string(),
            session_counter: AtomicU64::new(0),
            router: router.clone(),
            authenticator: self.authenticator,
            store: store.clone(),
        });
        let registry = Arc::new(TestRegistry { host: host.clone() });

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let connection = StompConnection::new(registry, self.config);
        let diagnostics = connection.diagnostics();
        let handle = tokio::spawn(connection.run(server_io));

        Broker {
            router,
            host,
            store,
            diagnostics,
            client: StompClient::new(client_io),
            connection: handle,
        }
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
