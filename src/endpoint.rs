use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use coap_lite::MessageType;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Codec, ParseError, ParsedMessage};
use crate::config::CoapConfig;
use crate::connector::{Connector, OutboundData, RawData, Scheme, UdpConnector};
use crate::deliverer::{ClientMessageDeliverer, MessageDeliverer};
use crate::exchange::{Exchange, Origin};
use crate::interceptor::{run_contained, MessageInterceptor, SnapshotList};
use crate::matcher::Matcher;
use crate::message::{lock, EmptyMessage, Request, Response};
use crate::observe::{InMemoryObservationStore, NotificationListener, ObservationStore};
use crate::stack::{
    BlockwiseLayer, Effects, Layer, ObserveLayer, Outcome, ProtocolStack, ReliabilityLayer,
};
use crate::store::{ExchangeStore, KeyMid};
use crate::EndpointError;

/// Interval of the housekeeping tick that evicts exchanges and dedup
/// entries past their lifetime.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the inbox channel between the connector and the protocol
/// stage.
const INBOX_CAPACITY: usize = 100;

/// Lifecycle callbacks of the endpoint itself (unrelated to CoAP observe
/// relations).
pub trait EndpointObserver: Send + Sync {
    fn started(&self, _endpoint: &CoapEndpoint) {}

    fn stopped(&self, _endpoint: &CoapEndpoint) {}

    fn destroyed(&self, _endpoint: &CoapEndpoint) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
    Destroyed,
}

enum Command {
    SendRequest(Arc<Exchange>, Request),
    SendResponse(Arc<Exchange>, Response),
}

struct EndpointState {
    lifecycle: Lifecycle,
    driver: Option<JoinHandle<()>>,
}

/// Builds a [`CoapEndpoint`]. The protocol variant (datagram or stream)
/// follows from the connector's scheme.
pub struct CoapEndpointBuilder {
    config: CoapConfig,
    connector: Option<Arc<dyn Connector>>,
    bind_addr: Option<SocketAddr>,
    deliverer: Option<Arc<dyn MessageDeliverer>>,
    observation_store: Option<Arc<dyn ObservationStore>>,
    exchange_store: Option<Arc<ExchangeStore>>,
}

impl Default for CoapEndpointBuilder {
    fn default() -> Self {
        Self {
            config: CoapConfig::default(),
            connector: None,
            bind_addr: None,
            deliverer: None,
            observation_store: None,
            exchange_store: None,
        }
    }
}

impl CoapEndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CoapConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses a plain UDP connector bound to `addr`.
    pub fn bind_udp(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn deliverer(mut self, deliverer: Arc<dyn MessageDeliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn observation_store(mut self, store: Arc<dyn ObservationStore>) -> Self {
        self.observation_store = Some(store);
        self
    }

    pub fn exchange_store(mut self, store: Arc<ExchangeStore>) -> Self {
        self.exchange_store = Some(store);
        self
    }

    pub fn build(self) -> CoapEndpoint {
        let config = self.config;
        let connector = self.connector.unwrap_or_else(|| {
            let addr = self
                .bind_addr
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            Arc::new(UdpConnector::new(addr, &config))
        });

        let store = self
            .exchange_store
            .unwrap_or_else(|| Arc::new(ExchangeStore::new(&config)));
        let observations: Arc<dyn ObservationStore> = self
            .observation_store
            .unwrap_or_else(|| Arc::new(InMemoryObservationStore::new()));

        let tcp = connector.scheme().is_tcp();
        let (scheme, secure_scheme, codec) = if tcp {
            (Scheme::CoapTcp, Scheme::CoapsTcp, Codec::Tcp)
        } else {
            (Scheme::Coap, Scheme::Coaps, Codec::Udp)
        };

        let matcher = if tcp {
            Matcher::tcp(store.clone(), observations.clone())
        } else {
            Matcher::udp(store.clone(), observations.clone())
        };

        let mut layers: Vec<Box<dyn Layer>> = vec![
            Box::new(ObserveLayer::new(&config, observations.clone())),
            Box::new(BlockwiseLayer::new(&config)),
        ];
        if !tcp {
            layers.push(Box::new(ReliabilityLayer::new(&config, store.clone())));
        }
        let stack = ProtocolStack::new(layers);

        let core = Arc::new(EndpointCore {
            config,
            scheme,
            secure_scheme,
            connector,
            codec,
            matcher,
            stack,
            store,
            deliverer: RwLock::new(self.deliverer),
            interceptors: SnapshotList::new(),
            listeners: SnapshotList::new(),
            commands: RwLock::new(None),
            deadline_changed: Notify::new(),
            started: AtomicBool::new(false),
        });

        CoapEndpoint {
            core,
            observers: SnapshotList::new(),
            state: Mutex::new(EndpointState {
                lifecycle: Lifecycle::Created,
                driver: None,
            }),
        }
    }
}

/// A CoAP endpoint: owns one transport binding and runs the protocol
/// machinery on top of it. Outbound requests from local callers travel
/// down the stack into the matcher and connector; inbound frames travel
/// up through the matcher and stack into the message deliverer.
///
/// All exchange state is mutated on the protocol stage, a dedicated task
/// the endpoint spawns at start; shared tables tolerate the synchronous
/// send paths that run on caller threads.
pub struct CoapEndpoint {
    core: Arc<EndpointCore>,
    observers: SnapshotList<dyn EndpointObserver>,
    state: Mutex<EndpointState>,
}

impl CoapEndpoint {
    pub fn builder() -> CoapEndpointBuilder {
        CoapEndpointBuilder::new()
    }

    /// Starts the endpoint: installs the default deliverer when none is
    /// configured, starts matcher and connector and spawns the protocol
    /// stage. Idempotent while started. A transport failure rolls back via
    /// [`stop`](Self::stop) and propagates.
    pub async fn start(&self) -> Result<(), EndpointError> {
        {
            let mut state = lock(&self.state);
            match state.lifecycle {
                Lifecycle::Started => {
                    debug!(uri = %self.uri(), "endpoint is already started");
                    return Ok(());
                }
                Lifecycle::Destroyed => return Err(EndpointError::Destroyed),
                _ => state.lifecycle = Lifecycle::Started,
            }
        }

        {
            let mut deliverer = self
                .core
                .deliverer
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if deliverer.is_none() {
                debug!("no deliverer configured, installing client message deliverer");
                *deliverer = Some(Arc::new(ClientMessageDeliverer));
            }
        }

        info!(uri = %self.uri(), "starting endpoint");

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self
            .core
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(command_tx);

        self.core.started.store(true, Ordering::Release);
        self.core.matcher.start();

        if let Err(e) = self.core.connector.start(inbox_tx).await {
            // Free partially acquired resources.
            self.stop();
            return Err(e.into());
        }

        let driver = tokio::spawn(drive(self.core.clone(), command_rx, inbox_rx));
        lock(&self.state).driver = Some(driver);

        for observer in self.observers.snapshot().iter() {
            run_contained("endpoint observer", || observer.started(self));
        }

        // Poke the driver so it computes its first deadline right away.
        self.core.deadline_changed.notify_one();
        info!(uri = %self.uri(), "started endpoint");
        Ok(())
    }

    /// Stops connector, matcher and protocol stage. The endpoint can be
    /// started again.
    pub fn stop(&self) {
        let driver = {
            let mut state = lock(&self.state);
            if state.lifecycle != Lifecycle::Started {
                info!(uri = %self.uri(), "endpoint is already stopped");
                return;
            }
            state.lifecycle = Lifecycle::Stopped;
            state.driver.take()
        };

        info!(uri = %self.uri(), "stopping endpoint");
        self.core.started.store(false, Ordering::Release);
        self.core.connector.stop();
        self.core.matcher.stop();
        *self
            .core
            .commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        if let Some(driver) = driver {
            driver.abort();
        }

        for observer in self.observers.snapshot().iter() {
            run_contained("endpoint observer", || observer.stopped(self));
        }
        self.core.matcher.clear();
    }

    /// Stops the endpoint if needed and releases the transport. Terminal.
    pub fn destroy(&self) {
        if lock(&self.state).lifecycle == Lifecycle::Destroyed {
            return;
        }
        info!(uri = %self.uri(), "destroying endpoint");
        self.stop();
        lock(&self.state).lifecycle = Lifecycle::Destroyed;
        self.core.connector.destroy();
        for observer in self.observers.snapshot().iter() {
            run_contained("endpoint observer", || observer.destroyed(self));
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).lifecycle == Lifecycle::Started
    }

    /// Hands an outbound request to the protocol stage and returns the
    /// slot the matched response (or failure) arrives on.
    pub fn send_request(
        &self,
        request: Request,
    ) -> Result<oneshot::Receiver<Result<Response, EndpointError>>, EndpointError> {
        let destination = request
            .destination()
            .ok_or(EndpointError::InvalidArgument("request has no destination address"))?;
        if !self.core.started.load(Ordering::Acquire) {
            return Err(EndpointError::NotStarted);
        }

        let exchange = Arc::new(Exchange::new(Origin::Local, destination));
        let rx = request.sink.subscribe();
        exchange.set_request(request.clone());
        self.core.post(Command::SendRequest(exchange, request))?;
        Ok(rx)
    }

    /// Sends a response for a remote exchange. Runs on the caller's
    /// thread unless the exchange asked for the protocol stage.
    pub fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: Response,
    ) -> Result<(), EndpointError> {
        if exchange.has_custom_executor() {
            self.core
                .post(Command::SendResponse(exchange.clone(), response))
        } else {
            // Same thread, saves the context switch.
            self.core.stack_send_response(exchange, response);
            Ok(())
        }
    }

    /// Sends an ACK or RST. Always synchronous on the caller's thread so
    /// explicit accepts and rejects keep their ordering relative to the
    /// application's other calls.
    pub fn send_empty_message(&self, exchange: Option<&Arc<Exchange>>, message: EmptyMessage) {
        self.core.stack_send_empty(exchange, message);
    }

    /// Cancels the observation established under `token`.
    pub fn cancel_observation(&self, token: &[u8]) {
        self.core.matcher.cancel_observe(token);
    }

    pub fn set_message_deliverer(&self, deliverer: Arc<dyn MessageDeliverer>) {
        *self
            .core
            .deliverer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(deliverer);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn MessageInterceptor>) {
        self.core.interceptors.add(interceptor);
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<dyn MessageInterceptor>) {
        self.core.interceptors.remove(interceptor);
    }

    pub fn add_observer(&self, observer: Arc<dyn EndpointObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn EndpointObserver>) {
        self.observers.remove(observer);
    }

    pub fn add_notification_listener(&self, listener: Arc<dyn NotificationListener>) {
        self.core.listeners.add(listener);
    }

    pub fn remove_notification_listener(&self, listener: &Arc<dyn NotificationListener>) {
        self.core.listeners.remove(listener);
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.core.connector.local_addr()
    }

    pub fn uri(&self) -> String {
        self.core.connector.uri()
    }

    pub fn config(&self) -> &CoapConfig {
        &self.core.config
    }

    pub fn scheme(&self) -> Scheme {
        self.core.scheme
    }
}

struct EndpointCore {
    config: CoapConfig,
    scheme: Scheme,
    secure_scheme: Scheme,
    connector: Arc<dyn Connector>,
    codec: Codec,
    matcher: Matcher,
    stack: ProtocolStack,
    store: Arc<ExchangeStore>,
    deliverer: RwLock<Option<Arc<dyn MessageDeliverer>>>,
    interceptors: SnapshotList<dyn MessageInterceptor>,
    listeners: SnapshotList<dyn NotificationListener>,
    commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    deadline_changed: Notify,
    started: AtomicBool,
}

impl EndpointCore {
    fn post(&self, command: Command) -> Result<(), EndpointError> {
        let guard = self
            .commands
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(command).map_err(|_| EndpointError::NotStarted),
            None => Err(EndpointError::NotStarted),
        }
    }

    fn process(&self, command: Command) {
        match command {
            Command::SendRequest(exchange, request) => self.stack_send_request(&exchange, request),
            Command::SendResponse(exchange, response) => {
                self.stack_send_response(&exchange, response)
            }
        }
    }

    // --- send paths: stack traversal top to bottom, then the outbox ---

    fn stack_send_request(&self, exchange: &Arc<Exchange>, request: Request) {
        let mut effects = Effects::default();
        self.do_send_request(exchange, request, &mut effects);
        self.drain(effects);
    }

    fn stack_send_response(&self, exchange: &Arc<Exchange>, response: Response) {
        let mut effects = Effects::default();
        self.do_send_response(exchange, response, &mut effects);
        self.drain(effects);
    }

    fn stack_send_empty(&self, exchange: Option<&Arc<Exchange>>, message: EmptyMessage) {
        let mut effects = Effects::default();
        self.do_send_empty(exchange, message, &mut effects);
        self.drain(effects);
    }

    fn do_send_request(&self, exchange: &Arc<Exchange>, mut request: Request, effects: &mut Effects) {
        if self.stack.send_request(exchange, &mut request, effects) == Outcome::Forward {
            self.outbox_request(exchange, request);
        }
    }

    fn do_send_response(
        &self,
        exchange: &Arc<Exchange>,
        mut response: Response,
        effects: &mut Effects,
    ) {
        if self.stack.send_response(exchange, &mut response, effects) == Outcome::Forward {
            self.outbox_response(exchange, response);
        }
    }

    fn do_send_empty(
        &self,
        exchange: Option<&Arc<Exchange>>,
        mut message: EmptyMessage,
        effects: &mut Effects,
    ) {
        if self.stack.send_empty(exchange, &mut message, effects) == Outcome::Forward {
            self.outbox_empty(exchange, &message);
        }
    }

    /// Routes layer emissions until quiescent. Responses and requests
    /// re-enter the send path, raw frames go straight to the connector.
    fn drain(&self, mut effects: Effects) {
        while !effects.is_empty() {
            let batch = std::mem::take(&mut effects);
            for (peer, bytes) in batch.raw_frames {
                self.connector.send(OutboundData::new(bytes, peer));
            }
            for (exchange, response) in batch.responses {
                self.do_send_response(&exchange, response, &mut effects);
            }
            for (exchange, request) in batch.requests {
                self.do_send_request(&exchange, request, &mut effects);
            }
            for (exchange, message) in batch.empties {
                self.do_send_empty(exchange.as_ref(), message, &mut effects);
            }
        }
    }

    fn outbox_request(&self, exchange: &Arc<Exchange>, mut request: Request) {
        if request.destination().is_none() {
            error!("request has no destination address");
            request
                .sink
                .complete(Err(EndpointError::InvalidArgument("request has no destination address")));
            exchange.complete();
            return;
        }
        if let Err(e) = self.matcher.send_request(exchange, &mut request) {
            warn!(error = %e, "matcher rejected outbound request");
            request.sink.complete(Err(e));
            exchange.complete();
            return;
        }

        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || interceptor.send_request(&request));
        }
        if request.is_canceled() {
            return;
        }

        let bytes = match self.codec.serialize(request.packet()) {
            Ok(bytes) => bytes,
            Err(e) => {
                request.sink.complete(Err(e));
                exchange.complete();
                return;
            }
        };

        if let Some(initial_timeout) = exchange.take_needs_reliability() {
            exchange.arm_retransmission(bytes.clone(), initial_timeout, Instant::now());
            self.deadline_changed.notify_one();
        }

        let destination = exchange.remote();
        let mut data = OutboundData::new(bytes, destination);
        // Weak back-reference: the transport reports the established
        // session without keeping the exchange alive.
        let weak = Arc::downgrade(exchange);
        data.context_callback = Some(Box::new(move |context| {
            if let Some(exchange) = weak.upgrade() {
                exchange.set_correlation_context(context);
            }
        }));
        self.connector.send(data);
    }

    fn outbox_response(&self, exchange: &Arc<Exchange>, mut response: Response) {
        self.matcher.send_response(exchange, &mut response);
        let destination = match response.destination() {
            Some(destination) => destination,
            None => {
                error!("response has no destination address");
                return;
            }
        };

        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || interceptor.send_response(&response));
        }
        if response.is_canceled() {
            return;
        }

        let bytes = match self.codec.serialize(response.packet()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode response");
                return;
            }
        };

        // Remember the answer for duplicates of the request MID.
        if exchange.origin() == Origin::Remote {
            if let Some(mid) = exchange.request_mid() {
                self.store
                    .cache_response(&KeyMid::new(mid, exchange.remote()), bytes.clone());
            }
        }

        if let Some(initial_timeout) = exchange.take_needs_reliability() {
            exchange.arm_retransmission(bytes.clone(), initial_timeout, Instant::now());
            self.deadline_changed.notify_one();
        }

        self.connector.send(OutboundData::new(bytes, destination));
    }

    fn outbox_empty(&self, exchange: Option<&Arc<Exchange>>, message: &EmptyMessage) {
        let destination = match message.destination() {
            Some(destination) => destination,
            None => {
                error!("empty message has no destination address");
                return;
            }
        };
        self.matcher.send_empty(exchange, message);

        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || {
                interceptor.send_empty_message(message)
            });
        }
        if message.is_canceled() {
            return;
        }

        let bytes = match self.codec.serialize(message.packet()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode empty message");
                return;
            }
        };

        // A bare ACK answers the request MID; keep it for duplicates.
        if message.message_type() == MessageType::Acknowledgement {
            if let Some(exchange) = exchange {
                if exchange.origin() == Origin::Remote {
                    self.store
                        .cache_response(&KeyMid::new(message.mid(), destination), bytes.clone());
                }
            }
        }

        self.connector.send(OutboundData::new(bytes, destination));
    }

    // --- receive paths: parse, interceptors, matcher, stack bottom-up ---

    fn receive_data(&self, raw: RawData) {
        if raw.source.port() == 0 {
            error!("received frame without a source port");
            return;
        }

        match self.codec.parse(&raw.bytes, raw.source) {
            Ok(ParsedMessage::Request(request)) => self.receive_request(request, &raw),
            Ok(ParsedMessage::Response(response)) => self.receive_response(response, &raw),
            Ok(ParsedMessage::Empty(message)) => self.receive_empty(message, &raw),
            Ok(ParsedMessage::Ignored) => {
                debug!(peer = %raw.source, "silently ignoring non-CoAP message");
            }
            Err(ParseError::Malformed {
                confirmable: true,
                mid: Some(mid),
            }) if self.matcher.is_udp() => {
                // Reject the reliably transmitted malformed message.
                debug!(peer = %raw.source, mid, "rejecting malformed confirmable message");
                self.reject_mid(mid, raw.source);
            }
            Err(e) => {
                debug!(peer = %raw.source, error = %e, "discarding malformed message");
            }
        }
    }

    fn reject_mid(&self, mid: u16, peer: SocketAddr) {
        self.stack_send_empty(None, EmptyMessage::rst(mid, peer));
    }

    fn receive_request(&self, mut request: Request, raw: &RawData) {
        request.set_scheme(if raw.secure {
            self.secure_scheme
        } else {
            self.scheme
        });

        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || interceptor.receive_request(&request));
        }
        if request.is_canceled() {
            return;
        }

        let exchange = self.matcher.receive_request(&mut request, raw.source);
        let mut effects = Effects::default();
        if self.stack.receive_request(&exchange, &mut request, &mut effects) == Outcome::Forward {
            self.deliver_request(exchange, request);
        }
        self.drain(effects);
    }

    fn receive_response(&self, mut response: Response, raw: &RawData) {
        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || {
                interceptor.receive_response(&response)
            });
        }
        if response.is_canceled() {
            return;
        }

        match self.matcher.receive_response(&mut response, raw.context.as_ref()) {
            Some(exchange) => {
                response.set_round_trip_time(exchange.elapsed());
                let mut effects = Effects::default();
                if self.stack.receive_response(&exchange, &mut response, &mut effects)
                    == Outcome::Forward
                {
                    exchange.set_response(response.clone());
                    if !exchange.has_observe_relation() {
                        exchange.complete();
                    }
                    if response.observe().is_some() {
                        self.dispatch_notification(&exchange, &response);
                    }
                    self.deliver_response(exchange, response);
                }
                self.drain(effects);
                self.deadline_changed.notify_one();
            }
            None if response.message_type() != MessageType::Acknowledgement
                && self.matcher.is_udp() =>
            {
                debug!(peer = %raw.source, "rejecting unmatchable response");
                self.reject_mid(response.mid(), raw.source);
            }
            None => {
                debug!(peer = %raw.source, "discarding unmatchable response");
            }
        }
    }

    fn receive_empty(&self, mut message: EmptyMessage, raw: &RawData) {
        for interceptor in self.interceptors.snapshot().iter() {
            run_contained("message interceptor", || {
                interceptor.receive_empty_message(&message)
            });
        }
        if message.is_canceled() {
            return;
        }

        if matches!(
            message.message_type(),
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            // CoAP ping.
            trace!(peer = %raw.source, "responding to ping with RST");
            self.reject_mid(message.mid(), raw.source);
            return;
        }

        match self.matcher.receive_empty(&message) {
            Some(exchange) => {
                let mut effects = Effects::default();
                self.stack.receive_empty(&exchange, &mut message, &mut effects);
                self.drain(effects);
                self.deadline_changed.notify_one();
            }
            None => {
                trace!(peer = %raw.source, mid = message.mid(), "ignoring empty message for unknown exchange");
            }
        }
    }

    fn deliver_request(&self, exchange: Arc<Exchange>, request: Request) {
        let deliverer = self
            .deliverer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match deliverer {
            Some(deliverer) => {
                run_contained("message deliverer", || {
                    deliverer.deliver_request(exchange, request)
                });
            }
            None => debug!("no deliverer installed, dropping request"),
        }
    }

    fn deliver_response(&self, exchange: Arc<Exchange>, response: Response) {
        let deliverer = self
            .deliverer
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(deliverer) = deliverer {
            run_contained("message deliverer", || {
                deliverer.deliver_response(exchange, response)
            });
        }
    }

    fn dispatch_notification(&self, exchange: &Arc<Exchange>, response: &Response) {
        if let Some(request) = exchange.request() {
            for listener in self.listeners.snapshot().iter() {
                run_contained("notification listener", || {
                    listener.on_notification(&request, response)
                });
            }
        }
    }

    // --- timers ---

    fn fire_deadlines(&self) {
        let now = Instant::now();
        let (resend, exhausted) = self
            .store
            .collect_retransmissions(now, self.config.max_retransmit);
        for (peer, bytes) in resend {
            trace!(peer = %peer, "retransmitting confirmable message");
            self.connector.send(OutboundData::new(bytes, peer));
        }
        for exchange in exhausted {
            warn!(peer = %exchange.remote(), "no acknowledgement, giving up");
            exchange.fail(EndpointError::Timeout {
                retransmits: self.config.max_retransmit,
            });
        }
        for exchange in self.store.expired_non(now) {
            exchange.fail(EndpointError::Timeout { retransmits: 0 });
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        for exchange in self.store.sweep(now) {
            debug!(peer = %exchange.remote(), "evicting exchange past its lifetime");
            let retransmits = exchange.retransmit_count();
            exchange.fail(EndpointError::Timeout { retransmits });
        }
        self.stack.sweep(now);
    }
}

/// The protocol stage: one task owning inbound dispatch, posted sends and
/// every timer. Panics in a unit of work are contained so the stage
/// itself keeps running.
async fn drive(
    core: Arc<EndpointCore>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut inbox: mpsc::Receiver<RawData>,
) {
    let mut next_sweep = Instant::now() + SWEEP_INTERVAL;
    loop {
        let deadline = core.store.next_deadline();
        let deadline_timer = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => run_contained("protocol stage task", || core.process(command)),
                None => return,
            },
            raw = inbox.recv() => match raw {
                Some(raw) => run_contained("protocol stage task", || core.receive_data(raw)),
                None => return,
            },
            _ = core.deadline_changed.notified() => {
                // A timer was armed or disarmed; recompute the deadline.
            }
            _ = deadline_timer => {
                run_contained("protocol stage task", || core.fire_deadlines());
            }
            _ = tokio::time::sleep_until(next_sweep) => {
                run_contained("protocol stage task", || core.sweep());
                next_sweep = Instant::now() + SWEEP_INTERVAL;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::{RequestType, ResponseType};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let endpoint = CoapEndpoint::builder().bind_udp(loopback()).build();
        assert!(!endpoint.is_started());

        endpoint.start().await.unwrap();
        assert!(endpoint.is_started());
        // Idempotent while started.
        endpoint.start().await.unwrap();
        assert!(endpoint.address().is_some());

        endpoint.stop();
        assert!(!endpoint.is_started());

        // Stopped endpoints can be started again.
        endpoint.start().await.unwrap();
        endpoint.destroy();
        assert!(!endpoint.is_started());
        assert!(matches!(
            endpoint.start().await,
            Err(EndpointError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn lifecycle_observer_sees_transitions() {
        struct Recorder(Mutex<Vec<&'static str>>);
        impl EndpointObserver for Recorder {
            fn started(&self, _: &CoapEndpoint) {
                lock(&self.0).push("started");
            }
            fn stopped(&self, _: &CoapEndpoint) {
                lock(&self.0).push("stopped");
            }
            fn destroyed(&self, _: &CoapEndpoint) {
                lock(&self.0).push("destroyed");
            }
        }

        let endpoint = CoapEndpoint::builder().bind_udp(loopback()).build();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        endpoint.add_observer(recorder.clone());

        endpoint.start().await.unwrap();
        endpoint.destroy();
        assert_eq!(*lock(&recorder.0), vec!["started", "stopped", "destroyed"]);
    }

    #[tokio::test]
    async fn send_request_requires_destination_and_start() {
        let endpoint = CoapEndpoint::builder().bind_udp(loopback()).build();

        let request = Request::new(RequestType::Get);
        assert!(matches!(
            endpoint.send_request(request),
            Err(EndpointError::InvalidArgument(_))
        ));

        let mut request = Request::new(RequestType::Get);
        request.set_destination("127.0.0.1:5683".parse().unwrap());
        assert!(matches!(
            endpoint.send_request(request),
            Err(EndpointError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn endpoint_pair_round_trip_with_custom_deliverer() {
        struct Echo {
            endpoint: Mutex<Option<Arc<CoapEndpoint>>>,
        }
        impl MessageDeliverer for Echo {
            fn deliver_request(&self, exchange: Arc<Exchange>, request: Request) {
                let mut response = Response::for_request(&request, ResponseType::Content);
                response.set_payload(request.path().into_bytes());
                let endpoint = lock(&self.endpoint).clone();
                if let Some(endpoint) = endpoint {
                    endpoint.send_response(&exchange, response).unwrap();
                }
            }
            fn deliver_response(&self, exchange: Arc<Exchange>, response: Response) {
                if let Some(request) = exchange.request() {
                    request.complete_response(response);
                }
            }
        }

        let echo = Arc::new(Echo {
            endpoint: Mutex::new(None),
        });
        let server = Arc::new(
            CoapEndpoint::builder()
                .bind_udp(loopback())
                .deliverer(echo.clone())
                .build(),
        );
        *lock(&echo.endpoint) = Some(server.clone());
        server.start().await.unwrap();
        let server_addr = server.address().unwrap();

        let client = CoapEndpoint::builder().bind_udp(loopback()).build();
        client.start().await.unwrap();

        let mut request = Request::new(RequestType::Get);
        request.set_destination(server_addr);
        request.set_path("/hello");

        let response = client
            .send_request(request)
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), ResponseType::Content);
        assert_eq!(response.payload(), b"hello");
        assert!(response.round_trip_time().is_some());

        client.destroy();
        server.destroy();
    }
}
