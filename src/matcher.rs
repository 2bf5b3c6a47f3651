use std::sync::Arc;

use coap_lite::MessageType;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connector::CorrelationContext;
use crate::exchange::{Exchange, Origin};
use crate::message::{EmptyMessage, Request, Response};
use crate::observe::{Observation, ObservationStore};
use crate::store::{ExchangeStore, KeyMid, KeyToken};
use crate::EndpointError;

/// Maps inbound messages to exchanges and assigns outbound identifiers.
/// The datagram and stream variants share the exchange store but differ in
/// MID handling: stream transports have no MIDs in the reliability sense,
/// no deduplication and no RST for unmatched responses.
pub(crate) enum Matcher {
    Udp(UdpMatcher),
    Tcp(TcpMatcher),
}

impl Matcher {
    pub(crate) fn udp(store: Arc<ExchangeStore>, observations: Arc<dyn ObservationStore>) -> Self {
        Matcher::Udp(UdpMatcher { store, observations })
    }

    pub(crate) fn tcp(store: Arc<ExchangeStore>, observations: Arc<dyn ObservationStore>) -> Self {
        Matcher::Tcp(TcpMatcher { store, observations })
    }

    pub(crate) fn is_udp(&self) -> bool {
        matches!(self, Matcher::Udp(_))
    }

    pub(crate) fn start(&self) {}

    pub(crate) fn stop(&self) {}

    pub(crate) fn clear(&self) {
        self.store().clear();
    }

    pub(crate) fn store(&self) -> &Arc<ExchangeStore> {
        match self {
            Matcher::Udp(m) => &m.store,
            Matcher::Tcp(m) => &m.store,
        }
    }

    pub(crate) fn send_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
    ) -> Result<(), EndpointError> {
        match self {
            Matcher::Udp(m) => m.send_request(exchange, request),
            Matcher::Tcp(m) => m.send_request(exchange, request),
        }
    }

    pub(crate) fn send_response(&self, exchange: &Arc<Exchange>, response: &mut Response) {
        match self {
            Matcher::Udp(m) => m.send_response(exchange, response),
            Matcher::Tcp(m) => m.send_response(exchange, response),
        }
    }

    pub(crate) fn send_empty(&self, exchange: Option<&Arc<Exchange>>, message: &EmptyMessage) {
        if let Matcher::Udp(m) = self {
            m.send_empty(exchange, message);
        }
    }

    pub(crate) fn receive_request(
        &self,
        request: &mut Request,
        peer: std::net::SocketAddr,
    ) -> Arc<Exchange> {
        match self {
            Matcher::Udp(m) => m.receive_request(request, peer),
            Matcher::Tcp(m) => m.receive_request(request, peer),
        }
    }

    pub(crate) fn receive_response(
        &self,
        response: &mut Response,
        context: Option<&CorrelationContext>,
    ) -> Option<Arc<Exchange>> {
        match self {
            Matcher::Udp(m) => m.receive_response(response, context),
            Matcher::Tcp(m) => m.receive_response(response, context),
        }
    }

    pub(crate) fn receive_empty(&self, message: &EmptyMessage) -> Option<Arc<Exchange>> {
        match self {
            Matcher::Udp(m) => m.receive_empty(message),
            Matcher::Tcp(_) => {
                debug!("empty message on stream transport, ignoring");
                None
            }
        }
    }

    pub(crate) fn cancel_observe(&self, token: &[u8]) {
        let (store, observations) = match self {
            Matcher::Udp(m) => (&m.store, &m.observations),
            Matcher::Tcp(m) => (&m.store, &m.observations),
        };
        observations.remove(token);
        for exchange in store.exchanges_with_token(token) {
            if exchange.has_observe_relation() {
                exchange.set_observe_relation(false);
                exchange.cancel();
            }
        }
    }
}

/// Establishes or removes the observation a request carries, once its
/// token is final.
fn track_observation(
    observations: &Arc<dyn ObservationStore>,
    exchange: &Arc<Exchange>,
    request: &Request,
) {
    match request.observe() {
        Some(0) => {
            exchange.set_observe_relation(true);
            let uri = match request.destination() {
                Some(dest) => format!("{}://{}/{}", request.scheme(), dest, request.path()),
                None => format!("{}:///{}", request.scheme(), request.path()),
            };
            observations.put(Observation::new(request.token().to_vec(), uri, request.clone()));
        }
        Some(1) => {
            exchange.set_observe_relation(false);
            observations.remove(request.token());
        }
        _ => {}
    }
}

/// Validates that a response arrived on the session its request was sent
/// on. A response from a different session is treated as unmatched.
fn context_matches(exchange: &Exchange, context: Option<&CorrelationContext>) -> bool {
    match (exchange.correlation_context(), context) {
        (Some(expected), Some(actual)) => expected == *actual,
        _ => true,
    }
}

pub(crate) struct UdpMatcher {
    store: Arc<ExchangeStore>,
    observations: Arc<dyn ObservationStore>,
}

impl UdpMatcher {
    fn send_request(&self, exchange: &Arc<Exchange>, request: &mut Request) -> Result<(), EndpointError> {
        let peer = request
            .destination()
            .ok_or(EndpointError::InvalidArgument("request has no destination"))?;

        if !request.has_mid() {
            request.set_mid(self.store.assign_mid());
        }
        if request.token().is_empty() {
            request.set_token(self.store.allocate_token(peer));
        }

        exchange.set_remove_hook(remove_hook(&self.store));
        self.store
            .register_token(KeyToken::new(request.token(), peer), exchange)?;
        if request.is_confirmable() {
            self.store
                .register_mid(KeyMid::new(request.mid(), peer), exchange);
        }

        track_observation(&self.observations, exchange, request);
        exchange.set_request(request.clone());
        trace!(mid = request.mid(), peer = %peer, "registered outbound request");
        Ok(())
    }

    fn send_response(&self, exchange: &Arc<Exchange>, response: &mut Response) {
        if response.destination().is_none() {
            response.set_destination(exchange.remote());
        }
        match response.message_type() {
            MessageType::Acknowledgement | MessageType::Reset => {
                // Piggy-backed: carries the request's MID.
                if !response.has_mid() {
                    if let Some(mid) = exchange.request_mid() {
                        response.set_mid(mid);
                    }
                }
            }
            _ => {
                if !response.has_mid() {
                    response.set_mid(self.store.assign_mid());
                }
            }
        }

        exchange.set_remove_hook(remove_hook(&self.store));
        if response.is_confirmable() {
            // A separate confirmable response needs its own ACK matching.
            if let Some(peer) = response.destination() {
                self.store
                    .register_mid(KeyMid::new(response.mid(), peer), exchange);
            }
        }
        exchange.set_response(response.clone());

        // The exchange stays open while a confirmable response awaits its
        // ACK or an observe relation keeps producing notifications.
        if !response.is_confirmable() && response.observe().is_none() {
            exchange.complete();
        }
    }

    fn send_empty(&self, exchange: Option<&Arc<Exchange>>, message: &EmptyMessage) {
        if message.message_type() == MessageType::Acknowledgement {
            if let Some(exchange) = exchange {
                exchange.mark_acknowledged();
            }
        }
    }

    fn receive_request(&self, request: &mut Request, peer: std::net::SocketAddr) -> Arc<Exchange> {
        let key = KeyMid::new(request.mid(), peer);
        let fresh = Arc::new(Exchange::new(Origin::Remote, peer));

        match self.store.register_inbound(key, &fresh, Instant::now()) {
            Some(seen) => {
                request.duplicate = true;
                trace!(mid = request.mid(), peer = %peer, "duplicate request");
                seen
            }
            None => {
                fresh.set_remove_hook(remove_hook(&self.store));
                fresh.set_request(request.clone());
                fresh
            }
        }
    }

    fn receive_response(
        &self,
        response: &mut Response,
        context: Option<&CorrelationContext>,
    ) -> Option<Arc<Exchange>> {
        let peer = response.source()?;
        let key = KeyToken::new(response.token(), peer);
        let exchange = self.store.find_by_token(&key)?;

        if !context_matches(&exchange, context) {
            debug!(peer = %peer, "response from foreign session, treating as unmatched");
            return None;
        }

        // A retransmitted confirmable response is flagged so the ACK is
        // repeated without another delivery.
        if matches!(
            response.message_type(),
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            let mid_key = KeyMid::new(response.mid(), peer);
            if self
                .store
                .register_inbound(mid_key, &exchange, Instant::now())
                .is_some()
            {
                response.duplicate = true;
            }
        }

        Some(exchange)
    }

    fn receive_empty(&self, message: &EmptyMessage) -> Option<Arc<Exchange>> {
        let peer = message.source()?;
        self.store.remove_by_mid(&KeyMid::new(message.mid(), peer))
    }
}

pub(crate) struct TcpMatcher {
    store: Arc<ExchangeStore>,
    observations: Arc<dyn ObservationStore>,
}

impl TcpMatcher {
    fn send_request(&self, exchange: &Arc<Exchange>, request: &mut Request) -> Result<(), EndpointError> {
        let peer = request
            .destination()
            .ok_or(EndpointError::InvalidArgument("request has no destination"))?;

        if request.token().is_empty() {
            request.set_token(self.store.allocate_token(peer));
        }

        exchange.set_remove_hook(remove_hook(&self.store));
        self.store
            .register_token(KeyToken::new(request.token(), peer), exchange)?;
        track_observation(&self.observations, exchange, request);
        exchange.set_request(request.clone());
        Ok(())
    }

    fn send_response(&self, exchange: &Arc<Exchange>, response: &mut Response) {
        if response.destination().is_none() {
            response.set_destination(exchange.remote());
        }
        exchange.set_response(response.clone());
        if response.observe().is_none() {
            exchange.complete();
        }
    }

    fn receive_request(&self, request: &mut Request, peer: std::net::SocketAddr) -> Arc<Exchange> {
        let exchange = Arc::new(Exchange::new(Origin::Remote, peer));
        exchange.set_remove_hook(remove_hook(&self.store));
        exchange.set_request(request.clone());
        exchange
    }

    fn receive_response(
        &self,
        response: &mut Response,
        context: Option<&CorrelationContext>,
    ) -> Option<Arc<Exchange>> {
        let peer = response.source()?;
        let exchange = self
            .store
            .find_by_token(&KeyToken::new(response.token(), peer))?;
        context_matches(&exchange, context).then_some(exchange)
    }
}

fn remove_hook(store: &Arc<ExchangeStore>) -> Box<dyn FnOnce(&Exchange) + Send> {
    let store = store.clone();
    Box::new(move |exchange| store.remove_exchange_keys(exchange))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoapConfig;
    use crate::observe::InMemoryObservationStore;
    use coap_lite::RequestType;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn udp_matcher() -> Matcher {
        let store = Arc::new(ExchangeStore::new(&CoapConfig::default()));
        Matcher::udp(store, Arc::new(InMemoryObservationStore::new()))
    }

    fn tcp_matcher() -> Matcher {
        let store = Arc::new(ExchangeStore::new(&CoapConfig::default()));
        Matcher::tcp(store, Arc::new(InMemoryObservationStore::new()))
    }

    #[tokio::test]
    async fn outbound_con_registers_mid_and_token() {
        let matcher = udp_matcher();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = Request::new(RequestType::Get);
        request.set_destination(peer());

        matcher.send_request(&exchange, &mut request).unwrap();
        assert!(request.has_mid());
        assert_eq!(request.token().len(), 8);
        assert_eq!(matcher.store().mid_entries(), 1);
        assert_eq!(matcher.store().token_entries(), 1);

        // Registration is idempotent for the same exchange.
        matcher.send_request(&exchange, &mut request).unwrap();
        assert_eq!(matcher.store().token_entries(), 1);
    }

    #[tokio::test]
    async fn outbound_non_skips_mid_table() {
        let matcher = udp_matcher();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = Request::new(RequestType::Get);
        request.set_confirmable(false);
        request.set_destination(peer());

        matcher.send_request(&exchange, &mut request).unwrap();
        assert_eq!(matcher.store().mid_entries(), 0);
        assert_eq!(matcher.store().token_entries(), 1);
    }

    #[tokio::test]
    async fn inbound_duplicate_is_flagged() {
        let matcher = udp_matcher();
        let mut request = Request::new(RequestType::Get);
        request.set_source(peer());
        request.set_mid(0x0101);

        let first = matcher.receive_request(&mut request, peer());
        assert!(!request.is_duplicate());

        let mut dup = request.clone();
        dup.duplicate = false;
        let second = matcher.receive_request(&mut dup, peer());
        assert!(dup.is_duplicate());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn response_from_foreign_session_is_unmatched() {
        let matcher = udp_matcher();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        exchange.set_correlation_context(CorrelationContext::new(&b"session-1"[..]));
        let mut request = Request::new(RequestType::Get);
        request.set_destination(peer());
        matcher.send_request(&exchange, &mut request).unwrap();

        let mut response = Response::new(coap_lite::ResponseType::Content);
        response.set_source(peer());
        response.set_token(request.token().to_vec());
        response.set_mid(request.mid());

        let other = CorrelationContext::new(&b"session-2"[..]);
        assert!(matcher.receive_response(&mut response, Some(&other)).is_none());

        let same = CorrelationContext::new(&b"session-1"[..]);
        assert!(matcher.receive_response(&mut response, Some(&same)).is_some());
    }

    #[tokio::test]
    async fn empty_message_matches_by_mid_once() {
        let matcher = udp_matcher();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = Request::new(RequestType::Get);
        request.set_destination(peer());
        matcher.send_request(&exchange, &mut request).unwrap();

        let mut ack = EmptyMessage::ack(request.mid(), peer());
        ack.set_source(peer());
        assert!(matcher.receive_empty(&ack).is_some());
        // The MID entry is consumed by the match.
        assert!(matcher.receive_empty(&ack).is_none());
    }

    #[tokio::test]
    async fn observe_registration_and_cancel() {
        let store = Arc::new(ExchangeStore::new(&CoapConfig::default()));
        let observations = Arc::new(InMemoryObservationStore::new());
        let matcher = Matcher::udp(store, observations.clone());

        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = Request::new(RequestType::Get);
        request.set_destination(peer());
        request.set_path("/temp");
        request.set_observe(0);
        matcher.send_request(&exchange, &mut request).unwrap();

        assert!(exchange.has_observe_relation());
        assert!(observations.get(request.token()).is_some());

        matcher.cancel_observe(request.token());
        assert!(observations.get(request.token()).is_none());
        assert!(exchange.is_completed());
        assert_eq!(matcher.store().token_entries(), 0);
    }

    #[tokio::test]
    async fn tcp_matcher_leaves_mid_unassigned() {
        let matcher = tcp_matcher();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = Request::new(RequestType::Get);
        request.set_destination(peer());

        matcher.send_request(&exchange, &mut request).unwrap();
        assert!(!request.has_mid());
        assert_eq!(matcher.store().mid_entries(), 0);
        assert_eq!(matcher.store().token_entries(), 1);
    }
}
