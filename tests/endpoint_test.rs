use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use coap_lite::{MessageClass, MessageType, Packet, RequestType, ResponseType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::yield_now;

use coap_endpoint::{
    CoapConfig, CoapEndpoint, Connector, CorrelationContext, EndpointError, Exchange,
    MessageDeliverer, NotificationListener, OutboundData, RawData, Request, Response, Scheme,
};

/// Scripted in-memory connector: outbound frames land on a channel the
/// test reads, inbound frames are injected by hand, and an optional
/// session context is reported back for every send.
struct TestConnector {
    inbox: Mutex<Option<mpsc::Sender<RawData>>>,
    outbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    context: Mutex<Option<CorrelationContext>>,
    addr: SocketAddr,
}

impl TestConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            inbox: Mutex::new(None),
            outbound,
            context: Mutex::new(None),
            addr: "127.0.0.1:7777".parse().unwrap(),
        });
        (connector, outbound_rx)
    }

    fn set_context(&self, context: CorrelationContext) {
        *self.context.lock().unwrap() = Some(context);
    }

    async fn inject(&self, bytes: Vec<u8>, source: SocketAddr, context: Option<CorrelationContext>) {
        let tx = self
            .inbox
            .lock()
            .unwrap()
            .clone()
            .expect("connector not started");
        tx.send(RawData {
            bytes: bytes.into(),
            source,
            context,
            secure: false,
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn start(&self, inbox: mpsc::Sender<RawData>) -> io::Result<()> {
        *self.inbox.lock().unwrap() = Some(inbox);
        Ok(())
    }

    fn stop(&self) {
        self.inbox.lock().unwrap().take();
    }

    fn send(&self, data: OutboundData) {
        if let Some(callback) = data.context_callback {
            if let Some(context) = self.context.lock().unwrap().clone() {
                callback(context);
            }
        }
        let _ = self.outbound.send((data.bytes, data.destination));
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn scheme(&self) -> Scheme {
        Scheme::Coap
    }
}

/// Deliverer responding synchronously through the endpoint, counting the
/// requests it saw.
struct SyncResponder {
    endpoint: Mutex<Option<Arc<CoapEndpoint>>>,
    status: ResponseType,
    payload: Vec<u8>,
    delivered: AtomicUsize,
}

impl SyncResponder {
    fn new(status: ResponseType, payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            endpoint: Mutex::new(None),
            status,
            payload: payload.to_vec(),
            delivered: AtomicUsize::new(0),
        })
    }

    fn attach(&self, endpoint: Arc<CoapEndpoint>) {
        *self.endpoint.lock().unwrap() = Some(endpoint);
    }
}

impl MessageDeliverer for SyncResponder {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Request) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::for_request(&request, self.status);
        response.set_payload(self.payload.clone());
        let endpoint = self.endpoint.lock().unwrap().clone();
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

struct SeqRecorder(Mutex<Vec<u32>>);

impl NotificationListener for SeqRecorder {
    fn on_notification(&self, _request: &Request, response: &Response) {
        if let Some(seq) = response.observe() {
            self.0.lock().unwrap().push(seq);
        }
    }
}

async fn udp_endpoint() -> (Arc<CoapEndpoint>, SocketAddr) {
    let endpoint = Arc::new(
        CoapEndpoint::builder()
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .build(),
    );
    endpoint.start().await.unwrap();
    let addr = endpoint.address().unwrap();
    (endpoint, addr)
}

// Local CON request answered by a piggy-backed 2.05: the caller sees the
// response, the exchange completes and the round-trip time is recorded.
#[tokio::test]
async fn con_request_piggybacked_response() {
    let (client, client_addr) = udp_endpoint().await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let mut request = Request::new(RequestType::Get);
    request.set_destination(peer_addr);
    request.set_path("/reliable");
    let response_rx = client.send_request(request).unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
    let received = Packet::from_bytes(&buf[..n]).unwrap();
    assert_eq!(received.header.get_type(), MessageType::Confirmable);

    let mut response = Packet::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.code = MessageClass::Response(ResponseType::Content);
    response.header.message_id = received.header.message_id;
    response.set_token(received.get_token().to_vec());
    response.payload = b"22.5".to_vec();
    peer.send_to(&response.to_bytes().unwrap(), client_addr)
        .await
        .unwrap();

    let resp = response_rx.await.unwrap().unwrap();
    assert_eq!(resp.status(), ResponseType::Content);
    assert_eq!(resp.payload(), b"22.5");
    assert!(resp.round_trip_time().is_some());

    client.destroy();
}

// A never-answered CON is retransmitted with identical bytes at doubling
// intervals and finally fails with a timeout.
#[tokio::test(start_paused = true)]
async fn con_request_retransmits_then_times_out() {
    let (connector, mut outbound) = TestConnector::new();
    let endpoint = CoapEndpoint::builder().connector(connector).build();
    endpoint.start().await.unwrap();

    let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
    let mut request = Request::new(RequestType::Get);
    request.set_destination(peer);
    let response_rx = endpoint.send_request(request).unwrap();

    // Initial transmission plus four retransmissions, bit-identical.
    let (first, _) = outbound.recv().await.unwrap();
    for _ in 0..4 {
        let (again, _) = outbound.recv().await.unwrap();
        assert_eq!(first, again);
    }

    let result = response_rx.await.unwrap();
    assert!(matches!(
        result,
        Err(EndpointError::Timeout { retransmits: 4 })
    ));
    endpoint.destroy();
}

// Inbound CON request with a synchronous handler: exactly one ACK goes
// out, carrying the request MID and the response payload.
#[tokio::test]
async fn con_request_answered_piggybacked_on_wire() {
    let responder = SyncResponder::new(ResponseType::Content, b"hot");
    let server = Arc::new(
        CoapEndpoint::builder()
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .deliverer(responder.clone())
            .build(),
    );
    responder.attach(server.clone());
    server.start().await.unwrap();
    let server_addr = server.address().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut request = Packet::new();
    request.header.code = MessageClass::Request(RequestType::Get);
    request.header.set_type(MessageType::Confirmable);
    request.header.message_id = 0x0001;
    request.set_token(vec![0x00]);
    peer.send_to(&request.to_bytes().unwrap(), server_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
    let ack = Packet::from_bytes(&buf[..n]).unwrap();
    assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
    assert_eq!(ack.header.message_id, 0x0001);
    assert_eq!(ack.header.code, MessageClass::Response(ResponseType::Content));
    assert_eq!(ack.payload, b"hot");
    assert_eq!(ack.get_token(), &vec![0x00]);

    // No separate response follows.
    let silent = tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf)).await;
    assert!(silent.is_err());
    assert_eq!(responder.delivered.load(Ordering::SeqCst), 1);

    server.destroy();
}

// A duplicate CON re-triggers the cached answer without another delivery.
#[tokio::test]
async fn duplicate_con_replays_cached_response() {
    let responder = SyncResponder::new(ResponseType::Content, b"once");
    let server = Arc::new(
        CoapEndpoint::builder()
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .deliverer(responder.clone())
            .build(),
    );
    responder.attach(server.clone());
    server.start().await.unwrap();
    let server_addr = server.address().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut request = Packet::new();
    request.header.code = MessageClass::Request(RequestType::Get);
    request.header.set_type(MessageType::Confirmable);
    request.header.message_id = 0x5555;
    request.set_token(vec![0x50, 0x51]);
    let request_bytes = request.to_bytes().unwrap();

    peer.send_to(&request_bytes, server_addr).await.unwrap();
    let mut buf = [0u8; 2048];
    let (n1, _) = peer.recv_from(&mut buf).await.unwrap();
    let first = buf[..n1].to_vec();

    // Same MID again.
    peer.send_to(&request_bytes, server_addr).await.unwrap();
    let (n2, _) = peer.recv_from(&mut buf).await.unwrap();
    let second = buf[..n2].to_vec();

    assert_eq!(first, second);
    assert_eq!(responder.delivered.load(Ordering::SeqCst), 1);

    server.destroy();
}

// A malformed confirmable message with a readable MID is rejected with an
// RST carrying that MID; nothing reaches the deliverer.
#[tokio::test]
async fn malformed_con_is_rejected_with_rst() {
    let responder = SyncResponder::new(ResponseType::Content, b"");
    let server = Arc::new(
        CoapEndpoint::builder()
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .deliverer(responder.clone())
            .build(),
    );
    responder.attach(server.clone());
    server.start().await.unwrap();
    let server_addr = server.address().unwrap();

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // Valid header (CON, MID 0x2222), garbage after byte 3.
    peer.send_to(&[0x40, 0x01, 0x22, 0x22, 0xFF], server_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
    let rst = Packet::from_bytes(&buf[..n]).unwrap();
    assert_eq!(rst.header.get_type(), MessageType::Reset);
    assert_eq!(rst.header.message_id, 0x2222);
    assert_eq!(responder.delivered.load(Ordering::SeqCst), 0);

    server.destroy();
}

// CoAP ping: an empty CON always produces exactly one RST.
#[tokio::test]
async fn empty_con_is_answered_with_rst() {
    let (endpoint, addr) = udp_endpoint().await;

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut ping = Packet::new();
    ping.header.set_type(MessageType::Confirmable);
    ping.header.code = MessageClass::Empty;
    ping.header.message_id = 0x0042;
    peer.send_to(&ping.to_bytes().unwrap(), addr).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = peer.recv_from(&mut buf).await.unwrap();
    let rst = Packet::from_bytes(&buf[..n]).unwrap();
    assert_eq!(rst.header.get_type(), MessageType::Reset);
    assert_eq!(rst.header.message_id, 0x0042);

    endpoint.destroy();
}

// Observe: notifications 5 and 7 pass the ordering test, the late 6 is
// dropped as stale.
#[tokio::test]
async fn observe_drops_stale_notifications() {
    let (connector, mut outbound) = TestConnector::new();
    let endpoint = CoapEndpoint::builder().connector(connector.clone()).build();
    endpoint.start().await.unwrap();

    let recorder = Arc::new(SeqRecorder(Mutex::new(Vec::new())));
    endpoint.add_notification_listener(recorder.clone());

    let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
    let mut request = Request::new(RequestType::Get);
    request.set_destination(peer);
    request.set_path("/temp");
    request.set_token(vec![0x55]);
    request.set_observe(0);
    let _response_rx = endpoint.send_request(request).unwrap();

    let (frame, _) = outbound.recv().await.unwrap();
    let sent = Packet::from_bytes(&frame).unwrap();
    assert_eq!(sent.get_token(), &vec![0x55]);

    for seq in [5u32, 7, 6] {
        let mut notification = Packet::new();
        notification.header.set_type(MessageType::NonConfirmable);
        notification.header.code = MessageClass::Response(ResponseType::Content);
        notification.header.message_id = 0x4000 + seq as u16;
        notification.set_token(vec![0x55]);
        notification.add_option(coap_lite::CoapOption::Observe, vec![seq as u8]);
        notification.payload = format!("{seq}").into_bytes();
        connector
            .inject(notification.to_bytes().unwrap(), peer, None)
            .await;
    }

    for _ in 0..50 {
        yield_now().await;
    }
    assert_eq!(*recorder.0.lock().unwrap(), vec![5, 7]);

    endpoint.destroy();
}

// A separate response arriving on a different transport session than the
// request is treated as unmatched and rejected with an RST.
#[tokio::test]
async fn cross_session_response_is_rejected() {
    let (connector, mut outbound) = TestConnector::new();
    let endpoint = CoapEndpoint::builder().connector(connector.clone()).build();
    endpoint.start().await.unwrap();
    connector.set_context(CorrelationContext::new(&b"dtls-session-1"[..]));

    let peer: SocketAddr = "127.0.0.1:5684".parse().unwrap();
    let mut request = Request::new(RequestType::Get);
    request.set_destination(peer);
    let response_rx = endpoint.send_request(request).unwrap();

    let (frame, _) = outbound.recv().await.unwrap();
    let sent = Packet::from_bytes(&frame).unwrap();

    // Peer acknowledges, then answers from a fresh session.
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = sent.header.message_id;
    connector.inject(ack.to_bytes().unwrap(), peer, None).await;

    let mut response = Packet::new();
    response.header.set_type(MessageType::Confirmable);
    response.header.code = MessageClass::Response(ResponseType::Content);
    response.header.message_id = 0x7777;
    response.set_token(sent.get_token().to_vec());
    response.payload = b"spoofed".to_vec();
    connector
        .inject(
            response.to_bytes().unwrap(),
            peer,
            Some(CorrelationContext::new(&b"dtls-session-2"[..])),
        )
        .await;

    let (frame, _) = outbound.recv().await.unwrap();
    let rst = Packet::from_bytes(&frame).unwrap();
    assert_eq!(rst.header.get_type(), MessageType::Reset);
    assert_eq!(rst.header.message_id, 0x7777);

    // The caller is still waiting; the spoofed response was not delivered.
    let pending = tokio::time::timeout(Duration::from_millis(100), response_rx).await;
    assert!(pending.is_err());

    endpoint.destroy();
}

// Empty messages sent from user code hit the connector before the call
// returns, preserving ordering with subsequent application calls.
#[tokio::test]
async fn send_empty_message_is_synchronous() {
    let (connector, mut outbound) = TestConnector::new();
    let endpoint = CoapEndpoint::builder().connector(connector).build();
    endpoint.start().await.unwrap();

    let peer: SocketAddr = "127.0.0.1:5685".parse().unwrap();
    endpoint.send_empty_message(None, coap_endpoint::EmptyMessage::rst(0x0909, peer));

    let (frame, destination) = outbound.try_recv().expect("frame must be queued already");
    assert_eq!(destination, peer);
    let rst = Packet::from_bytes(&frame).unwrap();
    assert_eq!(rst.header.get_type(), MessageType::Reset);
    assert_eq!(rst.header.message_id, 0x0909);

    endpoint.destroy();
}

// A large response travels blockwise between two endpoints and arrives
// reassembled at the caller.
#[tokio::test]
async fn blockwise_response_reassembles_end_to_end() {
    let small_blocks = CoapConfig {
        max_message_size: 16,
        preferred_block_size: 16,
        ..CoapConfig::default()
    };

    let body: Vec<u8> = (0u8..40).collect();
    let responder = SyncResponder::new(ResponseType::Content, &body);
    let server = Arc::new(
        CoapEndpoint::builder()
            .bind_udp("127.0.0.1:0".parse().unwrap())
            .config(small_blocks.clone())
            .deliverer(responder.clone())
            .build(),
    );
    responder.attach(server.clone());
    server.start().await.unwrap();
    let server_addr = server.address().unwrap();

    let client = CoapEndpoint::builder()
        .bind_udp("127.0.0.1:0".parse().unwrap())
        .config(small_blocks)
        .build();
    client.start().await.unwrap();

    let mut request = Request::new(RequestType::Get);
    request.set_destination(server_addr);
    request.set_path("/big");
    let response = client
        .send_request(request)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.payload(), &body[..]);

    client.destroy();
    server.destroy();
}

// An interceptor canceling an outbound request keeps it off the wire.
#[tokio::test]
async fn canceled_request_never_reaches_the_connector() {
    struct CancelAll;
    impl coap_endpoint::MessageInterceptor for CancelAll {
        fn send_request(&self, request: &Request) {
            request.cancel();
        }
    }

    let (connector, mut outbound) = TestConnector::new();
    let endpoint = CoapEndpoint::builder().connector(connector).build();
    endpoint.start().await.unwrap();
    endpoint.add_interceptor(Arc::new(CancelAll));

    let mut request = Request::new(RequestType::Get);
    request.set_destination("127.0.0.1:5683".parse().unwrap());
    let _response_rx = endpoint.send_request(request).unwrap();

    for _ in 0..20 {
        yield_now().await;
    }
    assert!(outbound.try_recv().is_err());

    endpoint.destroy();
}
