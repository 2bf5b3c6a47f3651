use std::collections::LinkedList;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use tokio::sync::oneshot;

use crate::connector::Scheme;
use crate::EndpointError;

/// Shared accessors over the common CoAP message fields: type, MID, token,
/// addressing and the cancellation flag checked after interceptor fan-out.
macro_rules! message_accessors {
    ($ty:ty) => {
        impl $ty {
            pub fn message_type(&self) -> MessageType {
                self.packet.header.get_type()
            }

            pub fn set_message_type(&mut self, message_type: MessageType) {
                self.packet.header.set_type(message_type);
            }

            pub fn is_confirmable(&self) -> bool {
                self.message_type() == MessageType::Confirmable
            }

            /// 16-bit message identifier.
            pub fn mid(&self) -> u16 {
                self.packet.header.message_id
            }

            pub fn set_mid(&mut self, mid: u16) {
                self.packet.header.message_id = mid;
                self.meta.mid_assigned = true;
            }

            /// False until the matcher (or the parser) has assigned a MID.
            pub fn has_mid(&self) -> bool {
                self.meta.mid_assigned
            }

            /// Clears the MID assignment so the matcher hands out a fresh
            /// one; used for blockwise follow-up messages.
            pub(crate) fn reset_mid(&mut self) {
                self.packet.header.message_id = 0;
                self.meta.mid_assigned = false;
            }

            pub fn token(&self) -> &[u8] {
                self.packet.get_token()
            }

            pub fn set_token(&mut self, token: Vec<u8>) {
                self.packet.set_token(token);
            }

            pub fn source(&self) -> Option<SocketAddr> {
                self.meta.source
            }

            pub fn set_source(&mut self, addr: SocketAddr) {
                self.meta.source = Some(addr);
            }

            pub fn destination(&self) -> Option<SocketAddr> {
                self.meta.destination
            }

            pub fn set_destination(&mut self, addr: SocketAddr) {
                self.meta.destination = Some(addr);
            }

            /// True once an interceptor or the application canceled the
            /// message. Cancellation is shared across clones.
            pub fn is_canceled(&self) -> bool {
                self.meta.canceled.load(Ordering::Acquire)
            }

            pub fn cancel(&self) {
                self.meta.canceled.store(true, Ordering::Release);
            }

            pub fn packet(&self) -> &Packet {
                &self.packet
            }

            pub fn packet_mut(&mut self) -> &mut Packet {
                &mut self.packet
            }
        }
    };
}

/// Addressing and bookkeeping shared by the three message kinds.
#[derive(Clone, Default)]
struct MessageMeta {
    source: Option<SocketAddr>,
    destination: Option<SocketAddr>,
    canceled: Arc<AtomicBool>,
    mid_assigned: bool,
}

impl MessageMeta {
    fn received(source: SocketAddr) -> Self {
        Self {
            source: Some(source),
            destination: None,
            canceled: Arc::new(AtomicBool::new(false)),
            mid_assigned: true,
        }
    }
}

/// A CoAP request (code class 0, detail 1..4).
#[derive(Clone)]
pub struct Request {
    packet: Packet,
    meta: MessageMeta,
    scheme: Scheme,
    sender_identity: Option<String>,
    pub(crate) sink: ResponseSink,
    pub(crate) duplicate: bool,
}

message_accessors!(Request);

impl Request {
    /// Creates a confirmable request for the given method.
    pub fn new(method: RequestType) -> Self {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Request(method);
        packet.header.set_type(MessageType::Confirmable);
        Self {
            packet,
            meta: MessageMeta::default(),
            scheme: Scheme::Coap,
            sender_identity: None,
            sink: ResponseSink::default(),
            duplicate: false,
        }
    }

    pub(crate) fn from_packet(packet: Packet, source: SocketAddr) -> Self {
        Self {
            packet,
            meta: MessageMeta::received(source),
            scheme: Scheme::Coap,
            sender_identity: None,
            sink: ResponseSink::default(),
            duplicate: false,
        }
    }

    pub fn method(&self) -> RequestType {
        match self.packet.header.code {
            MessageClass::Request(method) => method,
            _ => RequestType::UnKnown,
        }
    }

    pub fn set_confirmable(&mut self, confirmable: bool) {
        self.set_message_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
    }

    /// Sets the Uri-Path options from a `/`-separated path.
    pub fn set_path(&mut self, path: &str) {
        self.packet.clear_option(CoapOption::UriPath);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.packet
                .add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
    }

    /// Joins the Uri-Path options back into a `/`-separated path.
    pub fn path(&self) -> String {
        match self.packet.get_option(CoapOption::UriPath) {
            Some(segments) => segments
                .iter()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            None => String::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.packet.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.packet.payload = payload;
    }

    /// Value of the Observe option, if present (0 registers, 1 deregisters).
    pub fn observe(&self) -> Option<u32> {
        uint_option(&self.packet, CoapOption::Observe)
    }

    pub fn set_observe(&mut self, value: u32) {
        set_uint_option(&mut self.packet, CoapOption::Observe, value);
    }

    pub(crate) fn clear_observe(&mut self) {
        self.packet.clear_option(CoapOption::Observe);
    }

    /// Scheme the request was received under (or will be sent under).
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn set_scheme(&mut self, scheme: Scheme) {
        self.scheme = scheme;
    }

    /// Authenticated identity of the sender, if the transport supplied one.
    pub fn sender_identity(&self) -> Option<&str> {
        self.sender_identity.as_deref()
    }

    pub fn set_sender_identity(&mut self, identity: String) {
        self.sender_identity = Some(identity);
    }

    /// True if the matcher has already seen this MID from this peer.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Forwards a matched response to the local caller awaiting this
    /// request. Custom deliverers call this from `deliver_response`.
    pub fn complete_response(&self, response: Response) {
        self.sink.complete(Ok(response));
    }
}

/// A CoAP response (code class 2, 4 or 5).
#[derive(Clone)]
pub struct Response {
    packet: Packet,
    meta: MessageMeta,
    round_trip_time: Option<Duration>,
    pub(crate) duplicate: bool,
}

message_accessors!(Response);

impl Response {
    /// Creates a non-confirmable response; the reliability layer converts it
    /// into a piggy-backed ACK when the request is still unacknowledged.
    pub fn new(status: ResponseType) -> Self {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Response(status);
        packet.header.set_type(MessageType::NonConfirmable);
        Self {
            packet,
            meta: MessageMeta::default(),
            round_trip_time: None,
            duplicate: false,
        }
    }

    /// Creates a response addressed back to the request's sender, carrying
    /// the request's token.
    pub fn for_request(request: &Request, status: ResponseType) -> Self {
        let mut response = Self::new(status);
        response.set_token(request.token().to_vec());
        if let Some(source) = request.source() {
            response.set_destination(source);
        }
        response
    }

    pub(crate) fn from_packet(packet: Packet, source: SocketAddr) -> Self {
        Self {
            packet,
            meta: MessageMeta::received(source),
            round_trip_time: None,
            duplicate: false,
        }
    }

    pub fn status(&self) -> ResponseType {
        match self.packet.header.code {
            MessageClass::Response(status) => status,
            _ => ResponseType::InternalServerError,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.packet.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.packet.payload = payload;
    }

    /// Observe sequence number carried by a notification.
    pub fn observe(&self) -> Option<u32> {
        uint_option(&self.packet, CoapOption::Observe)
    }

    pub fn set_observe(&mut self, value: u32) {
        set_uint_option(&mut self.packet, CoapOption::Observe, value);
    }

    /// Time between sending the request and matching this response.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub(crate) fn set_round_trip_time(&mut self, rtt: Duration) {
        self.round_trip_time = Some(rtt);
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }
}

/// A CoAP message with code 0.00: ACK, RST or ping.
#[derive(Clone)]
pub struct EmptyMessage {
    packet: Packet,
    meta: MessageMeta,
}

message_accessors!(EmptyMessage);

impl EmptyMessage {
    fn new(message_type: MessageType, mid: u16, destination: SocketAddr) -> Self {
        let mut packet = Packet::new();
        packet.header.code = MessageClass::Empty;
        packet.header.set_type(message_type);
        packet.header.message_id = mid;
        Self {
            packet,
            meta: MessageMeta {
                destination: Some(destination),
                mid_assigned: true,
                ..MessageMeta::default()
            },
        }
    }

    /// An acknowledgement for the given MID.
    pub fn ack(mid: u16, destination: SocketAddr) -> Self {
        Self::new(MessageType::Acknowledgement, mid, destination)
    }

    /// A reset for the given MID.
    pub fn rst(mid: u16, destination: SocketAddr) -> Self {
        Self::new(MessageType::Reset, mid, destination)
    }

    /// A CoAP ping: a confirmable message with code 0.00.
    pub fn ping(destination: SocketAddr) -> Self {
        let mut msg = Self::new(MessageType::Confirmable, 0, destination);
        msg.meta.mid_assigned = false;
        msg
    }

    pub(crate) fn from_packet(packet: Packet, source: SocketAddr) -> Self {
        Self {
            packet,
            meta: MessageMeta::received(source),
        }
    }
}

/// One-shot delivery slot connecting a request to the local caller awaiting
/// its response. Shared across clones of the request.
#[derive(Clone, Default)]
pub struct ResponseSink {
    tx: Arc<Mutex<Option<oneshot::Sender<Result<Response, EndpointError>>>>>,
}

impl ResponseSink {
    /// Creates the receiving half. Replaces any earlier subscription.
    pub(crate) fn subscribe(&self) -> oneshot::Receiver<Result<Response, EndpointError>> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.tx) = Some(tx);
        rx
    }

    /// Completes the waiting caller. Later completions are ignored.
    pub(crate) fn complete(&self, result: Result<Response, EndpointError>) {
        if let Some(tx) = lock(&self.tx).take() {
            let _ = tx.send(result);
        }
    }
}

/// Locks a mutex, recovering the guard if a panicking task poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decodes a uint option value (big endian, up to 4 bytes).
pub(crate) fn decode_uint_option(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// Encodes a uint option value with leading zero bytes stripped.
pub(crate) fn encode_uint_option(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub(crate) fn uint_option(packet: &Packet, option: CoapOption) -> Option<u32> {
    packet
        .get_option(option)
        .and_then(|values| values.front())
        .and_then(|value| decode_uint_option(value))
}

pub(crate) fn set_uint_option(packet: &mut Packet, option: CoapOption, value: u32) {
    let mut values = LinkedList::new();
    values.push_back(encode_uint_option(value));
    packet.set_option(option, values);
}
