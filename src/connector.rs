use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CoapConfig;
use crate::message::lock;

/// URI schemes a CoAP endpoint can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Coap,
    Coaps,
    CoapTcp,
    CoapsTcp,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::Coaps => "coaps",
            Scheme::CoapTcp => "coap+tcp",
            Scheme::CoapsTcp => "coaps+tcp",
        }
    }

    /// True for the stream-oriented variants (RFC 8323 framing).
    pub fn is_tcp(&self) -> bool {
        matches!(self, Scheme::CoapTcp | Scheme::CoapsTcp)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Coaps | Scheme::CoapsTcp)
    }

    /// The secure counterpart of this scheme.
    pub fn secure_variant(&self) -> Scheme {
        match self {
            Scheme::Coap | Scheme::Coaps => Scheme::Coaps,
            Scheme::CoapTcp | Scheme::CoapsTcp => Scheme::CoapsTcp,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque identity of the transport session a message traveled on, e.g. a
/// DTLS association. Responses are only matched to a request when their
/// contexts agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext(Bytes);

impl CorrelationContext {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An inbound frame handed from the connector to the endpoint's inbox.
pub struct RawData {
    pub bytes: Bytes,
    pub source: SocketAddr,
    pub context: Option<CorrelationContext>,
    pub secure: bool,
}

/// Callback fired once the transport establishes a session for an outbound
/// message; used to pin the correlation context on the exchange.
pub type ContextCallback = Box<dyn FnOnce(CorrelationContext) + Send>;

/// An outbound frame queued on the connector.
pub struct OutboundData {
    pub bytes: Bytes,
    pub destination: SocketAddr,
    pub context_callback: Option<ContextCallback>,
}

impl OutboundData {
    pub fn new(bytes: Bytes, destination: SocketAddr) -> Self {
        Self {
            bytes,
            destination,
            context_callback: None,
        }
    }
}

/// Byte-level transport driver. Owns the socket and its I/O tasks; the
/// endpoint owns the protocol machinery on top.
///
/// `send` is fire-and-forget into the connector's send queue and must not
/// block, so empty messages can be emitted synchronously from application
/// threads.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Binds the transport and begins forwarding inbound frames to `inbox`.
    async fn start(&self, inbox: mpsc::Sender<RawData>) -> io::Result<()>;

    /// Stops I/O. The connector can be started again afterwards.
    fn stop(&self);

    /// Releases the transport for good.
    fn destroy(&self) {
        self.stop();
    }

    fn send(&self, data: OutboundData);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn scheme(&self) -> Scheme;

    fn is_scheme_supported(&self, scheme: Scheme) -> bool {
        scheme == self.scheme()
    }

    fn uri(&self) -> String {
        match self.local_addr() {
            Some(addr) => format!("{}://{}", self.scheme(), addr),
            None => format!("{}://", self.scheme()),
        }
    }
}

struct UdpConnectorState {
    outbound_tx: Option<mpsc::UnboundedSender<OutboundData>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

/// Plain UDP connector: one socket, one I/O task multiplexing receive and
/// send, frames forwarded to the endpoint inbox.
pub struct UdpConnector {
    bind_addr: SocketAddr,
    datagram_size: usize,
    state: Mutex<UdpConnectorState>,
}

impl UdpConnector {
    pub fn new(bind_addr: SocketAddr, config: &CoapConfig) -> Self {
        Self {
            bind_addr,
            datagram_size: config.udp_connector_datagram_size,
            state: Mutex::new(UdpConnectorState {
                outbound_tx: None,
                task: None,
                local_addr: None,
            }),
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn start(&self, inbox: mpsc::Sender<RawData>) -> io::Result<()> {
        if lock(&self.state).task.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundData>();
        let datagram_size = self.datagram_size;

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; datagram_size];
            loop {
                tokio::select! {
                    res = socket.recv_from(&mut buf) => {
                        match res {
                            Ok((n, peer)) => {
                                let raw = RawData {
                                    bytes: Bytes::copy_from_slice(&buf[..n]),
                                    source: peer,
                                    context: None,
                                    secure: false,
                                };
                                if inbox.send(raw).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "udp receive failed");
                            }
                        }
                    }
                    res = outbound_rx.recv() => {
                        match res {
                            Some(data) => {
                                if let Err(e) = socket.send_to(&data.bytes, data.destination).await {
                                    warn!(peer = %data.destination, error = %e, "udp send failed");
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        let mut state = lock(&self.state);
        state.outbound_tx = Some(outbound_tx);
        state.task = Some(task);
        state.local_addr = Some(local_addr);
        Ok(())
    }

    fn stop(&self) {
        let mut state = lock(&self.state);
        state.outbound_tx = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    fn send(&self, data: OutboundData) {
        let state = lock(&self.state);
        match &state.outbound_tx {
            Some(tx) => {
                if tx.send(data).is_err() {
                    debug!("udp connector task gone, dropping outbound frame");
                }
            }
            None => debug!("udp connector not started, dropping outbound frame"),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).local_addr
    }

    fn scheme(&self) -> Scheme {
        Scheme::Coap
    }
}
