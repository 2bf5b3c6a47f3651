//! A CoAP (RFC 7252) endpoint: the object owning one transport binding
//! and the protocol machinery on top of it. Local callers hand requests
//! to the endpoint, inbound requests reach a pluggable
//! [`MessageDeliverer`], and the matcher correlates responses, ACKs and
//! RSTs with the exchanges that produced them. The stack applies observe
//! (RFC 7641), blockwise transfer (RFC 7959) and, on datagram
//! transports, retransmission.
//!
//! Both datagram (`coap`, `coaps`) and stream (`coap+tcp`, `coaps+tcp`)
//! lower layers are supported; the variant follows from the connector's
//! scheme at build time.

pub mod codec;
pub mod config;
pub mod connector;
pub mod deliverer;
pub mod endpoint;
pub mod exchange;
pub mod interceptor;
mod matcher;
pub mod message;
pub mod observe;
mod stack;
pub mod store;

pub use config::CoapConfig;
pub use connector::{Connector, CorrelationContext, OutboundData, RawData, Scheme, UdpConnector};
pub use deliverer::{ClientMessageDeliverer, MessageDeliverer};
pub use endpoint::{CoapEndpoint, CoapEndpointBuilder, EndpointObserver};
pub use exchange::{Exchange, Origin};
pub use interceptor::MessageInterceptor;
pub use message::{EmptyMessage, Request, Response};
pub use observe::{InMemoryObservationStore, NotificationListener, Observation, ObservationStore};
pub use store::{ExchangeStore, KeyMid, KeyToken};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EndpointError>;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("endpoint is not started")]
    NotStarted,

    #[error("endpoint has been destroyed")]
    Destroyed,

    #[error("token is already bound to another exchange")]
    RejectedDuplicateToken,

    #[error("no response after {retransmits} retransmissions")]
    Timeout { retransmits: u32 },

    #[error("peer answered with reset")]
    Reset,

    #[error("message was canceled")]
    Canceled,

    #[error("reassembled body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("message encoding failed")]
    Encoding(#[from] coap_lite::error::MessageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = EndpointError::Timeout { retransmits: 4 };
        assert_eq!(e.to_string(), "no response after 4 retransmissions");
        let e = EndpointError::Io(std::io::Error::from_raw_os_error(22));
        assert!(matches!(e, EndpointError::Io(_)));
    }
}
