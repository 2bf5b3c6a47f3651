//! The layered protocol stack: Observe on top, Blockwise in the middle,
//! Reliability at the bottom (datagram variant only). Messages traverse
//! top to bottom on send and bottom to top on receive; a layer can consume
//! a message and queue follow-up emissions instead of forwarding it.

mod blockwise;
mod observe;
mod reliability;

pub(crate) use blockwise::BlockwiseLayer;
pub(crate) use observe::ObserveLayer;
pub(crate) use reliability::ReliabilityLayer;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::exchange::Exchange;
use crate::message::{EmptyMessage, Request, Response};

/// What a layer decided about the message flowing through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Keep traversing; eventually reaches the outbox (send) or the
    /// deliverer (receive).
    Forward,
    /// The layer handled the message; traversal stops.
    Consumed,
}

/// Follow-up messages a layer queued while processing. The endpoint
/// routes them after traversal: responses and requests re-enter the send
/// path, empties go through the empty-message path, raw frames are
/// pre-serialized retransmissions written straight to the connector.
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) responses: Vec<(Arc<Exchange>, Response)>,
    pub(crate) requests: Vec<(Arc<Exchange>, Request)>,
    pub(crate) empties: Vec<(Option<Arc<Exchange>>, EmptyMessage)>,
    pub(crate) raw_frames: Vec<(SocketAddr, Bytes)>,
}

impl Effects {
    pub(crate) fn is_empty(&self) -> bool {
        self.responses.is_empty()
            && self.requests.is_empty()
            && self.empties.is_empty()
            && self.raw_frames.is_empty()
    }
}

/// One layer of the protocol stack. All six hooks default to forwarding,
/// so a layer only spells out the directions it participates in.
pub(crate) trait Layer: Send + Sync {
    fn send_request(
        &self,
        _exchange: &Arc<Exchange>,
        _request: &mut Request,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    fn send_response(
        &self,
        _exchange: &Arc<Exchange>,
        _response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    fn send_empty(
        &self,
        _exchange: Option<&Arc<Exchange>>,
        _message: &mut EmptyMessage,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    fn receive_request(
        &self,
        _exchange: &Arc<Exchange>,
        _request: &mut Request,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    fn receive_response(
        &self,
        _exchange: &Arc<Exchange>,
        _response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    fn receive_empty(
        &self,
        _exchange: &Arc<Exchange>,
        _message: &mut EmptyMessage,
        _effects: &mut Effects,
    ) -> Outcome {
        Outcome::Forward
    }

    /// Housekeeping tick for layer-held state.
    fn sweep(&self, _now: Instant) {}
}

/// The assembled chain, top layer first. Traversal direction is a
/// property of the call, not of the chain.
pub(crate) struct ProtocolStack {
    layers: Vec<Box<dyn Layer>>,
}

impl ProtocolStack {
    pub(crate) fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self { layers }
    }

    pub(crate) fn send_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in &self.layers {
            if layer.send_request(exchange, request, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in &self.layers {
            if layer.send_response(exchange, response, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn send_empty(
        &self,
        exchange: Option<&Arc<Exchange>>,
        message: &mut EmptyMessage,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in &self.layers {
            if layer.send_empty(exchange, message, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn receive_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in self.layers.iter().rev() {
            if layer.receive_request(exchange, request, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn receive_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in self.layers.iter().rev() {
            if layer.receive_response(exchange, response, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn receive_empty(
        &self,
        exchange: &Arc<Exchange>,
        message: &mut EmptyMessage,
        effects: &mut Effects,
    ) -> Outcome {
        for layer in self.layers.iter().rev() {
            if layer.receive_empty(exchange, message, effects) == Outcome::Consumed {
                return Outcome::Consumed;
            }
        }
        Outcome::Forward
    }

    pub(crate) fn sweep(&self, now: Instant) {
        for layer in &self.layers {
            layer.sweep(now);
        }
    }
}
