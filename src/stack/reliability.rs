use std::sync::Arc;
use std::time::Duration;

use coap_lite::MessageType;
use rand::Rng;
use tracing::{debug, trace};

use crate::config::CoapConfig;
use crate::exchange::{Exchange, Origin};
use crate::message::{EmptyMessage, Request, Response};
use crate::stack::{Effects, Layer, Outcome};
use crate::store::{ExchangeStore, KeyMid};
use crate::EndpointError;

/// Bottom layer of the datagram stack: arms retransmission for outbound
/// confirmables, answers confirmable requests piggy-backed or separate,
/// re-sends cached responses for duplicates, and settles exchanges on
/// ACK and RST.
pub(crate) struct ReliabilityLayer {
    store: Arc<ExchangeStore>,
    ack_timeout: Duration,
    ack_random_factor: f64,
}

impl ReliabilityLayer {
    pub(crate) fn new(config: &CoapConfig, store: Arc<ExchangeStore>) -> Self {
        Self {
            store,
            ack_timeout: config.ack_timeout,
            ack_random_factor: config.ack_random_factor,
        }
    }

    /// Random timeout in [ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR].
    fn initial_timeout(&self) -> Duration {
        let lo = self.ack_timeout.as_secs_f64();
        let hi = lo * self.ack_random_factor;
        Duration::from_secs_f64(rand::rng().random_range(lo..=hi))
    }
}

impl Layer for ReliabilityLayer {
    fn send_request(
        &self,
        exchange: &Arc<Exchange>,
        request: &mut Request,
        _effects: &mut Effects,
    ) -> Outcome {
        if request.is_confirmable() {
            exchange.set_needs_reliability(self.initial_timeout());
        }
        Outcome::Forward
    }

    fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        if exchange.origin() == Origin::Remote {
            let confirmable_request = exchange.request_type() == Some(MessageType::Confirmable);
            if confirmable_request && !exchange.is_acknowledged() {
                // Piggy-back: the response rides in the ACK for the request.
                response.set_message_type(MessageType::Acknowledgement);
                if let Some(mid) = exchange.request_mid() {
                    response.set_mid(mid);
                }
                exchange.mark_acknowledged();
            } else if response.is_confirmable() {
                // Separate confirmable response: retransmitted on its own.
                exchange.set_needs_reliability(self.initial_timeout());
            }
        }
        Outcome::Forward
    }

    fn receive_request(
        &self,
        _exchange: &Arc<Exchange>,
        request: &mut Request,
        effects: &mut Effects,
    ) -> Outcome {
        if request.is_duplicate() {
            if let Some(source) = request.source() {
                let key = KeyMid::new(request.mid(), source);
                match self.store.cached_response(&key) {
                    Some(bytes) => {
                        trace!(mid = request.mid(), "re-sending cached response for duplicate");
                        effects.raw_frames.push((source, bytes));
                    }
                    None => {
                        // Still processing the original; the answer will go
                        // out once, when the handler responds.
                        trace!(mid = request.mid(), "duplicate before response, dropping");
                    }
                }
            }
            return Outcome::Consumed;
        }
        Outcome::Forward
    }

    fn receive_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        effects: &mut Effects,
    ) -> Outcome {
        // The response settles the request, with or without a prior ACK.
        exchange.disarm_retransmission();
        exchange.mark_acknowledged();

        if response.is_confirmable() {
            if let Some(source) = response.source() {
                effects
                    .empties
                    .push((Some(exchange.clone()), EmptyMessage::ack(response.mid(), source)));
            }
        }

        if response.is_duplicate() {
            // ACK repeated above where needed; nothing to deliver again.
            return Outcome::Consumed;
        }
        Outcome::Forward
    }

    fn receive_empty(
        &self,
        exchange: &Arc<Exchange>,
        message: &mut EmptyMessage,
        _effects: &mut Effects,
    ) -> Outcome {
        match message.message_type() {
            MessageType::Acknowledgement => {
                exchange.mark_acknowledged();
                exchange.disarm_retransmission();
                if exchange.origin() == Origin::Remote {
                    // Our separate confirmable response is settled.
                    exchange.complete();
                }
                Outcome::Forward
            }
            MessageType::Reset => {
                debug!(mid = message.mid(), "peer reset the exchange");
                exchange.disarm_retransmission();
                if exchange.origin() == Origin::Local {
                    exchange.fail(EndpointError::Reset);
                } else {
                    exchange.complete();
                }
                Outcome::Forward
            }
            _ => Outcome::Forward,
        }
    }
}
