use std::sync::Arc;
use std::time::Duration;

use coap_lite::MessageType;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CoapConfig;
use crate::exchange::{Exchange, Origin};
use crate::message::{EmptyMessage, Response};
use crate::observe::ObservationStore;
use crate::stack::{Effects, Layer, Outcome};

/// Freshness window of RFC 7641: past it, any sequence number counts as
/// newer.
const NOTIFICATION_FRESHNESS: Duration = Duration::from_secs(128);

/// Top layer: enforces notification ordering on observing exchanges and
/// periodically promotes outbound notifications to confirmable so dead
/// observers get detected. Registration itself happens in the matcher,
/// once the request token is final.
pub(crate) struct ObserveLayer {
    observations: Arc<dyn ObservationStore>,
    check_interval: Duration,
    check_count: u32,
}

impl ObserveLayer {
    pub(crate) fn new(config: &CoapConfig, observations: Arc<dyn ObservationStore>) -> Self {
        Self {
            observations,
            check_interval: config.notification_check_interval,
            check_count: config.notification_check_interval_count,
        }
    }
}

impl Layer for ObserveLayer {
    fn send_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        if exchange.origin() == Origin::Remote
            && response.observe().is_some()
            && response.message_type() == MessageType::NonConfirmable
            && exchange.promote_notification(self.check_interval, self.check_count, Instant::now())
        {
            response.set_message_type(MessageType::Confirmable);
        }
        Outcome::Forward
    }

    fn receive_response(
        &self,
        exchange: &Arc<Exchange>,
        response: &mut Response,
        _effects: &mut Effects,
    ) -> Outcome {
        if let Some(seq) = response.observe() {
            if exchange.has_observe_relation() {
                if !exchange.accept_notification(seq, Instant::now(), NOTIFICATION_FRESHNESS) {
                    debug!(seq, "stale notification, dropping");
                    return Outcome::Consumed;
                }
                self.observations.set_sequence(response.token(), seq);
            }
        }
        Outcome::Forward
    }

    fn receive_empty(
        &self,
        exchange: &Arc<Exchange>,
        message: &mut EmptyMessage,
        _effects: &mut Effects,
    ) -> Outcome {
        // A reset answering a notification cancels the relation.
        if message.message_type() == MessageType::Reset && exchange.has_observe_relation() {
            if let Some(request) = exchange.request() {
                self.observations.remove(request.token());
            }
            exchange.set_observe_relation(false);
        }
        Outcome::Forward
    }
}
