use std::sync::Arc;

use tracing::debug;

use crate::exchange::Exchange;
use crate::message::{Request, Response};

/// Seam to the application: inbound requests go to the resource logic,
/// matched responses back to whoever issued the request.
pub trait MessageDeliverer: Send + Sync {
    fn deliver_request(&self, exchange: Arc<Exchange>, request: Request);

    fn deliver_response(&self, exchange: Arc<Exchange>, response: Response);
}

/// Default deliverer installed when none is configured: completes the
/// pending-response slot of the originating request and drops inbound
/// requests, which makes a bare endpoint usable as a client.
pub struct ClientMessageDeliverer;

impl MessageDeliverer for ClientMessageDeliverer {
    fn deliver_request(&self, _exchange: Arc<Exchange>, request: Request) {
        debug!(
            path = %request.path(),
            "no deliverer configured for inbound requests, dropping"
        );
    }

    fn deliver_response(&self, exchange: Arc<Exchange>, response: Response) {
        if let Some(request) = exchange.request() {
            request.complete_response(response);
        }
    }
}
