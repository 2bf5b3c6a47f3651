use dashmap::DashMap;

use crate::connector::CorrelationContext;
use crate::message::{Request, Response};

/// Durable record of a remote resource this endpoint observes: the token
/// that correlates notifications, the target URI, the registering request
/// and the transport session the relation was established on.
#[derive(Clone)]
pub struct Observation {
    token: Vec<u8>,
    uri: String,
    request: Request,
    last_sequence: Option<u32>,
    context: Option<CorrelationContext>,
}

impl Observation {
    pub fn new(token: Vec<u8>, uri: String, request: Request) -> Self {
        Self {
            token,
            uri,
            request,
            last_sequence: None,
            context: None,
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.last_sequence
    }

    pub fn context(&self) -> Option<&CorrelationContext> {
        self.context.as_ref()
    }
}

/// Storage backend for observations. In-memory by default; a persistent
/// implementation lets observe relations survive endpoint restarts.
pub trait ObservationStore: Send + Sync + 'static {
    fn put(&self, observation: Observation);

    fn get(&self, token: &[u8]) -> Option<Observation>;

    fn remove(&self, token: &[u8]) -> Option<Observation>;

    /// Updates the session context after a handshake established it.
    fn set_context(&self, token: &[u8], context: CorrelationContext);

    /// Records the sequence number of the latest accepted notification.
    fn set_sequence(&self, token: &[u8], sequence: u32);
}

/// Default observation store backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryObservationStore {
    observations: DashMap<Vec<u8>, Observation>,
}

impl InMemoryObservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObservationStore for InMemoryObservationStore {
    fn put(&self, observation: Observation) {
        self.observations
            .insert(observation.token.clone(), observation);
    }

    fn get(&self, token: &[u8]) -> Option<Observation> {
        self.observations.get(token).map(|o| o.clone())
    }

    fn remove(&self, token: &[u8]) -> Option<Observation> {
        self.observations.remove(token).map(|(_, o)| o)
    }

    fn set_context(&self, token: &[u8], context: CorrelationContext) {
        if let Some(mut observation) = self.observations.get_mut(token) {
            observation.context = Some(context);
        }
    }

    fn set_sequence(&self, token: &[u8], sequence: u32) {
        if let Some(mut observation) = self.observations.get_mut(token) {
            observation.last_sequence = Some(sequence);
        }
    }
}

/// Receives every accepted observe notification, in addition to the
/// message deliverer.
pub trait NotificationListener: Send + Sync {
    fn on_notification(&self, request: &Request, response: &Response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::RequestType;

    #[test]
    fn in_memory_store_lifecycle() {
        let store = InMemoryObservationStore::new();
        let request = Request::new(RequestType::Get);
        store.put(Observation::new(
            vec![0x55],
            "coap://10.0.0.1:5683/temp".into(),
            request,
        ));

        store.set_sequence(&[0x55], 7);
        store.set_context(&[0x55], CorrelationContext::new(&b"dtls-1"[..]));

        let observation = store.get(&[0x55]).unwrap();
        assert_eq!(observation.uri(), "coap://10.0.0.1:5683/temp");
        assert_eq!(observation.last_sequence(), Some(7));
        assert!(observation.context().is_some());

        assert!(store.remove(&[0x55]).is_some());
        assert!(store.get(&[0x55]).is_none());
    }
}
