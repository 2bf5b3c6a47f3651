use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coap_lite::MessageType;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;

use crate::config::CoapConfig;
use crate::exchange::{Exchange, Origin};
use crate::EndpointError;

/// Identifies a message by MID and peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMid {
    pub mid: u16,
    pub peer: SocketAddr,
}

impl KeyMid {
    pub fn new(mid: u16, peer: SocketAddr) -> Self {
        Self { mid, peer }
    }
}

/// Identifies an outstanding request by token and peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyToken {
    pub token: Vec<u8>,
    pub peer: SocketAddr,
}

impl KeyToken {
    pub fn new(token: impl Into<Vec<u8>>, peer: SocketAddr) -> Self {
        Self {
            token: token.into(),
            peer,
        }
    }
}

/// Deduplication record for an inbound MID. Once a response goes out its
/// serialized bytes are cached here so a duplicate gets the identical
/// answer without another delivery.
struct DedupEntry {
    exchange: Arc<Exchange>,
    response_bytes: Option<Bytes>,
    created: Instant,
}

/// Tables of in-flight exchanges, keyed by MID (outbound confirmables),
/// token (outstanding local requests) and inbound MID (deduplication),
/// plus the MID and token allocators.
pub struct ExchangeStore {
    by_mid: DashMap<KeyMid, Arc<Exchange>>,
    by_token: DashMap<KeyToken, Arc<Exchange>>,
    dedup: DashMap<KeyMid, DedupEntry>,
    next_mid: AtomicU16,
    token_length: usize,
    exchange_lifetime: Duration,
    non_lifetime: Duration,
}

impl ExchangeStore {
    pub fn new(config: &CoapConfig) -> Self {
        Self {
            by_mid: DashMap::new(),
            by_token: DashMap::new(),
            dedup: DashMap::new(),
            next_mid: AtomicU16::new(rand::rng().random()),
            token_length: config.token_size_limit.clamp(1, 8),
            exchange_lifetime: config.exchange_lifetime,
            non_lifetime: config.non_lifetime,
        }
    }

    /// Next MID from the wrapping 16-bit counter.
    pub fn assign_mid(&self) -> u16 {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a token not currently bound to an exchange with `peer`.
    pub fn allocate_token(&self, peer: SocketAddr) -> Vec<u8> {
        loop {
            let raw: [u8; 8] = rand::rng().random();
            let token = raw[..self.token_length].to_vec();
            if !self.by_token.contains_key(&KeyToken::new(token.clone(), peer)) {
                return token;
            }
        }
    }

    /// Registers an outstanding request under its token. Re-registering the
    /// same exchange is a no-op; a different live exchange under the same
    /// token is rejected.
    pub fn register_token(&self, key: KeyToken, exchange: &Arc<Exchange>) -> Result<(), EndpointError> {
        let inserted = match self.by_token.entry(key.clone()) {
            Entry::Occupied(existing) => {
                if Arc::ptr_eq(existing.get(), exchange) {
                    false
                } else {
                    return Err(EndpointError::RejectedDuplicateToken);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(exchange.clone());
                true
            }
        };
        if inserted {
            exchange.record_key_token(key);
        }
        Ok(())
    }

    /// Registers an outbound confirmable under its MID for ACK/RST
    /// matching. Idempotent for the same exchange.
    pub fn register_mid(&self, key: KeyMid, exchange: &Arc<Exchange>) {
        let inserted = match self.by_mid.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if Arc::ptr_eq(existing.get(), exchange) {
                    false
                } else {
                    // MID collision with a foreign live exchange; the newer
                    // registration wins, mirroring the wrapping allocator.
                    existing.insert(exchange.clone());
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(exchange.clone());
                true
            }
        };
        if inserted {
            exchange.record_key_mid(key);
        }
    }

    pub fn find_by_token(&self, key: &KeyToken) -> Option<Arc<Exchange>> {
        self.by_token.get(key).map(|e| e.clone())
    }

    pub fn remove_by_mid(&self, key: &KeyMid) -> Option<Arc<Exchange>> {
        self.by_mid.remove(key).map(|(_, e)| e)
    }

    /// Records an inbound MID. Returns the exchange of the earlier sighting
    /// when the MID is a duplicate.
    pub fn register_inbound(&self, key: KeyMid, exchange: &Arc<Exchange>, now: Instant) -> Option<Arc<Exchange>> {
        match self.dedup.entry(key) {
            Entry::Occupied(existing) => Some(existing.get().exchange.clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(DedupEntry {
                    exchange: exchange.clone(),
                    response_bytes: None,
                    created: now,
                });
                None
            }
        }
    }

    /// Caches the serialized response answering an inbound MID, for
    /// re-sending on duplicates.
    pub fn cache_response(&self, key: &KeyMid, bytes: Bytes) {
        if let Some(mut entry) = self.dedup.get_mut(key) {
            entry.response_bytes = Some(bytes);
        }
    }

    pub fn cached_response(&self, key: &KeyMid) -> Option<Bytes> {
        self.dedup.get(key).and_then(|e| e.response_bytes.clone())
    }

    /// Drops the table entries recorded on a completed exchange.
    pub fn remove_exchange_keys(&self, exchange: &Exchange) {
        let (mids, tokens) = exchange.take_registered_keys();
        for key in mids {
            self.by_mid.remove(&key);
        }
        for key in tokens {
            self.by_token.remove(&key);
        }
    }

    /// Soonest instant at which a retransmission fires or a
    /// non-confirmable exchange expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        let retransmit = self
            .by_mid
            .iter()
            .filter_map(|e| e.value().retransmit_deadline())
            .min();
        let expiry = self
            .by_token
            .iter()
            .filter_map(|e| self.non_expiry_deadline(e.value()))
            .min();
        match (retransmit, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn non_expiry_deadline(&self, exchange: &Arc<Exchange>) -> Option<Instant> {
        let non = exchange.origin() == Origin::Local
            && exchange.request_type() == Some(MessageType::NonConfirmable)
            && !exchange.has_observe_relation();
        non.then(|| exchange.created() + self.non_lifetime)
    }

    /// Advances every due retransmission. Returns the frames to re-send
    /// and the exchanges whose retransmission budget is exhausted.
    pub fn collect_retransmissions(
        &self,
        now: Instant,
        max_retransmit: u32,
    ) -> (Vec<(SocketAddr, Bytes)>, Vec<Arc<Exchange>>) {
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        for exchange in self.unique_exchanges(&self.by_mid) {
            if !exchange.retransmission_due(now) {
                continue;
            }
            match exchange.advance_retransmission(now, max_retransmit) {
                Some(bytes) => resend.push((exchange.remote(), bytes)),
                None => exhausted.push(exchange),
            }
        }
        (resend, exhausted)
    }

    /// Non-confirmable exchanges past their lifetime.
    pub fn expired_non(&self, now: Instant) -> Vec<Arc<Exchange>> {
        self.unique_exchanges(&self.by_token)
            .into_iter()
            .filter(|e| self.non_expiry_deadline(e).is_some_and(|d| now >= d))
            .collect()
    }

    /// Evicts exchanges past the exchange lifetime (observe-bearing ones
    /// are exempt) and stale deduplication entries. Returns the evicted
    /// exchanges so the caller can fail them.
    pub fn sweep(&self, now: Instant) -> Vec<Arc<Exchange>> {
        let mut evicted: Vec<Arc<Exchange>> = Vec::new();
        for exchange in self
            .unique_exchanges(&self.by_token)
            .into_iter()
            .chain(self.unique_exchanges(&self.by_mid))
        {
            if exchange.has_observe_relation() {
                continue;
            }
            if now >= exchange.created() + self.exchange_lifetime
                && !evicted.iter().any(|e| Arc::ptr_eq(e, &exchange))
            {
                evicted.push(exchange);
            }
        }
        self.dedup
            .retain(|_, entry| now < entry.created + self.exchange_lifetime);
        evicted
    }

    pub fn clear(&self) {
        self.by_mid.clear();
        self.by_token.clear();
        self.dedup.clear();
    }

    /// Exchanges matching `token` towards any peer.
    pub fn exchanges_with_token(&self, token: &[u8]) -> Vec<Arc<Exchange>> {
        self.by_token
            .iter()
            .filter(|e| e.key().token == token)
            .map(|e| e.value().clone())
            .collect()
    }

    fn unique_exchanges<K>(&self, table: &DashMap<K, Arc<Exchange>>) -> Vec<Arc<Exchange>>
    where
        K: std::hash::Hash + Eq + Clone,
    {
        let mut unique: Vec<Arc<Exchange>> = Vec::new();
        for entry in table.iter() {
            if !unique.iter().any(|e| Arc::ptr_eq(e, entry.value())) {
                unique.push(entry.value().clone());
            }
        }
        unique
    }

    #[cfg(test)]
    pub(crate) fn mid_entries(&self) -> usize {
        self.by_mid.len()
    }

    #[cfg(test)]
    pub(crate) fn token_entries(&self) -> usize {
        self.by_token.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn store() -> ExchangeStore {
        ExchangeStore::new(&CoapConfig::default())
    }

    #[test]
    fn mid_allocator_wraps() {
        let store = store();
        store.next_mid.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(store.assign_mid(), u16::MAX - 1);
        assert_eq!(store.assign_mid(), u16::MAX);
        assert_eq!(store.assign_mid(), 0);
        assert_eq!(store.assign_mid(), 1);
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected() {
        let store = store();
        let first = Arc::new(Exchange::new(Origin::Local, peer()));
        let second = Arc::new(Exchange::new(Origin::Local, peer()));
        let key = KeyToken::new(vec![1, 2, 3], peer());

        store.register_token(key.clone(), &first).unwrap();
        // Same exchange again: idempotent.
        store.register_token(key.clone(), &first).unwrap();
        assert!(matches!(
            store.register_token(key, &second),
            Err(EndpointError::RejectedDuplicateToken)
        ));
    }

    #[tokio::test]
    async fn allocated_tokens_avoid_live_exchanges() {
        let store = store();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let token = store.allocate_token(peer());
        assert_eq!(token.len(), 8);
        store
            .register_token(KeyToken::new(token.clone(), peer()), &exchange)
            .unwrap();
        assert_ne!(store.allocate_token(peer()), token);
    }

    #[tokio::test]
    async fn completion_hook_releases_keys() {
        let store = Arc::new(store());
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let hook_store = store.clone();
        exchange.set_remove_hook(Box::new(move |e| hook_store.remove_exchange_keys(e)));

        store
            .register_token(KeyToken::new(vec![9], peer()), &exchange)
            .unwrap();
        store.register_mid(KeyMid::new(7, peer()), &exchange);
        assert_eq!(store.token_entries(), 1);
        assert_eq!(store.mid_entries(), 1);

        exchange.complete();
        assert_eq!(store.token_entries(), 0);
        assert_eq!(store.mid_entries(), 0);
    }

    #[tokio::test]
    async fn inbound_dedup_flags_duplicates_and_serves_cache() {
        tokio::time::pause();
        let store = store();
        let exchange = Arc::new(Exchange::new(Origin::Remote, peer()));
        let key = KeyMid::new(0x0101, peer());
        let now = Instant::now();

        assert!(store.register_inbound(key.clone(), &exchange, now).is_none());
        let seen = store.register_inbound(key.clone(), &exchange, now);
        assert!(seen.is_some_and(|e| Arc::ptr_eq(&e, &exchange)));

        assert!(store.cached_response(&key).is_none());
        store.cache_response(&key, Bytes::from_static(b"ack"));
        assert_eq!(store.cached_response(&key).unwrap(), Bytes::from_static(b"ack"));
    }

    #[tokio::test]
    async fn sweep_evicts_stale_but_spares_observing_exchanges() {
        tokio::time::pause();
        let store = store();
        let stale = Arc::new(Exchange::new(Origin::Local, peer()));
        let observing = Arc::new(Exchange::new(Origin::Local, peer()));
        observing.set_observe_relation(true);
        store
            .register_token(KeyToken::new(vec![1], peer()), &stale)
            .unwrap();
        store
            .register_token(KeyToken::new(vec![2], peer()), &observing)
            .unwrap();

        tokio::time::advance(Duration::from_secs(248)).await;
        let evicted = store.sweep(Instant::now());
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &stale));
    }

    #[tokio::test]
    async fn non_exchanges_expire_via_deadline() {
        tokio::time::pause();
        let store = store();
        let exchange = Arc::new(Exchange::new(Origin::Local, peer()));
        let mut request = crate::message::Request::new(coap_lite::RequestType::Get);
        request.set_confirmable(false);
        exchange.set_request(request);
        store
            .register_token(KeyToken::new(vec![4], peer()), &exchange)
            .unwrap();

        let deadline = store.next_deadline().unwrap();
        assert_eq!(deadline, exchange.created() + Duration::from_secs(145));

        assert!(store.expired_non(exchange.created()).is_empty());
        let expired = store.expired_non(deadline);
        assert_eq!(expired.len(), 1);
    }
}
