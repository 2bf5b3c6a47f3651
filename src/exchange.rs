use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use coap_lite::MessageType;
use tokio::time::Instant;

use crate::connector::CorrelationContext;
use crate::message::{lock, Request, Response};
use crate::store::{KeyMid, KeyToken};
use crate::EndpointError;

/// Which side created the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// We sent the request.
    Local,
    /// The peer sent the request.
    Remote,
}

/// Retransmission state of an outbound confirmable message. The serialized
/// bytes are kept so every retransmission is bit-identical.
pub(crate) struct RetransmitState {
    bytes: Bytes,
    retransmit_count: u32,
    current_timeout: Duration,
    next_retransmit: Instant,
}

impl RetransmitState {
    pub(crate) fn new(bytes: Bytes, initial_timeout: Duration, now: Instant) -> Self {
        Self {
            bytes,
            retransmit_count: 0,
            current_timeout: initial_timeout,
            next_retransmit: now + initial_timeout,
        }
    }

    /// Advance to the next retransmission, doubling the timeout. Returns
    /// false when the retransmission budget is used up.
    fn advance(&mut self, now: Instant, max_retransmit: u32) -> bool {
        if self.retransmit_count >= max_retransmit {
            return false;
        }
        self.retransmit_count += 1;
        self.current_timeout *= 2;
        self.next_retransmit = now + self.current_timeout;
        true
    }

    fn deadline(&self) -> Instant {
        self.next_retransmit
    }

    fn is_due(&self, now: Instant) -> bool {
        now >= self.next_retransmit
    }
}

/// State of an in-progress blockwise body transfer (RFC 7959), either the
/// body being sent out in slices or the buffer being reassembled.
pub(crate) struct BlockTransfer {
    pub body: Vec<u8>,
    pub next_num: u32,
    pub szx: u8,
    pub token: Vec<u8>,
}

/// Notification ordering state of an observing exchange (RFC 7641).
struct ObserveOrdering {
    last_seq: u32,
    last_arrival: Instant,
}

/// Counters driving the periodic promotion of server notifications to
/// confirmable.
struct NotifyState {
    count: u32,
    last_confirmable: Instant,
}

struct ExchangeInner {
    current_request: Option<Request>,
    current_response: Option<Response>,
    correlation_context: Option<CorrelationContext>,
    retransmission: Option<RetransmitState>,
    needs_reliability: Option<Duration>,
    acknowledged: bool,
    observe_relation: bool,
    observe_ordering: Option<ObserveOrdering>,
    notify_state: Option<NotifyState>,
    block1: Option<BlockTransfer>,
    block2: Option<BlockTransfer>,
    key_mids: Vec<KeyMid>,
    key_tokens: Vec<KeyToken>,
    remove_hook: Option<Box<dyn FnOnce(&Exchange) + Send>>,
}

/// Correlation state between one request and the responses, ACKs and RSTs
/// it elicits. Shared between the matcher and the protocol stack; all
/// mutation goes through one short-lived lock so hooks running on
/// different threads stay totally ordered per exchange.
pub struct Exchange {
    origin: Origin,
    remote: SocketAddr,
    created: Instant,
    completed: AtomicBool,
    canceled: AtomicBool,
    custom_executor: AtomicBool,
    inner: Mutex<ExchangeInner>,
}

impl Exchange {
    pub(crate) fn new(origin: Origin, remote: SocketAddr) -> Self {
        Self {
            origin,
            remote,
            created: Instant::now(),
            completed: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            custom_executor: AtomicBool::new(false),
            inner: Mutex::new(ExchangeInner {
                current_request: None,
                current_response: None,
                correlation_context: None,
                retransmission: None,
                needs_reliability: None,
                acknowledged: false,
                observe_relation: false,
                observe_ordering: None,
                notify_state: None,
                block1: None,
                block2: None,
                key_mids: Vec::new(),
                key_tokens: Vec::new(),
                remove_hook: None,
            }),
        }
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Creation instant; the round-trip time of a matched response is
    /// measured against this.
    pub(crate) fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// When set, responses for this exchange are routed through the
    /// protocol stage instead of the calling thread.
    pub fn has_custom_executor(&self) -> bool {
        self.custom_executor.load(Ordering::Acquire)
    }

    pub fn set_custom_executor(&self, value: bool) {
        self.custom_executor.store(value, Ordering::Release);
    }

    pub fn request(&self) -> Option<Request> {
        lock(&self.inner).current_request.clone()
    }

    pub(crate) fn set_request(&self, request: Request) {
        lock(&self.inner).current_request = Some(request);
    }

    pub fn response(&self) -> Option<Response> {
        lock(&self.inner).current_response.clone()
    }

    pub(crate) fn set_response(&self, response: Response) {
        lock(&self.inner).current_response = Some(response);
    }

    pub(crate) fn request_mid(&self) -> Option<u16> {
        lock(&self.inner).current_request.as_ref().map(|r| r.mid())
    }

    pub(crate) fn request_type(&self) -> Option<MessageType> {
        lock(&self.inner)
            .current_request
            .as_ref()
            .map(|r| r.message_type())
    }

    pub fn correlation_context(&self) -> Option<CorrelationContext> {
        lock(&self.inner).correlation_context.clone()
    }

    pub(crate) fn set_correlation_context(&self, context: CorrelationContext) {
        lock(&self.inner).correlation_context = Some(context);
    }

    /// True once an ACK settled the confirmable request of this exchange.
    pub(crate) fn is_acknowledged(&self) -> bool {
        lock(&self.inner).acknowledged
    }

    pub(crate) fn mark_acknowledged(&self) {
        lock(&self.inner).acknowledged = true;
    }

    pub fn has_observe_relation(&self) -> bool {
        lock(&self.inner).observe_relation
    }

    pub(crate) fn set_observe_relation(&self, value: bool) {
        lock(&self.inner).observe_relation = value;
    }

    // --- reliability sub-record ---

    /// Marks the exchange so the outbox arms retransmission with the given
    /// initial timeout once the serialized bytes are known.
    pub(crate) fn set_needs_reliability(&self, initial_timeout: Duration) {
        lock(&self.inner).needs_reliability = Some(initial_timeout);
    }

    pub(crate) fn take_needs_reliability(&self) -> Option<Duration> {
        lock(&self.inner).needs_reliability.take()
    }

    pub(crate) fn arm_retransmission(&self, bytes: Bytes, initial_timeout: Duration, now: Instant) {
        lock(&self.inner).retransmission = Some(RetransmitState::new(bytes, initial_timeout, now));
    }

    pub(crate) fn disarm_retransmission(&self) {
        lock(&self.inner).retransmission = None;
    }

    pub(crate) fn retransmit_deadline(&self) -> Option<Instant> {
        lock(&self.inner).retransmission.as_ref().map(|r| r.deadline())
    }

    /// Advances a due retransmission. `Some(bytes)` is the frame to
    /// re-send; `None` means the budget is exhausted and the caller must
    /// fail the exchange. Not due yet returns the frame of the next
    /// attempt only when `now` has reached the deadline.
    pub(crate) fn advance_retransmission(&self, now: Instant, max_retransmit: u32) -> Option<Bytes> {
        let mut inner = lock(&self.inner);
        let state = inner.retransmission.as_mut()?;
        if !state.is_due(now) {
            return None;
        }
        if state.advance(now, max_retransmit) {
            Some(state.bytes.clone())
        } else {
            inner.retransmission = None;
            None
        }
    }

    pub(crate) fn retransmission_due(&self, now: Instant) -> bool {
        lock(&self.inner)
            .retransmission
            .as_ref()
            .is_some_and(|r| r.is_due(now))
    }

    pub(crate) fn retransmit_count(&self) -> u32 {
        lock(&self.inner)
            .retransmission
            .as_ref()
            .map(|r| r.retransmit_count)
            .unwrap_or(0)
    }

    // --- observe sub-record ---

    /// RFC 7641 ordering test: a notification is fresh when its sequence
    /// number advanced (mod 2^24) or the freshness window has passed.
    pub(crate) fn accept_notification(&self, seq: u32, now: Instant, window: Duration) -> bool {
        let mut inner = lock(&self.inner);
        match &mut inner.observe_ordering {
            None => {
                inner.observe_ordering = Some(ObserveOrdering {
                    last_seq: seq,
                    last_arrival: now,
                });
                true
            }
            Some(ordering) => {
                let delta = seq.wrapping_sub(ordering.last_seq) & 0x00FF_FFFF;
                let fresh = (1..1 << 23).contains(&delta)
                    || now > ordering.last_arrival + window;
                if fresh {
                    ordering.last_seq = seq;
                    ordering.last_arrival = now;
                }
                fresh
            }
        }
    }

    /// Decides whether the next notification must go out confirmable,
    /// counting notifications and tracking the last confirmable one.
    pub(crate) fn promote_notification(&self, interval: Duration, every: u32, now: Instant) -> bool {
        let mut inner = lock(&self.inner);
        let state = inner.notify_state.get_or_insert_with(|| NotifyState {
            count: 0,
            last_confirmable: now,
        });
        state.count += 1;
        if state.count % every.max(1) == 0 || now >= state.last_confirmable + interval {
            state.last_confirmable = now;
            true
        } else {
            false
        }
    }

    // --- blockwise sub-records ---

    pub(crate) fn with_block1<R>(&self, f: impl FnOnce(&mut Option<BlockTransfer>) -> R) -> R {
        f(&mut lock(&self.inner).block1)
    }

    pub(crate) fn with_block2<R>(&self, f: impl FnOnce(&mut Option<BlockTransfer>) -> R) -> R {
        f(&mut lock(&self.inner).block2)
    }

    // --- matcher bookkeeping ---

    pub(crate) fn record_key_mid(&self, key: KeyMid) {
        lock(&self.inner).key_mids.push(key);
    }

    pub(crate) fn record_key_token(&self, key: KeyToken) {
        lock(&self.inner).key_tokens.push(key);
    }

    pub(crate) fn take_registered_keys(&self) -> (Vec<KeyMid>, Vec<KeyToken>) {
        let mut inner = lock(&self.inner);
        (
            std::mem::take(&mut inner.key_mids),
            std::mem::take(&mut inner.key_tokens),
        )
    }

    /// Installs the cleanup hook run exactly once at completion; the
    /// matcher uses it to drop every table entry pointing at this exchange.
    pub(crate) fn set_remove_hook(&self, hook: Box<dyn FnOnce(&Exchange) + Send>) {
        let mut inner = lock(&self.inner);
        if inner.remove_hook.is_none() {
            inner.remove_hook = Some(hook);
        }
    }

    /// Completes the exchange: disarms timers and runs the cleanup hook.
    /// Safe to call more than once.
    pub fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        let hook = {
            let mut inner = lock(&self.inner);
            inner.retransmission = None;
            inner.remove_hook.take()
        };
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Fails the exchange, delivering the error to a local caller waiting
    /// on the request, then completes it.
    pub(crate) fn fail(&self, error: EndpointError) {
        let sink = lock(&self.inner)
            .current_request
            .as_ref()
            .map(|r| r.sink.clone());
        if let Some(sink) = sink {
            sink.complete(Err(error));
        }
        self.complete();
    }

    /// Cancels the exchange: timers disarmed, matcher keys removed,
    /// completion delivered as a cancellation.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.fail(EndpointError::Canceled);
    }
}
