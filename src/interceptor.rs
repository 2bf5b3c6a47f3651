use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::message::{EmptyMessage, Request, Response};

/// Observes every message entering or leaving the endpoint: outbound
/// messages before serialization, inbound messages before matching. An
/// interceptor may cancel a message; downstream stages check the flag and
/// short-circuit. Interceptors never influence delivery ordering.
pub trait MessageInterceptor: Send + Sync {
    fn send_request(&self, _request: &Request) {}

    fn send_response(&self, _response: &Response) {}

    fn send_empty_message(&self, _message: &EmptyMessage) {}

    fn receive_request(&self, _request: &Request) {}

    fn receive_response(&self, _response: &Response) {}

    fn receive_empty_message(&self, _message: &EmptyMessage) {}
}

/// Copy-on-write list with snapshot iteration: readers clone the inner
/// `Arc` and iterate the pre-mutation view, writers replace the vector
/// wholesale. Backs the interceptor, endpoint-observer and
/// notification-listener lists.
pub(crate) struct SnapshotList<T: ?Sized> {
    items: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> SnapshotList<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn add(&self, item: Arc<T>) {
        let mut guard = self
            .items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        next.push(item);
        *guard = Arc::new(next);
    }

    pub(crate) fn remove(&self, item: &Arc<T>) {
        let mut guard = self
            .items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        next.retain(|existing| !Arc::ptr_eq(existing, item));
        *guard = Arc::new(next);
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Runs an interceptor or listener hook, containing panics so the rest of
/// the fan-out and the protocol stage stay unaffected.
pub(crate) fn run_contained(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{what} panicked; continuing");
    }
}
