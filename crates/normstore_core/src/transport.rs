//! Transport capability abstraction.
//!
//! The store never talks to the network itself. It consumes a capability
//! object exposing asynchronous `get`/`post`/`put`/`delete` calls, so the
//! concrete client (reqwest, hyper, a WASM fetch shim, an in-process fake)
//! stays outside the core. Payload shapes are caller-defined JSON; typed
//! decoding happens in the query coordinator.

use crate::error::TransportError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// The eventual result of one transport call.
pub type TransportResult = Result<Value, TransportError>;

/// A boxed future resolving to one transport result.
pub type TransportFuture = BoxFuture<'static, TransportResult>;

/// Asynchronous transport capability consumed by the store.
///
/// Implementations must be cheap to call concurrently; the store issues
/// overlapping requests and deduplicates identical loads itself.
pub trait Transport: Send + Sync {
    /// Fetches a resource.
    fn get(&self, url: &str) -> TransportFuture;

    /// Creates a resource.
    fn post(&self, url: &str, body: Value) -> TransportFuture;

    /// Replaces or updates a resource.
    fn put(&self, url: &str, body: Value) -> TransportFuture;

    /// Deletes a resource.
    fn delete(&self, url: &str) -> TransportFuture;
}

/// Transport verb, used for scripting and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `get` call.
    Get,
    /// `post` call.
    Post,
    /// `put` call.
    Put,
    /// `delete` call.
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// A scripted transport for tests and demos.
///
/// Responses are queued per `(method, url)`; each call pops the next response
/// for its slot, or fails if none is scripted. Every call is recorded in a
/// log. A gate can hold responses back so a test can create overlapping
/// in-flight requests deterministically:
///
/// ```rust,ignore
/// let transport = MockTransport::new();
/// transport.respond_get("/pokemon/1", json!({"id": 1}));
/// let gate = transport.gated();
/// // ... start two loads, observe dedup, then:
/// gate.open(2);
/// ```
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<(Method, String), VecDeque<TransportResult>>>,
    calls: Mutex<Vec<(Method, String, Option<Value>)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Handle releasing calls held by a gated [`MockTransport`].
#[derive(Clone)]
pub struct MockGate(Arc<Semaphore>);

impl MockGate {
    /// Lets `calls` held transport calls proceed.
    pub fn open(&self, calls: usize) {
        self.0.add_permits(calls);
    }
}

impl MockTransport {
    /// Creates a mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response for a `get` call.
    pub fn respond_get(&self, url: &str, value: Value) {
        self.respond(Method::Get, url, Ok(value));
    }

    /// Queues a successful response for a `post` call.
    pub fn respond_post(&self, url: &str, value: Value) {
        self.respond(Method::Post, url, Ok(value));
    }

    /// Queues a successful response for a `put` call.
    pub fn respond_put(&self, url: &str, value: Value) {
        self.respond(Method::Put, url, Ok(value));
    }

    /// Queues a successful response for a `delete` call.
    pub fn respond_delete(&self, url: &str, value: Value) {
        self.respond(Method::Delete, url, Ok(value));
    }

    /// Queues a failure for any verb.
    pub fn fail(&self, method: Method, url: &str, err: TransportError) {
        self.respond(method, url, Err(err));
    }

    /// Queues a raw response for any verb.
    pub fn respond(&self, method: Method, url: &str, response: TransportResult) {
        self.responses
            .lock()
            .entry((method, url.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Holds every subsequent call until the returned gate is opened.
    pub fn gated(&self) -> MockGate {
        let semaphore = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&semaphore));
        MockGate(semaphore)
    }

    /// Returns the log of calls seen so far.
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.calls
            .lock()
            .iter()
            .map(|(m, u, _)| (*m, u.clone()))
            .collect()
    }

    /// Returns how many calls hit a `(method, url)` slot.
    pub fn call_count(&self, method: Method, url: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(m, u, _)| *m == method && u == url)
            .count()
    }

    /// Returns the body recorded for the most recent call to a slot.
    pub fn last_body(&self, method: Method, url: &str) -> Option<Value> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(m, u, _)| *m == method && u == url)
            .and_then(|(_, _, body)| body.clone())
    }

    fn issue(&self, method: Method, url: &str, body: Option<Value>) -> TransportFuture {
        self.calls.lock().push((method, url.to_string(), body));

        let response = self
            .responses
            .lock()
            .get_mut(&(method, url.to_string()))
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| {
                Err(TransportError::new(format!(
                    "no mock response scripted for {method} {url}"
                )))
            });
        let gate = self.gate.lock().clone();

        Box::pin(async move {
            if let Some(gate) = gate {
                // Held until the test opens the gate; the permit is consumed.
                let permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|_| TransportError::new("mock gate closed"))?;
                permit.forget();
            }
            response
        })
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str) -> TransportFuture {
        self.issue(Method::Get, url, None)
    }

    fn post(&self, url: &str, body: Value) -> TransportFuture {
        self.issue(Method::Post, url, Some(body))
    }

    fn put(&self, url: &str, body: Value) -> TransportFuture {
        self.issue(Method::Put, url, Some(body))
    }

    fn delete(&self, url: &str) -> TransportFuture {
        self.issue(Method::Delete, url, None)
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}
