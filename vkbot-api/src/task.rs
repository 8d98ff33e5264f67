// ABOUTME: RequestTask - one pending API call queued for batched execution.
// ABOUTME: Split into a Responder (executor side) and PendingCall (caller side) over a oneshot.

use crate::auth::Sender;
use crate::error::{ApiError, CallOutcome};
use std::time::Duration;
use tokio::sync::oneshot;

/// Order-preserving string parameters for one API method call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builder-style insert; a repeated key replaces the earlier value in place
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// What to call: method name, parameters and the identity that should execute it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub method: String,
    pub params: Params,
    pub sender: Sender,
}

/// A call waiting in a client queue. Resolved exactly once by the executor.
#[derive(Debug)]
pub struct RequestTask {
    pub call: ApiCall,
    responder: Responder,
}

impl RequestTask {
    /// Create a task and the caller-side handle that observes its result
    pub fn new(call: ApiCall) -> (Self, PendingCall) {
        let (tx, rx) = oneshot::channel();
        let method = call.method.clone();
        (
            Self {
                call,
                responder: Responder { tx },
            },
            PendingCall { method, rx },
        )
    }

    pub fn method(&self) -> &str {
        &self.call.method
    }

    /// Consume the task into its call description and responder
    pub fn into_parts(self) -> (ApiCall, Responder) {
        (self.call, self.responder)
    }

    /// Resolve the task; consumes it so a second resolution cannot happen
    pub fn resolve(self, outcome: CallOutcome) {
        self.responder.resolve(outcome);
    }
}

/// Single-assignment result slot held by the executor
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<CallOutcome>,
}

impl Responder {
    /// Deliver the outcome. Returns false if the caller already gave up.
    pub fn resolve(self, outcome: CallOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// True once the caller side has been dropped (timed out or never awaited)
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Caller-side handle for a queued call
#[derive(Debug)]
pub struct PendingCall {
    method: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait without a ceiling
    pub async fn wait(self) -> CallOutcome {
        self.rx.await.unwrap_or(Err(ApiError::Dropped))
    }

    /// Wait up to `timeout`; past that the task is abandoned and `Timeout` is returned
    pub async fn await_result(self, timeout: Duration) -> CallOutcome {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ApiError::Dropped),
            Err(_) => {
                tracing::warn!(method = %self.method, "API call timed out");
                Err(ApiError::Timeout)
            }
        }
    }

    /// Non-blocking check; `None` while unresolved
    pub fn try_result(&mut self) -> Option<CallOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ApiError::Dropped)),
        }
    }
}
