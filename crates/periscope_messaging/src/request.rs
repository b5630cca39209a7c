//! # Request / Response
//!
//! Both halves of the request protocol, shared by every boundary.
//!
//! ```text
//!   sender                                  receiver
//!   RequestTable::open ──REQUEST{id}──>     HandlerRegistry::dispatch
//!   RequestTable::settle <──RESPONSE{id}──  (resolve | reject)
//! ```
//!
//! An entry leaves the table before its future is settled, so each id
//! settles at most once.

use crate::error::{HandlerError, MessagingError, MessagingResult};
use parking_lot::{Mutex, RwLock};
use periscope_shared::{ErrorPayload, Request, RequestId, Response, ResponseOutcome, UNHANDLED_REQUEST};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Future of a request's settlement.
#[derive(Debug)]
#[must_use = "a request's outcome is only observed by awaiting its response"]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<MessagingResult<Value>>,
}

impl PendingResponse {
    /// Id of the request this response answers.
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Waits at most `limit` for the response.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::Timeout`] if the bound expires, or the
    /// request's own error.
    pub async fn with_timeout(self, limit: Duration) -> MessagingResult<Value> {
        let what = format!("request {}", self.id);
        tokio::time::timeout(limit, self).await.map_err(|_| MessagingError::Timeout {
            what,
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })?
    }
}

impl Future for PendingResponse {
    type Output = MessagingResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(MessagingError::Disconnected)))
    }
}

/// Outstanding requests keyed by id.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: Mutex<HashMap<RequestId, oneshot::Sender<MessagingResult<Value>>>>,
}

impl RequestTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new request and returns its envelope plus its future.
    pub fn open(&self, request_type: &str, payload: Value) -> (Request, PendingResponse) {
        let id = RequestId::generate();
        let pending = self.register(id.clone());
        let request = Request {
            id,
            request_type: request_type.to_string(),
            payload,
        };
        (request, pending)
    }

    /// Records a pending entry for a caller-supplied id.
    pub fn register(&self, id: RequestId) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(id.clone(), tx).is_some() {
            tracing::warn!(request = %id, "request id reused, previous waiter dropped");
        }
        PendingResponse { id, rx }
    }

    /// Settles the entry for `id`. Returns false for unknown ids.
    pub fn settle_with(&self, id: &RequestId, outcome: MessagingResult<Value>) -> bool {
        let Some(tx) = self.pending.lock().remove(id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(request = %id, "response arrived after the caller stopped waiting");
        }
        true
    }

    /// Settles from a wire response; unknown ids are logged and ignored.
    pub fn settle(&self, response: Response) -> bool {
        let outcome = match response.outcome {
            ResponseOutcome::Resolve(value) => Ok(value),
            ResponseOutcome::Reject(error) => Err(MessagingError::Remote(error)),
        };
        let known = self.settle_with(&response.id, outcome);
        if !known {
            tracing::warn!(request = %response.id, "unknown response received");
        }
        known
    }

    /// Rejects every outstanding request with `error`.
    pub fn reject_all(&self, error: &MessagingError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True if nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// A synchronous request handler.
pub type Handler<C> = Arc<dyn Fn(&C, Value) -> Result<Value, HandlerError> + Send + Sync>;

/// Request handlers keyed by request type.
///
/// `C` is whatever the receiving side knows about the requester, e.g. the
/// id of the channel a request arrived on.
pub struct HandlerRegistry<C> {
    handlers: RwLock<HashMap<String, Handler<C>>>,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> HandlerRegistry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `request_type`, replacing any previous one.
    pub fn register(
        &self,
        request_type: &str,
        handler: impl Fn(&C, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    ) {
        self.handlers.write().insert(request_type.to_string(), Arc::new(handler));
    }

    /// Removes the handler for `request_type`.
    pub fn unregister(&self, request_type: &str) -> bool {
        self.handlers.write().remove(request_type).is_some()
    }

    /// True if a handler exists for `request_type`.
    #[must_use]
    pub fn handles(&self, request_type: &str) -> bool {
        self.handlers.read().contains_key(request_type)
    }

    /// Runs the handler for `request` and builds the reply.
    pub fn dispatch(&self, context: &C, request: Request) -> Response {
        let handler = self.handlers.read().get(&request.request_type).cloned();
        let Some(handler) = handler else {
            tracing::debug!(request = %request.id, kind = %request.request_type, "unhandled request");
            return Response::reject(request.id, ErrorPayload::new(UNHANDLED_REQUEST));
        };
        match handler(context, request.payload) {
            Ok(value) => Response::resolve(request.id, value),
            Err(error) => {
                tracing::debug!(request = %request.id, kind = %request.request_type, %error, "request handler failed");
                Response::reject(request.id, error.into())
            }
        }
    }
}

impl<C> std::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}
