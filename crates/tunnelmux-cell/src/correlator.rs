//! Request correlator for control messages
//!
//! A caller that sends a control request registers its request id first,
//! then waits on the returned receiver. The tunnel reader hands every frame
//! it does not handle itself to [`RequestCorrelator::dispatch`], which
//! delivers it to the waiter with the same id.
//!
//! Each response goes to at most one waiter. A waiter that times out
//! removes its entry, so a response arriving later finds nothing and is
//! dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use tunnelmux_common::{Error, Result};
use tunnelmux_proto::Message;

/// Error dispatching a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No pending request with this id
    NoPendingRequest,
    /// Waiter gave up before the response arrived
    ReceiverDropped,
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NoPendingRequest => write!(f, "no pending request with this ID"),
            DispatchError::ReceiverDropped => write!(f, "receiver dropped"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Routes response frames to the callers waiting for them
#[derive(Default)]
pub struct RequestCorrelator {
    pending: DashMap<u32, oneshot::Sender<Message>>,
    closed: AtomicBool,
}

impl RequestCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request id before sending the request
    ///
    /// Fails with `Shutdown` once [`cancel_all`](Self::cancel_all) has run.
    pub fn register(&self, request_id: u32) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        // cancel_all may have drained the map between the check and the insert
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&request_id);
            return Err(Error::shutdown("request correlator"));
        }
        debug!(request_id, "Registered pending request");
        Ok(rx)
    }

    /// Deliver a response to its waiter
    pub fn dispatch(&self, response: Message) -> std::result::Result<(), DispatchError> {
        let request_id = response.id();
        match self.pending.remove(&request_id) {
            Some((_, tx)) => {
                debug!(request_id, code = %response.code(), "Dispatching response");
                tx.send(response).map_err(|_| DispatchError::ReceiverDropped)
            }
            None => {
                debug!(request_id, code = %response.code(), "No pending request for response");
                Err(DispatchError::NoPendingRequest)
            }
        }
    }

    /// Drop a pending request; its waiter observes a closed channel
    ///
    /// Returns true if a request was found.
    pub fn cancel(&self, request_id: u32) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Fail every pending request and refuse new ones
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(count, "Cancelled all pending requests");
        }
    }

    /// Number of pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Wait for the response to `request_id`
    ///
    /// On timeout the entry is removed and `Timeout` is returned. If the
    /// correlator is shut down while waiting, `Shutdown` is returned.
    pub async fn wait(
        &self,
        request_id: u32,
        rx: oneshot::Receiver<Message>,
        timeout: Duration,
        context: &str,
    ) -> Result<Message> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::shutdown(context)),
            Err(_) => {
                self.cancel(request_id);
                Err(Error::timeout(context))
            }
        }
    }
}
