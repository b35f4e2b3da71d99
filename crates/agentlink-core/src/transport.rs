//! Message transport abstraction
//!
//! Connections hand outbound messages to a [`MessageTransport`] and pull
//! inbound ones from it during [`update_state`](crate::Connection::update_state).
//! The core never opens sockets itself, so the same state machine runs over
//! HTTP, a relay, or the bundled [`MemoryTransport`] used in tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LinkError, LinkResult};

/// Capability interface for message delivery and pickup.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver a serialized message to a peer endpoint.
    ///
    /// A failure here must leave the caller free to retry; the connection
    /// state machine treats `Err(DeliveryFailed)` as transient.
    async fn send(&self, endpoint: &str, message: &str) -> LinkResult<()>;

    /// Fetch the next message queued for a pairwise DID, if any.
    ///
    /// Messages are returned oldest first, one per call.
    async fn poll(&self, pairwise_did: &str) -> LinkResult<Option<String>>;
}

/// In-process transport with per-endpoint FIFO mailboxes.
///
/// Both parties of a test handshake share one instance. Each connection
/// binds its pairwise DID to its own endpoint with [`attach`](Self::attach)
/// so `poll` knows which mailbox to drain.
#[derive(Default)]
pub struct MemoryTransport {
    mailboxes: Mutex<HashMap<String, VecDeque<String>>>,
    routes: Mutex<HashMap<String, String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a pairwise DID to an endpoint and create its mailbox.
    ///
    /// Sends to an endpoint fail until some DID has been attached to it.
    pub fn attach(&self, pairwise_did: &str, endpoint: &str) {
        self.mailboxes
            .lock()
            .entry(endpoint.to_string())
            .or_default();
        self.routes
            .lock()
            .insert(pairwise_did.to_string(), endpoint.to_string());
        debug!(did = %pairwise_did, endpoint = %endpoint, "Attached mailbox route");
    }

    /// Number of undelivered messages queued at an endpoint.
    pub fn pending(&self, endpoint: &str) -> usize {
        self.mailboxes
            .lock()
            .get(endpoint)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("endpoints", &self.mailboxes.lock().len())
            .field("routes", &self.routes.lock().len())
            .finish()
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn send(&self, endpoint: &str, message: &str) -> LinkResult<()> {
        let mut mailboxes = self.mailboxes.lock();
        let queue = mailboxes.get_mut(endpoint).ok_or_else(|| {
            LinkError::DeliveryFailed(format!("no mailbox bound to endpoint {}", endpoint))
        })?;
        queue.push_back(message.to_string());
        debug!(endpoint = %endpoint, queued = queue.len(), "Queued message");
        Ok(())
    }

    async fn poll(&self, pairwise_did: &str) -> LinkResult<Option<String>> {
        let endpoint = match self.routes.lock().get(pairwise_did) {
            Some(ep) => ep.clone(),
            None => return Ok(None),
        };
        let message = self
            .mailboxes
            .lock()
            .get_mut(&endpoint)
            .and_then(|q| q.pop_front());
        if message.is_some() {
            debug!(did = %pairwise_did, endpoint = %endpoint, "Delivered queued message");
        }
        Ok(message)
    }
}
