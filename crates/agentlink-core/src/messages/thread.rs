//! Threading decorator
//!
//! Replies carry a `~thread` block pointing back at the message that opened
//! the exchange. The handshake thread is keyed by the connection request id;
//! pings open their own short-lived threads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    /// Id of the message that started the thread
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    /// Parent thread, set when one exchange spawns another
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
    #[serde(default)]
    pub sender_order: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub received_orders: HashMap<String, u32>,
}

impl Thread {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_thid(mut self, thid: impl Into<String>) -> Self {
        self.thid = Some(thid.into());
        self
    }

    pub fn set_pthid(mut self, pthid: impl Into<String>) -> Self {
        self.pthid = Some(pthid.into());
        self
    }

    /// True when this thread is a reply to the message with the given id.
    pub fn is_reply(&self, id: &str) -> bool {
        self.thid.as_deref() == Some(id)
    }

    /// Record one more message seen from the sender identified by `did`.
    pub fn increment_received_order(&mut self, did: &str) {
        *self.received_orders.entry(did.to_string()).or_insert(0) += 1;
    }
}
