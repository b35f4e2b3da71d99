//! Trust ping
//!
//! Liveness check over an established channel. A ping with
//! `response_requested` set expects a `ping_response` threaded back to it.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::thread::Thread;
use super::{build_type, ProtocolVersion, FAMILY_TRUST_PING};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub response_requested: bool,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "~thread")]
    pub thread: Thread,
}

impl Ping {
    pub fn new(protocol: ProtocolVersion, comment: Option<String>) -> Self {
        Ping {
            msg_type: build_type(protocol, FAMILY_TRUST_PING, "ping"),
            id: Ulid::new().to_string(),
            comment,
            response_requested: true,
            thread: None,
        }
    }

    /// Ping sent inside an existing thread, used to close the handshake
    /// from the invitee side in place of an explicit ack.
    pub fn in_thread(protocol: ProtocolVersion, thread_id: &str) -> Self {
        Ping {
            thread: Some(Thread::new().set_thid(thread_id)),
            ..Self::new(protocol, None)
        }
    }
}

impl PingResponse {
    pub fn reply_to(protocol: ProtocolVersion, ping: &Ping) -> Self {
        // Thread back to the ping's own thread if it had one, else its id
        let thid = ping
            .thread
            .as_ref()
            .and_then(|t| t.thid.clone())
            .unwrap_or_else(|| ping.id.clone());
        PingResponse {
            msg_type: build_type(protocol, FAMILY_TRUST_PING, "ping_response"),
            id: Ulid::new().to_string(),
            comment: None,
            thread: Thread::new().set_thid(thid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_defaults() {
        let ping = Ping::new(ProtocolVersion::V2, Some("hello".to_string()));
        assert_eq!(ping.msg_type, "https://didcomm.org/trust_ping/1.0/ping");
        assert!(ping.response_requested);
        assert!(ping.thread.is_none());
    }

    #[test]
    fn test_response_requested_absent_means_false() {
        let json = r#"{"@type":"https://didcomm.org/trust_ping/1.0/ping","@id":"p1"}"#;
        let ping: Ping = serde_json::from_str(json).unwrap();
        assert!(!ping.response_requested);
    }

    #[test]
    fn test_reply_threads_to_ping() {
        let ping = Ping::new(ProtocolVersion::V2, None);
        let pong = PingResponse::reply_to(ProtocolVersion::V2, &ping);
        assert!(pong.thread.is_reply(&ping.id));

        let threaded = Ping::in_thread(ProtocolVersion::V2, "hs-thread");
        let pong = PingResponse::reply_to(ProtocolVersion::V2, &threaded);
        assert!(pong.thread.is_reply("hs-thread"));
    }
}
