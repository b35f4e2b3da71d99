//! Connection request
//!
//! First message over the channel, sent by the invitee to the invitation's
//! service endpoint. Introduces the invitee's pairwise identity; its `@id`
//! becomes the thread id for the rest of the handshake.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::did_doc::DidDoc;
use super::thread::Thread;
use super::{build_type, ProtocolVersion, FAMILY_CONNECTIONS};

/// Pairwise identity block shared by requests and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionData {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDoc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub label: String,
    pub connection: ConnectionData,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl ConnectionRequest {
    pub fn new(
        protocol: ProtocolVersion,
        label: &str,
        did: &str,
        did_doc: DidDoc,
        invitation_id: &str,
    ) -> Self {
        ConnectionRequest {
            msg_type: build_type(protocol, FAMILY_CONNECTIONS, "request"),
            id: Ulid::new().to_string(),
            label: label.to_string(),
            connection: ConnectionData {
                did: did.to_string(),
                did_doc,
            },
            thread: Some(Thread::new().set_pthid(invitation_id)),
        }
    }

    /// Thread id the rest of the handshake replies to.
    pub fn thread_id(&self) -> String {
        self.thread
            .as_ref()
            .and_then(|t| t.thid.clone())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionRequest {
        let doc = DidDoc::new("BobDid", "BobVerkey", "memory://bob", &[]);
        ConnectionRequest::new(ProtocolVersion::V2, "bob", "BobDid", doc, "inv-1")
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["@type"], "https://didcomm.org/connections/1.0/request");
        assert_eq!(json["connection"]["DID"], "BobDid");
        assert!(json["connection"]["DIDDoc"]["service"].is_array());
        assert_eq!(json["~thread"]["pthid"], "inv-1");
    }

    #[test]
    fn test_thread_id_defaults_to_message_id() {
        let request = sample();
        // No explicit thid on a fresh request
        assert_eq!(request.thread_id(), request.id);

        let mut threaded = sample();
        threaded.thread = Some(Thread::new().set_thid("outer"));
        assert_eq!(threaded.thread_id(), "outer");
    }
}
