//! Acknowledgement
//!
//! Sent by the invitee after verifying the signed response; receiving it
//! moves the inviter to the established state.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::thread::Thread;
use super::{build_type, ProtocolVersion, FAMILY_NOTIFICATION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "PENDING")]
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub status: AckStatus,
    #[serde(rename = "~thread")]
    pub thread: Thread,
}

impl Ack {
    pub fn new(protocol: ProtocolVersion, status: AckStatus, thread_id: &str) -> Self {
        Ack {
            msg_type: build_type(protocol, FAMILY_NOTIFICATION, "ack"),
            id: Ulid::new().to_string(),
            status,
            thread: Thread::new().set_thid(thread_id),
        }
    }
}
