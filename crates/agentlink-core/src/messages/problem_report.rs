//! Problem report
//!
//! Tells the peer the handshake failed on this side. Receiving one before
//! the channel is established fails the connection.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::thread::Thread;
use super::{build_type, ProtocolVersion, FAMILY_CONNECTIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemCode {
    RequestNotAccepted,
    RequestProcessingError,
    ResponseNotAccepted,
    ResponseProcessingError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReport {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_code: Option<ProblemCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
    #[serde(rename = "~thread")]
    pub thread: Thread,
}

impl ProblemReport {
    pub fn new(
        protocol: ProtocolVersion,
        code: ProblemCode,
        explain: &str,
        thread_id: &str,
    ) -> Self {
        ProblemReport {
            msg_type: build_type(protocol, FAMILY_CONNECTIONS, "problem_report"),
            id: Ulid::new().to_string(),
            problem_code: Some(code),
            explain: Some(explain.to_string()),
            thread: Thread::new().set_thid(thread_id),
        }
    }
}
