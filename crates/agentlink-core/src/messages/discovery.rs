//! Feature discovery
//!
//! Query/disclose pair for asking a peer which protocol families it speaks.
//! Queries support a trailing `*` wildcard, so `*` lists everything and
//! `https://didcomm.org/trust_ping/*` narrows to one family.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::thread::Thread;
use super::{
    build_type, ProtocolVersion, FAMILY_CONNECTIONS, FAMILY_DISCOVERY, FAMILY_NOTIFICATION,
    FAMILY_TRUST_PING,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disclose {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub protocols: Vec<ProtocolDescriptor>,
    #[serde(rename = "~thread")]
    pub thread: Thread,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub pid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

/// Protocol families this crate implements, as disclosable pids.
pub fn supported_protocols(protocol: ProtocolVersion) -> Vec<ProtocolDescriptor> {
    [
        FAMILY_CONNECTIONS,
        FAMILY_TRUST_PING,
        FAMILY_NOTIFICATION,
        FAMILY_DISCOVERY,
    ]
    .iter()
    .map(|family| ProtocolDescriptor {
        pid: format!("{}/{}/1.0", protocol.prefix(), family),
        roles: None,
    })
    .collect()
}

fn matches(pid: &str, query: &str) -> bool {
    match query.strip_suffix('*') {
        Some(prefix) => pid.starts_with(prefix),
        None => pid == query,
    }
}

impl Query {
    pub fn new(protocol: ProtocolVersion, query: &str, comment: Option<String>) -> Self {
        Query {
            msg_type: build_type(protocol, FAMILY_DISCOVERY, "query"),
            id: Ulid::new().to_string(),
            query: query.to_string(),
            comment,
        }
    }
}

impl Disclose {
    /// Build the disclosure answering `query`, threaded back to it.
    pub fn answering(protocol: ProtocolVersion, query: &Query) -> Self {
        let protocols = supported_protocols(protocol)
            .into_iter()
            .filter(|p| matches(&p.pid, &query.query))
            .collect();
        Disclose {
            msg_type: build_type(protocol, FAMILY_DISCOVERY, "disclose"),
            id: Ulid::new().to_string(),
            protocols,
            thread: Thread::new().set_thid(&query.id),
        }
    }
}
