//! Persisted connection record
//!
//! A connection serializes to a version-tagged JSON envelope:
//!
//! ```json
//! { "version": "1.0", "state": 4, "data": { ... } }
//! ```
//!
//! `state` is the integer code from [`ConnectionState`]; `data` carries
//! everything needed to rebuild the state machine after a restart.
//! Serialization is deterministic, so the same logical state always
//! produces the same bytes. Runtime-only bookkeeping (last ping seen,
//! last disclosure) deliberately stays out of the record.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};
use crate::messages::{Invitation, ProtocolVersion};

use super::sm::{
    CompleteState, ConnectionSm, ConnectionState, InviteeState, InviterState, LocalIdentity,
    RemoteIdentity, Role, Sm,
};

pub const RECORD_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub source_id: String,
    pub pw_did: String,
    pub pw_verkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_pw_did: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_pw_verkey: Option<String>,
    pub endpoint: String,
    pub protocol_version: ProtocolVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitation: Option<Invitation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum ConnectionRecord {
    #[serde(rename = "1.0")]
    V1 { state: u32, data: RecordData },
}

fn missing(what: &str) -> LinkError {
    LinkError::InvalidSerializedState(format!("record is missing {}", what))
}

impl ConnectionRecord {
    pub fn to_json(&self) -> LinkResult<String> {
        serde_json::to_string(self)
            .map_err(|e| LinkError::Serialization(format!("record encode failed: {}", e)))
    }

    pub fn from_json(json: &str) -> LinkResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| LinkError::InvalidSerializedState(format!("not a connection record: {}", e)))
    }

    pub fn state_code(&self) -> u32 {
        match self {
            ConnectionRecord::V1 { state, .. } => *state,
        }
    }

    pub fn data(&self) -> &RecordData {
        match self {
            ConnectionRecord::V1 { data, .. } => data,
        }
    }

    /// Capture the current state machine as a persistable record.
    pub(crate) fn snapshot(sm: &ConnectionSm) -> LinkResult<Self> {
        let role = sm
            .role()
            .ok_or_else(|| LinkError::InvalidHandle("connection deleted".to_string()))?;
        let remote = sm.remote();
        let data = RecordData {
            source_id: sm.source_id.clone(),
            pw_did: sm.local.did.clone(),
            pw_verkey: sm.local.verkey.clone(),
            their_pw_did: remote.map(|r| r.did.clone()),
            their_pw_verkey: remote.map(|r| r.verkey.clone()),
            endpoint: sm.local.endpoint.clone(),
            protocol_version: sm.local.protocol,
            their_endpoint: remote.map(|r| r.endpoint.clone()),
            thread_id: sm.thread_id().map(str::to_string),
            role,
            invitation: sm.invitation().cloned(),
            failed_reason: sm.failed_reason().map(str::to_string),
            label: sm.local.label.clone(),
            routing_keys: sm.local.routing_keys.clone(),
        };
        Ok(ConnectionRecord::V1 {
            state: sm.state().code(),
            data,
        })
    }

    /// Rebuild the state machine this record captured.
    ///
    /// A restored inviter in `Requested` owes the peer its response again
    /// and a restored invitee in `Responded` owes its ack; both are
    /// delivered by the next `update_state`, which keeps a handshake
    /// interrupted by a crash moving.
    pub(crate) fn restore(self) -> LinkResult<ConnectionSm> {
        let ConnectionRecord::V1 { state, data } = self;
        let code = ConnectionState::from_code(state)
            .ok_or_else(|| LinkError::InvalidSerializedState(format!("unknown state code {}", state)))?;

        if data.source_id.is_empty() {
            return Err(missing("source_id"));
        }
        if data.pw_did.is_empty() || data.pw_verkey.is_empty() {
            return Err(missing("pairwise identity"));
        }

        let RecordData {
            source_id,
            pw_did,
            pw_verkey,
            their_pw_did,
            their_pw_verkey,
            endpoint,
            protocol_version,
            their_endpoint,
            thread_id,
            role,
            invitation,
            failed_reason,
            label,
            routing_keys,
        } = data;

        let local = LocalIdentity {
            did: pw_did,
            verkey: pw_verkey,
            endpoint,
            label,
            routing_keys,
            protocol: protocol_version,
        };

        let remote = match (their_pw_did, their_pw_verkey, their_endpoint) {
            (Some(did), Some(verkey), Some(endpoint)) => {
                Some(RemoteIdentity { did, verkey, endpoint })
            }
            (None, None, None) => None,
            _ => {
                return Err(LinkError::InvalidSerializedState(
                    "peer identity fields must be present together".to_string(),
                ))
            }
        };

        let state = match (role, code) {
            (_, ConnectionState::None) => {
                return Err(LinkError::InvalidSerializedState(
                    "state code 0 is not restorable".to_string(),
                ))
            }
            (Role::Inviter, ConnectionState::Initialized) => {
                Sm::Inviter(InviterState::Initialized { invitation })
            }
            (Role::Inviter, ConnectionState::Requested) => Sm::Inviter(InviterState::Requested {
                remote: remote.ok_or_else(|| missing("peer identity"))?,
                thread_id: thread_id.ok_or_else(|| missing("thread id"))?,
                response_sent: false,
            }),
            (Role::Inviter, ConnectionState::Responded) => {
                return Err(LinkError::InvalidSerializedState(
                    "inviter records never occupy the Responded state".to_string(),
                ))
            }
            (Role::Inviter, ConnectionState::Established) => {
                Sm::Inviter(InviterState::Established(CompleteState {
                    remote: remote.ok_or_else(|| missing("peer identity"))?,
                    thread_id: thread_id.ok_or_else(|| missing("thread id"))?,
                    last_seen: None,
                    last_disclose: None,
                }))
            }
            (Role::Inviter, ConnectionState::Error) => Sm::Inviter(InviterState::Failed {
                reason: failed_reason.ok_or_else(|| missing("failure reason"))?,
            }),
            (Role::Invitee, ConnectionState::Initialized) => {
                Sm::Invitee(InviteeState::Initialized {
                    invitation: invitation.ok_or_else(|| missing("invitation"))?,
                })
            }
            (Role::Invitee, ConnectionState::Requested) => Sm::Invitee(InviteeState::Requested {
                invitation: invitation.ok_or_else(|| missing("invitation"))?,
                thread_id: thread_id.ok_or_else(|| missing("thread id"))?,
            }),
            (Role::Invitee, ConnectionState::Responded) => Sm::Invitee(InviteeState::Responded {
                remote: remote.ok_or_else(|| missing("peer identity"))?,
                thread_id: thread_id.ok_or_else(|| missing("thread id"))?,
            }),
            (Role::Invitee, ConnectionState::Established) => {
                Sm::Invitee(InviteeState::Established(CompleteState {
                    remote: remote.ok_or_else(|| missing("peer identity"))?,
                    thread_id: thread_id.ok_or_else(|| missing("thread id"))?,
                    last_seen: None,
                    last_disclose: None,
                }))
            }
            (Role::Invitee, ConnectionState::Error) => Sm::Invitee(InviteeState::Failed {
                reason: failed_reason.ok_or_else(|| missing("failure reason"))?,
            }),
        };

        Ok(ConnectionSm {
            source_id,
            local,
            state,
        })
    }
}
