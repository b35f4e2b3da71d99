//! Handshake state machine
//!
//! One [`ConnectionSm`] per pairwise relationship, parameterized by role.
//! Every inbound message funnels through [`ConnectionSm::step`], the single
//! transition function: it decides the next state, builds any outbound
//! message the protocol calls for, and hands it to the transport. Replays
//! of already-processed handshake messages are tolerated; messages that
//! arrive out of order fail the record.
//!
//! Delivery failures for messages the protocol owes the peer (the signed
//! response, the closing ack) advance the state anyway and are retried by
//! [`ConnectionSm::flush_pending`]; the peer identity is never left half
//! recorded.

use std::mem;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LinkError, LinkResult};
use crate::keys::KeyAgent;
use crate::messages::{
    Ack, AckStatus, ConnectionData, ConnectionRequest, DidDoc, Disclose, Envelope, Invitation,
    PingResponse, ProblemCode, ProblemReport, ProtocolVersion, Response,
};
use crate::transport::MessageTransport;

/// Externally visible lifecycle phase.
///
/// Serialized as an integer code; the codes are part of the persisted
/// record format and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live record behind the handle (deleted or never created)
    None,
    /// Local identity generated, handshake not yet underway
    Initialized,
    /// Request sent (invitee) or received and answered (inviter)
    Requested,
    /// Response verified, closing ack still owed to the peer (invitee only)
    Responded,
    /// Handshake complete; signing and liveness are now valid
    Established,
    /// Terminal failure; only deletion remains
    Error,
}

impl ConnectionState {
    pub fn code(self) -> u32 {
        match self {
            ConnectionState::None => 0,
            ConnectionState::Initialized => 1,
            ConnectionState::Requested => 2,
            ConnectionState::Responded => 3,
            ConnectionState::Established => 4,
            ConnectionState::Error => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ConnectionState::None),
            1 => Some(ConnectionState::Initialized),
            2 => Some(ConnectionState::Requested),
            3 => Some(ConnectionState::Responded),
            4 => Some(ConnectionState::Established),
            5 => Some(ConnectionState::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::None => "None",
            ConnectionState::Initialized => "Initialized",
            ConnectionState::Requested => "Requested",
            ConnectionState::Responded => "Responded",
            ConnectionState::Established => "Established",
            ConnectionState::Error => "Error",
        };
        write!(f, "{}", name)
    }
}

/// Which side of the handshake this record plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Inviter,
    Invitee,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Inviter => write!(f, "inviter"),
            Role::Invitee => write!(f, "invitee"),
        }
    }
}

/// This agent's identity and channel parameters, fixed at creation.
#[derive(Debug, Clone)]
pub(crate) struct LocalIdentity {
    pub did: String,
    pub verkey: String,
    pub endpoint: String,
    pub label: String,
    pub routing_keys: Vec<String>,
    pub protocol: ProtocolVersion,
}

impl LocalIdentity {
    fn did_doc(&self) -> DidDoc {
        DidDoc::new(&self.did, &self.verkey, &self.endpoint, &self.routing_keys)
    }
}

/// Peer identity, recorded atomically when the handshake exchanges it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RemoteIdentity {
    pub did: String,
    pub verkey: String,
    pub endpoint: String,
}

impl RemoteIdentity {
    pub(crate) fn from_connection_data(connection: &ConnectionData) -> LinkResult<Self> {
        connection.did_doc.validate()?;
        if connection.did.is_empty() {
            return Err(LinkError::Identity(
                "connection block has an empty DID".to_string(),
            ));
        }
        let verkey = connection.did_doc.first_recipient_key()?;
        let endpoint = connection
            .did_doc
            .endpoint()
            .ok_or_else(|| LinkError::Identity("DID document has no service".to_string()))?;
        Ok(RemoteIdentity {
            did: connection.did.clone(),
            verkey,
            endpoint,
        })
    }
}

/// Post-handshake channel bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct CompleteState {
    pub remote: RemoteIdentity,
    pub thread_id: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_disclose: Option<Disclose>,
}

impl CompleteState {
    fn new(remote: RemoteIdentity, thread_id: String) -> Self {
        CompleteState {
            remote,
            thread_id,
            last_seen: None,
            last_disclose: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum InviterState {
    Initialized {
        invitation: Option<Invitation>,
    },
    Requested {
        remote: RemoteIdentity,
        thread_id: String,
        /// False while the signed response still awaits (re)delivery
        response_sent: bool,
    },
    Established(CompleteState),
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum InviteeState {
    Initialized {
        invitation: Invitation,
    },
    Requested {
        invitation: Invitation,
        thread_id: String,
    },
    Responded {
        remote: RemoteIdentity,
        thread_id: String,
    },
    Established(CompleteState),
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Sm {
    Inviter(InviterState),
    Invitee(InviteeState),
    /// Sentinel left behind by delete(); every operation fails on it
    Deleted,
}

pub(crate) struct ConnectionSm {
    pub(crate) source_id: String,
    pub(crate) local: LocalIdentity,
    pub(crate) state: Sm,
}

async fn send_json<T: Serialize>(
    transport: &dyn MessageTransport,
    endpoint: &str,
    message: &T,
) -> LinkResult<()> {
    let raw = crate::messages::encode(message)?;
    transport.send(endpoint, &raw).await
}

impl ConnectionSm {
    pub(crate) fn new_inviter(source_id: String, local: LocalIdentity) -> Self {
        ConnectionSm {
            source_id,
            local,
            state: Sm::Inviter(InviterState::Initialized { invitation: None }),
        }
    }

    pub(crate) fn new_invitee(source_id: String, local: LocalIdentity, invitation: Invitation) -> Self {
        ConnectionSm {
            source_id,
            local,
            state: Sm::Invitee(InviteeState::Initialized { invitation }),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match &self.state {
            Sm::Inviter(state) => match state {
                InviterState::Initialized { .. } => ConnectionState::Initialized,
                InviterState::Requested { .. } => ConnectionState::Requested,
                InviterState::Established(_) => ConnectionState::Established,
                InviterState::Failed { .. } => ConnectionState::Error,
            },
            Sm::Invitee(state) => match state {
                InviteeState::Initialized { .. } => ConnectionState::Initialized,
                InviteeState::Requested { .. } => ConnectionState::Requested,
                InviteeState::Responded { .. } => ConnectionState::Responded,
                InviteeState::Established(_) => ConnectionState::Established,
                InviteeState::Failed { .. } => ConnectionState::Error,
            },
            Sm::Deleted => ConnectionState::None,
        }
    }

    pub(crate) fn role(&self) -> Option<Role> {
        match &self.state {
            Sm::Inviter(_) => Some(Role::Inviter),
            Sm::Invitee(_) => Some(Role::Invitee),
            Sm::Deleted => None,
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        matches!(self.state, Sm::Deleted)
    }

    pub(crate) fn remote(&self) -> Option<&RemoteIdentity> {
        match &self.state {
            Sm::Inviter(InviterState::Requested { remote, .. })
            | Sm::Invitee(InviteeState::Responded { remote, .. }) => Some(remote),
            Sm::Inviter(InviterState::Established(c))
            | Sm::Invitee(InviteeState::Established(c)) => Some(&c.remote),
            _ => None,
        }
    }

    pub(crate) fn invitation(&self) -> Option<&Invitation> {
        match &self.state {
            Sm::Inviter(InviterState::Initialized { invitation }) => invitation.as_ref(),
            Sm::Invitee(InviteeState::Initialized { invitation })
            | Sm::Invitee(InviteeState::Requested { invitation, .. }) => Some(invitation),
            _ => None,
        }
    }

    pub(crate) fn thread_id(&self) -> Option<&str> {
        match &self.state {
            Sm::Inviter(InviterState::Requested { thread_id, .. })
            | Sm::Invitee(InviteeState::Requested { thread_id, .. })
            | Sm::Invitee(InviteeState::Responded { thread_id, .. }) => Some(thread_id),
            Sm::Inviter(InviterState::Established(c))
            | Sm::Invitee(InviteeState::Established(c)) => Some(&c.thread_id),
            _ => None,
        }
    }

    pub(crate) fn failed_reason(&self) -> Option<&str> {
        match &self.state {
            Sm::Inviter(InviterState::Failed { reason })
            | Sm::Invitee(InviteeState::Failed { reason }) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn last_seen(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            Sm::Inviter(InviterState::Established(c))
            | Sm::Invitee(InviteeState::Established(c)) => c.last_seen,
            _ => None,
        }
    }

    pub(crate) fn last_disclose(&self) -> Option<&Disclose> {
        match &self.state {
            Sm::Inviter(InviterState::Established(c))
            | Sm::Invitee(InviteeState::Established(c)) => c.last_disclose.as_ref(),
            _ => None,
        }
    }

    /// True while the record is still negotiating (pre-established, not failed).
    pub(crate) fn in_handshake(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Initialized | ConnectionState::Requested | ConnectionState::Responded
        )
    }

    /// Message kind the protocol expects next, for error context.
    pub(crate) fn expected_kind(&self) -> &'static str {
        match &self.state {
            Sm::Inviter(InviterState::Initialized { .. }) => "request",
            Sm::Inviter(InviterState::Requested { .. }) => "ack",
            Sm::Invitee(InviteeState::Initialized { .. }) => "none",
            Sm::Invitee(InviteeState::Requested { .. }) => "response",
            Sm::Invitee(InviteeState::Responded { .. }) => "none",
            _ => "any",
        }
    }

    /// Move the record to its terminal failure state.
    pub(crate) fn fail(&mut self, reason: &str) {
        let next = match &self.state {
            Sm::Inviter(_) => Sm::Inviter(InviterState::Failed {
                reason: reason.to_string(),
            }),
            Sm::Invitee(_) => Sm::Invitee(InviteeState::Failed {
                reason: reason.to_string(),
            }),
            Sm::Deleted => Sm::Deleted,
        };
        self.state = next;
    }

    pub(crate) fn delete(&mut self) {
        self.state = Sm::Deleted;
    }

    /// Start the handshake.
    ///
    /// Inviter: generate (or return the already generated) invitation.
    /// Invitee: send the connection request to the invitation's endpoint.
    /// A delivery failure leaves the state untouched so the call can be
    /// retried.
    pub(crate) async fn connect(
        &mut self,
        transport: &dyn MessageTransport,
    ) -> LinkResult<Invitation> {
        enum Plan {
            Existing(Invitation),
            NewInvitation,
            SendRequest(Invitation),
        }

        let plan = match &self.state {
            Sm::Inviter(InviterState::Initialized { invitation: Some(inv) }) => {
                Plan::Existing(inv.clone())
            }
            Sm::Inviter(InviterState::Initialized { invitation: None }) => Plan::NewInvitation,
            Sm::Invitee(InviteeState::Initialized { invitation }) => {
                Plan::SendRequest(invitation.clone())
            }
            Sm::Deleted => {
                return Err(LinkError::InvalidHandle("connection deleted".to_string()))
            }
            _ => {
                return Err(LinkError::InvalidState(format!(
                    "connect is not valid in the {} state",
                    self.state()
                )))
            }
        };

        match plan {
            Plan::Existing(invitation) => Ok(invitation),
            Plan::NewInvitation => {
                let invitation = Invitation::new(
                    self.local.protocol,
                    &self.local.label,
                    &self.local.verkey,
                    &self.local.routing_keys,
                    &self.local.endpoint,
                );
                info!(
                    source_id = %self.source_id,
                    invitation_id = %invitation.id,
                    "Invitation generated"
                );
                self.state = Sm::Inviter(InviterState::Initialized {
                    invitation: Some(invitation.clone()),
                });
                Ok(invitation)
            }
            Plan::SendRequest(invitation) => {
                let request = ConnectionRequest::new(
                    self.local.protocol,
                    &self.local.label,
                    &self.local.did,
                    self.local.did_doc(),
                    &invitation.id,
                );
                let thread_id = request.thread_id();
                send_json(transport, &invitation.service_endpoint, &request).await?;
                info!(
                    source_id = %self.source_id,
                    thread_id = %thread_id,
                    "Connection request sent"
                );
                self.state = Sm::Invitee(InviteeState::Requested {
                    invitation: invitation.clone(),
                    thread_id,
                });
                Ok(invitation)
            }
        }
    }

    /// Re-deliver whatever outbound message a past transition still owes the
    /// peer, completing the transition it belongs to on success.
    pub(crate) async fn flush_pending(
        &mut self,
        agent: &dyn KeyAgent,
        transport: &dyn MessageTransport,
    ) -> LinkResult<()> {
        enum Pending {
            Response { endpoint: String, thread_id: String },
            Ack { endpoint: String, thread_id: String },
        }

        let pending = match &self.state {
            Sm::Inviter(InviterState::Requested {
                remote,
                thread_id,
                response_sent: false,
            }) => Some(Pending::Response {
                endpoint: remote.endpoint.clone(),
                thread_id: thread_id.clone(),
            }),
            Sm::Invitee(InviteeState::Responded { remote, thread_id }) => Some(Pending::Ack {
                endpoint: remote.endpoint.clone(),
                thread_id: thread_id.clone(),
            }),
            _ => None,
        };

        match pending {
            Some(Pending::Response { endpoint, thread_id }) => {
                let signed = self.build_signed_response(&thread_id, agent).await?;
                send_json(transport, &endpoint, &signed).await?;
                if let Sm::Inviter(InviterState::Requested { response_sent, .. }) = &mut self.state
                {
                    *response_sent = true;
                }
                debug!(source_id = %self.source_id, "Pending connection response delivered");
            }
            Some(Pending::Ack { endpoint, thread_id }) => {
                let ack = Ack::new(self.local.protocol, AckStatus::Ok, &thread_id);
                send_json(transport, &endpoint, &ack).await?;
                let state = mem::replace(&mut self.state, Sm::Deleted);
                self.state = match state {
                    Sm::Invitee(InviteeState::Responded { remote, thread_id }) => {
                        Sm::Invitee(InviteeState::Established(CompleteState::new(
                            remote, thread_id,
                        )))
                    }
                    other => other,
                };
                info!(source_id = %self.source_id, "Connection established");
            }
            None => {}
        }
        Ok(())
    }

    /// Apply one inbound message. The single source of truth for
    /// transitions; both the poll and push update paths land here.
    pub(crate) async fn step(
        &mut self,
        envelope: Envelope,
        agent: &dyn KeyAgent,
        transport: &dyn MessageTransport,
    ) -> LinkResult<ConnectionState> {
        let (next, outcome) = match self.state.clone() {
            Sm::Inviter(state) => {
                let (next, outcome) = self.inviter_step(state, envelope, agent, transport).await;
                (Sm::Inviter(next), outcome)
            }
            Sm::Invitee(state) => {
                let (next, outcome) = self.invitee_step(state, envelope, agent, transport).await;
                (Sm::Invitee(next), outcome)
            }
            Sm::Deleted => {
                return Err(LinkError::InvalidHandle("connection deleted".to_string()))
            }
        };
        self.state = next;
        outcome.map(|()| self.state())
    }

    async fn build_signed_response(
        &self,
        thread_id: &str,
        agent: &dyn KeyAgent,
    ) -> LinkResult<crate::messages::SignedResponse> {
        let response = Response::new(
            self.local.protocol,
            &self.local.did,
            self.local.did_doc(),
            thread_id,
        );
        response
            .sign(agent, &self.local.verkey, self.local.protocol)
            .await
    }

    async fn report_problem(
        &self,
        transport: &dyn MessageTransport,
        endpoint: &str,
        code: ProblemCode,
        explain: &str,
        thread_id: &str,
    ) {
        let report = ProblemReport::new(self.local.protocol, code, explain, thread_id);
        if let Err(e) = send_json(transport, endpoint, &report).await {
            debug!(source_id = %self.source_id, error = %e, "Problem report not delivered");
        }
    }

    fn unexpected(&self, expected: &str, envelope: &Envelope) -> LinkError {
        LinkError::UnexpectedMessage {
            expected: expected.to_string(),
            received: envelope.describe(),
        }
    }

    async fn inviter_step(
        &self,
        state: InviterState,
        envelope: Envelope,
        agent: &dyn KeyAgent,
        transport: &dyn MessageTransport,
    ) -> (InviterState, LinkResult<()>) {
        match state {
            InviterState::Initialized { invitation } => match envelope {
                Envelope::Request(request) => {
                    let thread_id = request.thread_id();
                    let reply_endpoint = request.connection.did_doc.endpoint();
                    match RemoteIdentity::from_connection_data(&request.connection) {
                        Ok(remote) => {
                            let signed = match self.build_signed_response(&thread_id, agent).await
                            {
                                Ok(signed) => signed,
                                Err(e) => {
                                    return (InviterState::Initialized { invitation }, Err(e))
                                }
                            };
                            match send_json(transport, &remote.endpoint, &signed).await {
                                Ok(()) => {
                                    info!(
                                        source_id = %self.source_id,
                                        their_did = %remote.did,
                                        "Connection request accepted, response sent"
                                    );
                                    (
                                        InviterState::Requested {
                                            remote,
                                            thread_id,
                                            response_sent: true,
                                        },
                                        Ok(()),
                                    )
                                }
                                Err(e) => {
                                    warn!(
                                        source_id = %self.source_id,
                                        error = %e,
                                        "Response delivery failed, will retry"
                                    );
                                    (
                                        InviterState::Requested {
                                            remote,
                                            thread_id,
                                            response_sent: false,
                                        },
                                        Err(e),
                                    )
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                source_id = %self.source_id,
                                error = %e,
                                "Rejecting connection request"
                            );
                            if let Some(endpoint) = reply_endpoint {
                                self.report_problem(
                                    transport,
                                    &endpoint,
                                    ProblemCode::RequestProcessingError,
                                    &e.to_string(),
                                    &thread_id,
                                )
                                .await;
                            }
                            (
                                InviterState::Failed {
                                    reason: e.to_string(),
                                },
                                Err(e),
                            )
                        }
                    }
                }
                Envelope::ProblemReport(report) => {
                    let reason = report
                        .explain
                        .unwrap_or_else(|| "peer reported a problem".to_string());
                    warn!(source_id = %self.source_id, reason = %reason, "Handshake failed by peer");
                    (InviterState::Failed { reason }, Ok(()))
                }
                other => {
                    let err = self.unexpected("request", &other);
                    warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                    (
                        InviterState::Failed {
                            reason: err.to_string(),
                        },
                        Err(err),
                    )
                }
            },

            InviterState::Requested {
                remote,
                thread_id,
                response_sent,
            } => match envelope {
                // Replay of the request we already accepted: answer again,
                // state unchanged
                Envelope::Request(request) if request.thread_id() == thread_id => {
                    debug!(
                        source_id = %self.source_id,
                        "Replayed connection request, re-sending response"
                    );
                    match self.build_signed_response(&thread_id, agent).await {
                        Ok(signed) => match send_json(transport, &remote.endpoint, &signed).await {
                            Ok(()) => (
                                InviterState::Requested {
                                    remote,
                                    thread_id,
                                    response_sent: true,
                                },
                                Ok(()),
                            ),
                            Err(e) => (
                                InviterState::Requested {
                                    remote,
                                    thread_id,
                                    response_sent: false,
                                },
                                Err(e),
                            ),
                        },
                        Err(e) => (
                            InviterState::Requested {
                                remote,
                                thread_id,
                                response_sent,
                            },
                            Err(e),
                        ),
                    }
                }
                Envelope::Ack(ack) => {
                    if ack.thread.is_reply(&thread_id) {
                        info!(
                            source_id = %self.source_id,
                            their_did = %remote.did,
                            "Connection established"
                        );
                        (
                            InviterState::Established(CompleteState::new(remote, thread_id)),
                            Ok(()),
                        )
                    } else {
                        debug!(source_id = %self.source_id, "Ack for a different thread ignored");
                        (
                            InviterState::Requested {
                                remote,
                                thread_id,
                                response_sent,
                            },
                            Ok(()),
                        )
                    }
                }
                // A ping proves the peer processed our response
                Envelope::Ping(ping) => {
                    let mut complete = CompleteState::new(remote, thread_id);
                    complete.last_seen = Some(Utc::now());
                    if ping.response_requested {
                        let pong = PingResponse::reply_to(self.local.protocol, &ping);
                        if let Err(e) =
                            send_json(transport, &complete.remote.endpoint, &pong).await
                        {
                            warn!(source_id = %self.source_id, error = %e, "Ping response delivery failed");
                        }
                    }
                    info!(source_id = %self.source_id, "Connection established");
                    (InviterState::Established(complete), Ok(()))
                }
                Envelope::ProblemReport(report) => {
                    let reason = report
                        .explain
                        .unwrap_or_else(|| "peer reported a problem".to_string());
                    warn!(source_id = %self.source_id, reason = %reason, "Handshake failed by peer");
                    (InviterState::Failed { reason }, Ok(()))
                }
                other => {
                    let err = self.unexpected("ack", &other);
                    warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                    (
                        InviterState::Failed {
                            reason: err.to_string(),
                        },
                        Err(err),
                    )
                }
            },

            InviterState::Established(complete) => {
                let (complete, outcome) = self.complete_step(complete, envelope, transport).await;
                (InviterState::Established(complete), outcome)
            }

            InviterState::Failed { reason } => {
                debug!(source_id = %self.source_id, "Message ignored on failed connection");
                (InviterState::Failed { reason }, Ok(()))
            }
        }
    }

    async fn invitee_step(
        &self,
        state: InviteeState,
        envelope: Envelope,
        agent: &dyn KeyAgent,
        transport: &dyn MessageTransport,
    ) -> (InviteeState, LinkResult<()>) {
        match state {
            InviteeState::Initialized { .. } => match envelope {
                Envelope::ProblemReport(report) => {
                    let reason = report
                        .explain
                        .unwrap_or_else(|| "peer reported a problem".to_string());
                    warn!(source_id = %self.source_id, reason = %reason, "Handshake failed by peer");
                    (InviteeState::Failed { reason }, Ok(()))
                }
                other => {
                    let err = self.unexpected("none", &other);
                    warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                    (
                        InviteeState::Failed {
                            reason: err.to_string(),
                        },
                        Err(err),
                    )
                }
            },

            InviteeState::Requested {
                invitation,
                thread_id,
            } => match envelope {
                Envelope::SignedResponse(signed) => {
                    if !signed.thread.is_reply(&thread_id) {
                        let err = LinkError::UnexpectedMessage {
                            expected: format!("response in thread {}", thread_id),
                            received: "response in a different thread".to_string(),
                        };
                        warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                        return (
                            InviteeState::Failed {
                                reason: err.to_string(),
                            },
                            Err(err),
                        );
                    }
                    let signer = match invitation.recipient_key() {
                        Ok(signer) => signer,
                        Err(e) => {
                            return (
                                InviteeState::Failed {
                                    reason: e.to_string(),
                                },
                                Err(e),
                            )
                        }
                    };
                    match signed.verify(agent, &signer).await {
                        Ok(connection) => {
                            match RemoteIdentity::from_connection_data(&connection) {
                                Ok(remote) => {
                                    let ack =
                                        Ack::new(self.local.protocol, AckStatus::Ok, &thread_id);
                                    match send_json(transport, &remote.endpoint, &ack).await {
                                        Ok(()) => {
                                            info!(
                                                source_id = %self.source_id,
                                                their_did = %remote.did,
                                                "Connection established"
                                            );
                                            (
                                                InviteeState::Established(CompleteState::new(
                                                    remote, thread_id,
                                                )),
                                                Ok(()),
                                            )
                                        }
                                        Err(e) => {
                                            warn!(
                                                source_id = %self.source_id,
                                                error = %e,
                                                "Ack delivery failed, will retry"
                                            );
                                            (
                                                InviteeState::Responded { remote, thread_id },
                                                Err(e),
                                            )
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        source_id = %self.source_id,
                                        error = %e,
                                        "Rejecting connection response"
                                    );
                                    self.report_problem(
                                        transport,
                                        &invitation.service_endpoint,
                                        ProblemCode::ResponseProcessingError,
                                        &e.to_string(),
                                        &thread_id,
                                    )
                                    .await;
                                    (
                                        InviteeState::Failed {
                                            reason: e.to_string(),
                                        },
                                        Err(e),
                                    )
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                source_id = %self.source_id,
                                error = %e,
                                "Response signature rejected"
                            );
                            self.report_problem(
                                transport,
                                &invitation.service_endpoint,
                                ProblemCode::ResponseProcessingError,
                                &e.to_string(),
                                &thread_id,
                            )
                            .await;
                            (
                                InviteeState::Failed {
                                    reason: e.to_string(),
                                },
                                Err(e),
                            )
                        }
                    }
                }
                Envelope::ProblemReport(report) => {
                    let reason = report
                        .explain
                        .unwrap_or_else(|| "peer reported a problem".to_string());
                    warn!(source_id = %self.source_id, reason = %reason, "Handshake failed by peer");
                    (InviteeState::Failed { reason }, Ok(()))
                }
                other => {
                    let err = self.unexpected("response", &other);
                    warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                    (
                        InviteeState::Failed {
                            reason: err.to_string(),
                        },
                        Err(err),
                    )
                }
            },

            InviteeState::Responded { remote, thread_id } => match envelope {
                // The response we already verified, delivered again
                Envelope::SignedResponse(signed) if signed.thread.is_reply(&thread_id) => {
                    debug!(source_id = %self.source_id, "Replayed response ignored");
                    (InviteeState::Responded { remote, thread_id }, Ok(()))
                }
                Envelope::ProblemReport(report) => {
                    let reason = report
                        .explain
                        .unwrap_or_else(|| "peer reported a problem".to_string());
                    warn!(source_id = %self.source_id, reason = %reason, "Handshake failed by peer");
                    (InviteeState::Failed { reason }, Ok(()))
                }
                other => {
                    let err = self.unexpected("none", &other);
                    warn!(source_id = %self.source_id, error = %err, "Handshake failed");
                    (
                        InviteeState::Failed {
                            reason: err.to_string(),
                        },
                        Err(err),
                    )
                }
            },

            InviteeState::Established(complete) => {
                let (complete, outcome) = self.complete_step(complete, envelope, transport).await;
                (InviteeState::Established(complete), outcome)
            }

            InviteeState::Failed { reason } => {
                debug!(source_id = %self.source_id, "Message ignored on failed connection");
                (InviteeState::Failed { reason }, Ok(()))
            }
        }
    }

    /// Established-channel handling, shared by both roles. Nothing here can
    /// fail the connection; unexpected traffic is logged and dropped.
    async fn complete_step(
        &self,
        mut complete: CompleteState,
        envelope: Envelope,
        transport: &dyn MessageTransport,
    ) -> (CompleteState, LinkResult<()>) {
        match envelope {
            Envelope::Ping(ping) => {
                complete.last_seen = Some(Utc::now());
                debug!(source_id = %self.source_id, "Ping received");
                if ping.response_requested {
                    let pong = PingResponse::reply_to(self.local.protocol, &ping);
                    if let Err(e) = send_json(transport, &complete.remote.endpoint, &pong).await {
                        warn!(source_id = %self.source_id, error = %e, "Ping response delivery failed");
                    }
                }
                (complete, Ok(()))
            }
            Envelope::PingResponse(_) => {
                complete.last_seen = Some(Utc::now());
                debug!(source_id = %self.source_id, "Ping response received");
                (complete, Ok(()))
            }
            Envelope::Query(query) => {
                let disclose = Disclose::answering(self.local.protocol, &query);
                debug!(
                    source_id = %self.source_id,
                    query = %query.query,
                    disclosed = disclose.protocols.len(),
                    "Feature query answered"
                );
                if let Err(e) = send_json(transport, &complete.remote.endpoint, &disclose).await {
                    warn!(source_id = %self.source_id, error = %e, "Disclose delivery failed");
                }
                (complete, Ok(()))
            }
            Envelope::Disclose(disclose) => {
                debug!(
                    source_id = %self.source_id,
                    protocols = disclose.protocols.len(),
                    "Peer disclosed its protocols"
                );
                complete.last_disclose = Some(disclose);
                (complete, Ok(()))
            }
            other => {
                debug!(
                    source_id = %self.source_id,
                    kind = %other.describe(),
                    "Ignoring message on established connection"
                );
                (complete, Ok(()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::LocalKeyAgent;
    use crate::transport::MemoryTransport;
    use std::sync::Arc;

    async fn make_local(
        agent: &LocalKeyAgent,
        label: &str,
        endpoint: &str,
    ) -> LocalIdentity {
        let (did, verkey) = agent.generate_keypair().await.unwrap();
        LocalIdentity {
            did,
            verkey,
            endpoint: endpoint.to_string(),
            label: label.to_string(),
            routing_keys: vec![],
            protocol: ProtocolVersion::V2,
        }
    }

    /// Inviter and invitee wired to one shared transport, invitation already
    /// exchanged. Both mailboxes are attached.
    async fn handshake_pair(
        agent: &LocalKeyAgent,
        transport: &Arc<MemoryTransport>,
    ) -> (ConnectionSm, ConnectionSm) {
        let love = make_local(agent, "love", "memory://love").await;
        let joy = make_local(agent, "joy", "memory://joy").await;

        let mut inviter = ConnectionSm::new_inviter("love".to_string(), love);
        let invitation = inviter.connect(transport.as_ref()).await.unwrap();
        let invitee = ConnectionSm::new_invitee("joy".to_string(), joy, invitation);

        transport.attach(&inviter.local.did, "memory://love");
        transport.attach(&invitee.local.did, "memory://joy");
        (inviter, invitee)
    }

    async fn next_envelope(transport: &MemoryTransport, did: &str) -> Envelope {
        let raw = transport.poll(did).await.unwrap().expect("message waiting");
        Envelope::parse(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_for_inviter() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let local = make_local(&agent, "love", "memory://love").await;

        let mut inviter = ConnectionSm::new_inviter("love".to_string(), local);
        let first = inviter.connect(transport.as_ref()).await.unwrap();
        let second = inviter.connect(transport.as_ref()).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(inviter.state(), ConnectionState::Initialized);
        assert_eq!(first.recipient_keys, vec![inviter.local.verkey.clone()]);
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        assert_eq!(invitee.state(), ConnectionState::Requested);

        // Inviter applies the request and answers with a signed response
        let request = next_envelope(&transport, &inviter.local.did).await;
        let state = inviter.step(request, &agent, transport.as_ref()).await.unwrap();
        assert_eq!(state, ConnectionState::Requested);
        assert_eq!(
            inviter.remote().unwrap().did,
            invitee.local.did
        );

        // Invitee verifies the response and acks
        let response = next_envelope(&transport, &invitee.local.did).await;
        let state = invitee.step(response, &agent, transport.as_ref()).await.unwrap();
        assert_eq!(state, ConnectionState::Established);
        assert_eq!(invitee.remote().unwrap().did, inviter.local.did);
        assert_eq!(invitee.remote().unwrap().verkey, inviter.local.verkey);

        // Inviter applies the ack
        let ack = next_envelope(&transport, &inviter.local.did).await;
        let state = inviter.step(ack, &agent, transport.as_ref()).await.unwrap();
        assert_eq!(state, ConnectionState::Established);
    }

    #[tokio::test]
    async fn test_response_in_initialized_is_rejected() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        // Build a structurally valid signed response out of thin air
        let doc = DidDoc::new(&inviter.local.did, &inviter.local.verkey, "memory://love", &[]);
        let response = Response::new(ProtocolVersion::V2, &inviter.local.did, doc, "thread-x");
        let signed = response
            .sign(&agent, &inviter.local.verkey, ProtocolVersion::V2)
            .await
            .unwrap();

        // Invitee never sent a request; applying the response must fail
        let result = invitee
            .step(Envelope::SignedResponse(signed), &agent, transport.as_ref())
            .await;
        assert!(matches!(result, Err(LinkError::UnexpectedMessage { .. })));
        assert_eq!(invitee.state(), ConnectionState::Error);
        assert!(invitee.remote().is_none());
    }

    #[tokio::test]
    async fn test_request_replay_is_idempotent() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let raw = transport.poll(&inviter.local.did).await.unwrap().unwrap();

        let first = Envelope::parse(&raw).unwrap();
        inviter.step(first, &agent, transport.as_ref()).await.unwrap();
        assert_eq!(transport.pending("memory://joy"), 1);

        // Same request again: no error, no state change, response re-sent
        let replay = Envelope::parse(&raw).unwrap();
        let state = inviter.step(replay, &agent, transport.as_ref()).await.unwrap();
        assert_eq!(state, ConnectionState::Requested);
        assert_eq!(transport.pending("memory://joy"), 2);
    }

    #[tokio::test]
    async fn test_tampered_response_fails_without_identity() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let request = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(request, &agent, transport.as_ref()).await.unwrap();

        // Corrupt the signature before the invitee sees the response
        let mut signed = match next_envelope(&transport, &invitee.local.did).await {
            Envelope::SignedResponse(signed) => signed,
            other => panic!("expected response, got {}", other.describe()),
        };
        signed.connection_sig.signature = {
            use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
            let mut bytes = URL_SAFE_NO_PAD
                .decode(signed.connection_sig.signature.as_bytes())
                .unwrap();
            bytes[0] ^= 0x01;
            URL_SAFE_NO_PAD.encode(bytes)
        };

        let result = invitee
            .step(Envelope::SignedResponse(signed), &agent, transport.as_ref())
            .await;
        assert!(matches!(result, Err(LinkError::SignatureVerification(_))));
        assert_eq!(invitee.state(), ConnectionState::Error);
        assert!(invitee.remote().is_none());

        // The inviter gets told via a problem report
        let report = next_envelope(&transport, &inviter.local.did).await;
        assert_eq!(report.kind(), "problem_report");
    }

    #[tokio::test]
    async fn test_mismatched_ack_thread_is_ignored() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let request = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(request, &agent, transport.as_ref()).await.unwrap();

        let stray = Ack::new(ProtocolVersion::V2, AckStatus::Ok, "not-our-thread");
        let state = inviter
            .step(Envelope::Ack(stray), &agent, transport.as_ref())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Requested);
    }

    #[tokio::test]
    async fn test_problem_report_fails_handshake_without_error() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, _invitee) = handshake_pair(&agent, &transport).await;

        let report = ProblemReport::new(
            ProtocolVersion::V2,
            ProblemCode::RequestNotAccepted,
            "not today",
            "t",
        );
        let state = inviter
            .step(Envelope::ProblemReport(report), &agent, transport.as_ref())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Error);
        assert_eq!(inviter.failed_reason(), Some("not today"));
    }

    #[tokio::test]
    async fn test_ping_completes_inviter_handshake() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let request = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(request, &agent, transport.as_ref()).await.unwrap();

        let ping = crate::messages::Ping::in_thread(ProtocolVersion::V2, inviter.thread_id().unwrap());
        let state = inviter
            .step(Envelope::Ping(ping), &agent, transport.as_ref())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Established);
        assert!(inviter.last_seen().is_some());
    }

    #[tokio::test]
    async fn test_established_liveness_and_discovery() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let request = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(request, &agent, transport.as_ref()).await.unwrap();
        let response = next_envelope(&transport, &invitee.local.did).await;
        invitee.step(response, &agent, transport.as_ref()).await.unwrap();
        let ack = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(ack, &agent, transport.as_ref()).await.unwrap();

        // Ping with a response requested gets answered and stamps last_seen
        let ping = crate::messages::Ping::new(ProtocolVersion::V2, None);
        inviter
            .step(Envelope::Ping(ping), &agent, transport.as_ref())
            .await
            .unwrap();
        assert!(inviter.last_seen().is_some());
        let pong = next_envelope(&transport, &invitee.local.did).await;
        assert_eq!(pong.kind(), "ping_response");

        // Feature query gets a disclosure back
        let query = crate::messages::Query::new(ProtocolVersion::V2, "*", None);
        inviter
            .step(Envelope::Query(query), &agent, transport.as_ref())
            .await
            .unwrap();
        let disclose = next_envelope(&transport, &invitee.local.did).await;
        match disclose {
            Envelope::Disclose(d) => assert_eq!(d.protocols.len(), 4),
            other => panic!("expected disclose, got {}", other.describe()),
        }

        // Stray handshake traffic no longer fails the channel
        let stray = Ack::new(ProtocolVersion::V2, AckStatus::Ok, "whatever");
        let state = invitee
            .step(Envelope::Ack(stray), &agent, transport.as_ref())
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Established);
    }

    #[tokio::test]
    async fn test_ack_retry_after_delivery_failure() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());

        let love = make_local(&agent, "love", "memory://love").await;
        let joy = make_local(&agent, "joy", "memory://joy").await;
        let mut inviter = ConnectionSm::new_inviter("love".to_string(), love);
        let invitation = inviter.connect(transport.as_ref()).await.unwrap();
        let mut invitee = ConnectionSm::new_invitee("joy".to_string(), joy, invitation);

        // Only the invitee mailbox exists; the inviter endpoint is dark, so
        // the ack cannot be delivered yet
        transport.attach(&invitee.local.did, "memory://joy");
        let request = ConnectionRequest::new(
            ProtocolVersion::V2,
            "joy",
            &invitee.local.did,
            DidDoc::new(
                &invitee.local.did,
                &invitee.local.verkey,
                "memory://joy",
                &[],
            ),
            "inv",
        );
        let thread_id = request.thread_id();
        invitee.state = Sm::Invitee(InviteeState::Requested {
            invitation: inviter.invitation().unwrap().clone(),
            thread_id: thread_id.clone(),
        });

        let doc = DidDoc::new(&inviter.local.did, &inviter.local.verkey, "memory://love", &[]);
        let response = Response::new(ProtocolVersion::V2, &inviter.local.did, doc, &thread_id);
        let signed = response
            .sign(&agent, &inviter.local.verkey, ProtocolVersion::V2)
            .await
            .unwrap();

        let result = invitee
            .step(Envelope::SignedResponse(signed), &agent, transport.as_ref())
            .await;
        assert!(matches!(result, Err(LinkError::DeliveryFailed(_))));
        assert_eq!(invitee.state(), ConnectionState::Responded);
        // Identity was still recorded atomically with the transition
        assert_eq!(invitee.remote().unwrap().did, inviter.local.did);

        // Endpoint comes up; the pending ack goes out and completes the
        // handshake
        transport.attach(&inviter.local.did, "memory://love");
        invitee
            .flush_pending(&agent, transport.as_ref())
            .await
            .unwrap();
        assert_eq!(invitee.state(), ConnectionState::Established);
        assert_eq!(transport.pending("memory://love"), 1);
    }

    #[tokio::test]
    async fn test_connect_rejected_on_wrong_states() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());
        let (mut inviter, mut invitee) = handshake_pair(&agent, &transport).await;

        invitee.connect(transport.as_ref()).await.unwrap();
        let request = next_envelope(&transport, &inviter.local.did).await;
        inviter.step(request, &agent, transport.as_ref()).await.unwrap();

        assert!(matches!(
            inviter.connect(transport.as_ref()).await,
            Err(LinkError::InvalidState(_))
        ));

        inviter.delete();
        assert!(matches!(
            inviter.connect(transport.as_ref()).await,
            Err(LinkError::InvalidHandle(_))
        ));
        assert_eq!(inviter.state(), ConnectionState::None);
    }

    #[tokio::test]
    async fn test_request_send_failure_leaves_state_untouched() {
        let _ = tracing_subscriber::fmt::try_init();
        let agent = LocalKeyAgent::new();
        let transport = Arc::new(MemoryTransport::new());

        let love = make_local(&agent, "love", "memory://love").await;
        let joy = make_local(&agent, "joy", "memory://joy").await;
        let mut inviter = ConnectionSm::new_inviter("love".to_string(), love);
        let invitation = inviter.connect(transport.as_ref()).await.unwrap();
        let mut invitee = ConnectionSm::new_invitee("joy".to_string(), joy, invitation);

        // No mailbox attached anywhere: the request cannot be delivered
        let result = invitee.connect(transport.as_ref()).await;
        assert!(matches!(result, Err(LinkError::DeliveryFailed(_))));
        assert_eq!(invitee.state(), ConnectionState::Initialized);

        // Once the endpoint exists the same call succeeds
        transport.attach(&inviter.local.did, "memory://love");
        invitee.connect(transport.as_ref()).await.unwrap();
        assert_eq!(invitee.state(), ConnectionState::Requested);
    }

    #[test]
    fn test_state_codes_are_stable() {
        assert_eq!(ConnectionState::None.code(), 0);
        assert_eq!(ConnectionState::Initialized.code(), 1);
        assert_eq!(ConnectionState::Requested.code(), 2);
        assert_eq!(ConnectionState::Responded.code(), 3);
        assert_eq!(ConnectionState::Established.code(), 4);
        assert_eq!(ConnectionState::Error.code(), 5);
        for code in 0..=5 {
            assert_eq!(ConnectionState::from_code(code).unwrap().code(), code);
        }
        assert!(ConnectionState::from_code(6).is_none());
    }
}
