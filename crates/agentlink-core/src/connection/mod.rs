//! Pairwise connection lifecycle
//!
//! [`Connection`] is the public face of one pairwise relationship: it owns
//! the handshake state machine and the injected key agent and transport,
//! and exposes the operations callers drive. State-changing calls take
//! `&mut self`; wrap a connection in a lock (see
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry)) to share it
//! across tasks.

pub mod record;
mod sm;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{LinkError, LinkResult};
use crate::keys::KeyAgent;
use crate::messages::{Disclose, Envelope, Invitation, Ping, ProtocolVersion, Query};
use crate::transport::MessageTransport;

use record::ConnectionRecord;
use sm::{ConnectionSm, LocalIdentity};

pub use sm::{ConnectionState, Role};

/// Channel parameters fixed when a connection is created.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Human-readable name shown to the peer in invitations and requests
    pub label: String,
    /// Service endpoint advertised to the peer
    pub endpoint: String,
    /// Mediator keys the peer should route through, if any
    pub routing_keys: Vec<String>,
    pub protocol: ProtocolVersion,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            label: "agent".to_string(),
            endpoint: "memory://default".to_string(),
            routing_keys: vec![],
            protocol: ProtocolVersion::V2,
        }
    }
}

/// One pairwise connection.
pub struct Connection {
    sm: ConnectionSm,
    agent: Arc<dyn KeyAgent>,
    transport: Arc<dyn MessageTransport>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("source_id", &self.sm.source_id)
            .field("state", &self.sm.state())
            .field("role", &self.sm.role())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create the inviter side of a new relationship.
    ///
    /// Generates a fresh pairwise keypair through the key agent; the only
    /// failure mode is the key provider itself.
    pub async fn create(
        source_id: &str,
        config: ConnectionConfig,
        agent: Arc<dyn KeyAgent>,
        transport: Arc<dyn MessageTransport>,
    ) -> LinkResult<Self> {
        let local = Self::new_identity(&config, agent.as_ref()).await?;
        info!(source_id = %source_id, did = %local.did, role = %Role::Inviter, "Connection created");
        Ok(Connection {
            sm: ConnectionSm::new_inviter(source_id.to_string(), local),
            agent,
            transport,
        })
    }

    /// Create the invitee side from a received invitation.
    pub async fn create_with_invitation(
        source_id: &str,
        invitation: Invitation,
        config: ConnectionConfig,
        agent: Arc<dyn KeyAgent>,
        transport: Arc<dyn MessageTransport>,
    ) -> LinkResult<Self> {
        invitation.validate()?;
        let local = Self::new_identity(&config, agent.as_ref()).await?;
        info!(
            source_id = %source_id,
            did = %local.did,
            invitation_id = %invitation.id,
            role = %Role::Invitee,
            "Connection created"
        );
        Ok(Connection {
            sm: ConnectionSm::new_invitee(source_id.to_string(), local, invitation),
            agent,
            transport,
        })
    }

    async fn new_identity(
        config: &ConnectionConfig,
        agent: &dyn KeyAgent,
    ) -> LinkResult<LocalIdentity> {
        let (did, verkey) = agent.generate_keypair().await.map_err(|e| match e {
            LinkError::KeyGeneration(_) => e,
            other => LinkError::KeyGeneration(other.to_string()),
        })?;
        Ok(LocalIdentity {
            did,
            verkey,
            endpoint: config.endpoint.clone(),
            label: config.label.clone(),
            routing_keys: config.routing_keys.clone(),
            protocol: config.protocol,
        })
    }

    /// Start the handshake: generate the invitation (inviter) or send the
    /// connection request (invitee). Safe to retry after a delivery
    /// failure.
    pub async fn connect(&mut self) -> LinkResult<Invitation> {
        self.sm.connect(self.transport.as_ref()).await
    }

    /// Poll the transport and apply the next queued message, if any.
    ///
    /// Also re-delivers any outbound message a previous transition could
    /// not get onto the wire. A no-op returning the current state when
    /// nothing is pending.
    pub async fn update_state(&mut self) -> LinkResult<ConnectionState> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        if self.sm.state() == ConnectionState::Error {
            return Ok(ConnectionState::Error);
        }
        self.sm
            .flush_pending(self.agent.as_ref(), self.transport.as_ref())
            .await?;
        match self.transport.poll(&self.sm.local.did).await? {
            Some(raw) => self.apply_raw(&raw).await,
            None => Ok(self.sm.state()),
        }
    }

    /// Apply a message delivered by push instead of polling.
    pub async fn update_state_with_message(&mut self, message: &str) -> LinkResult<ConnectionState> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        self.apply_raw(message).await
    }

    async fn apply_raw(&mut self, raw: &str) -> LinkResult<ConnectionState> {
        match Envelope::parse(raw) {
            Ok(envelope) => {
                self.sm
                    .step(envelope, self.agent.as_ref(), self.transport.as_ref())
                    .await
            }
            Err(parse_err) => {
                warn!(
                    source_id = %self.sm.source_id,
                    error = %parse_err,
                    "Discarding unparseable message"
                );
                if self.sm.in_handshake() {
                    let err = LinkError::UnexpectedMessage {
                        expected: self.sm.expected_kind().to_string(),
                        received: "an unparseable envelope".to_string(),
                    };
                    self.sm.fail(&err.to_string());
                    Err(err)
                } else {
                    Ok(self.sm.state())
                }
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.sm.state()
    }

    pub fn source_id(&self) -> &str {
        &self.sm.source_id
    }

    pub fn pairwise_did(&self) -> &str {
        &self.sm.local.did
    }

    pub fn pairwise_verkey(&self) -> &str {
        &self.sm.local.verkey
    }

    pub fn endpoint(&self) -> &str {
        &self.sm.local.endpoint
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.sm.local.protocol
    }

    pub fn role(&self) -> Option<Role> {
        self.sm.role()
    }

    pub fn their_did(&self) -> Option<&str> {
        self.sm.remote().map(|r| r.did.as_str())
    }

    pub fn their_verkey(&self) -> Option<&str> {
        self.sm.remote().map(|r| r.verkey.as_str())
    }

    pub fn their_endpoint(&self) -> Option<&str> {
        self.sm.remote().map(|r| r.endpoint.as_str())
    }

    /// The invitation attached to this record, while the handshake still
    /// needs it.
    pub fn invitation(&self) -> Option<&Invitation> {
        self.sm.invitation()
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.sm.thread_id()
    }

    pub fn failed_reason(&self) -> Option<&str> {
        self.sm.failed_reason()
    }

    /// When the peer last answered a ping, if it ever has.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.sm.last_seen()
    }

    /// The peer's most recent protocol disclosure, if one arrived.
    pub fn last_disclose(&self) -> Option<&Disclose> {
        self.sm.last_disclose()
    }

    /// Capture this connection as a versioned JSON record.
    pub fn serialize(&self) -> LinkResult<String> {
        ConnectionRecord::snapshot(&self.sm)?.to_json()
    }

    /// Rebuild a connection from a serialized record, wiring it to the
    /// given capabilities.
    pub fn deserialize(
        json: &str,
        agent: Arc<dyn KeyAgent>,
        transport: Arc<dyn MessageTransport>,
    ) -> LinkResult<Self> {
        let sm = ConnectionRecord::from_json(json)?.restore()?;
        info!(source_id = %sm.source_id, state = %sm.state(), "Connection restored");
        Ok(Connection {
            sm,
            agent,
            transport,
        })
    }

    /// Invalidate this record. Subsequent state-changing operations fail
    /// with `InvalidHandle`; `state()` reports `None`.
    pub fn delete(&mut self) {
        info!(source_id = %self.sm.source_id, "Connection deleted");
        self.sm.delete();
    }

    /// Sign a payload with this connection's pairwise key.
    ///
    /// Valid once the handshake has a peer in sight (state `Requested` or
    /// later).
    pub async fn sign_data(&self, data: &[u8]) -> LinkResult<Vec<u8>> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        match self.sm.state() {
            ConnectionState::Requested
            | ConnectionState::Responded
            | ConnectionState::Established => {
                self.agent.sign(&self.sm.local.verkey, data).await
            }
            other => Err(LinkError::InvalidState(format!(
                "signing is not valid in the {} state",
                other
            ))),
        }
    }

    /// Verify a signature the peer produced over `data`.
    ///
    /// Returns `Ok(false)` for a wrong signature; errors only when inputs
    /// are malformed or the peer identity is not yet known.
    pub async fn verify_signature(&self, data: &[u8], signature: &[u8]) -> LinkResult<bool> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        let verkey = self
            .sm
            .remote()
            .map(|r| r.verkey.clone())
            .ok_or_else(|| {
                LinkError::InvalidState("peer identity not yet established".to_string())
            })?;
        self.agent.verify(&verkey, data, signature).await
    }

    /// Verify a signature this side produced over `data`.
    pub async fn verify_own_signature(&self, data: &[u8], signature: &[u8]) -> LinkResult<bool> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        self.agent.verify(&self.sm.local.verkey, data, signature).await
    }

    /// Send a trust ping. Does not wait for the reply; the pong is picked
    /// up by `update_state` and stamps [`last_seen`](Self::last_seen).
    pub async fn send_ping(&self, comment: Option<String>) -> LinkResult<()> {
        let endpoint = self.established_endpoint("ping")?;
        let ping = Ping::new(self.sm.local.protocol, comment);
        let raw = crate::messages::encode(&ping)?;
        self.transport.send(&endpoint, &raw).await
    }

    /// Ask the peer which protocol families it supports. The disclosure
    /// arrives through `update_state` and lands in
    /// [`last_disclose`](Self::last_disclose).
    pub async fn send_discovery_query(
        &self,
        query: Option<&str>,
        comment: Option<String>,
    ) -> LinkResult<()> {
        let endpoint = self.established_endpoint("discovery")?;
        let query = Query::new(self.sm.local.protocol, query.unwrap_or("*"), comment);
        let raw = crate::messages::encode(&query)?;
        self.transport.send(&endpoint, &raw).await
    }

    fn established_endpoint(&self, what: &str) -> LinkResult<String> {
        if self.sm.is_deleted() {
            return Err(LinkError::InvalidHandle("connection deleted".to_string()));
        }
        if self.sm.state() != ConnectionState::Established {
            return Err(LinkError::InvalidState(format!(
                "{} requires an established connection, state is {}",
                what,
                self.sm.state()
            )));
        }
        self.sm
            .remote()
            .map(|r| r.endpoint.clone())
            .ok_or_else(|| {
                LinkError::InvalidState("peer identity not yet established".to_string())
            })
    }
}
