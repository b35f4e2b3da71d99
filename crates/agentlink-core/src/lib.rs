//! AgentLink Core Library
//!
//! Pairwise agent connections with a signed handshake and pluggable transport.
//!
//! ## Overview
//!
//! AgentLink establishes trusted channels between two agents without a
//! central server. An inviter publishes an invitation (as JSON or a URL fit
//! for a QR code), the invitee answers with a connection request, and the
//! inviter proves control of the invitation key by signing its response.
//! One acknowledgement later both sides hold each other's pairwise DID and
//! verification key and can exchange signed payloads, trust pings, and
//! protocol discovery queries over the channel.
//!
//! ## Core Principles
//!
//! - **Pairwise by default**: every relationship gets fresh keys; nothing links two channels
//! - **Crash-safe**: any record serializes to versioned JSON and resumes where it left off
//! - **Pluggable edges**: key custody and message delivery are traits, not baked-in services
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use agentlink_core::{Connection, ConnectionConfig, LocalKeyAgent, MemoryTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Arc::new(LocalKeyAgent::new());
//!     let transport = Arc::new(MemoryTransport::new());
//!
//!     // Inviter side: mint an invitation and share it out of band
//!     let mut conn = Connection::create(
//!         "my-first-peer",
//!         ConnectionConfig::default(),
//!         agent.clone(),
//!         transport.clone(),
//!     )
//!     .await?;
//!     let invitation = conn.connect().await?;
//!     println!("scan me: {}", invitation.to_url("https://example.org/invite")?);
//!
//!     // Drive the handshake as peer messages arrive
//!     let state = conn.update_state().await?;
//!     println!("connection is now {}", state);
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod keys;
pub mod messages;
pub mod registry;
pub mod transport;

// Re-exports
pub use connection::record::{ConnectionRecord, RecordData, RECORD_VERSION};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Role};
pub use error::{LinkError, LinkResult};
pub use keys::{derive_did, KeyAgent, LocalKeyAgent};
pub use messages::{
    Ack, AckStatus, ConnectionData, ConnectionRequest, DidDoc, Disclose, Envelope, Invitation,
    Ping, PingResponse, ProblemCode, ProblemReport, ProtocolDescriptor, ProtocolVersion, Query,
    SignedResponse, Thread,
};
pub use registry::{ConnectionRegistry, SharedConnection};
pub use transport::{MemoryTransport, MessageTransport};
