//! Error types for AgentLink

use thiserror::Error;

/// Main error type for AgentLink operations
#[derive(Error, Debug)]
pub enum LinkError {
    /// Operation on a deleted record or an unknown registry id
    #[error("Invalid connection handle: {0}")]
    InvalidHandle(String),

    /// The key provider could not produce a pairwise keypair
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Invitation payload is missing required fields or wrongly shaped
    #[error("Malformed invitation: {0}")]
    MalformedInvitation(String),

    /// Envelope does not match the expected next transition
    #[error("Unexpected message type: expected {expected}, received {received}")]
    UnexpectedMessage { expected: String, received: String },

    /// A protocol signature did not verify
    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    /// Serialized record is missing required fields or carries an
    /// unrecognized version tag
    #[error("Invalid serialized state: {0}")]
    InvalidSerializedState(String),

    /// Transport could not deliver an envelope
    #[error("Message delivery failed: {0}")]
    DeliveryFailed(String),

    /// Operation not valid for the record's current state
    #[error("Invalid operation: {0}")]
    InvalidState(String),

    /// Identity-related error (keys, signatures, DIDs)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using LinkError
pub type LinkResult<T> = Result<T, LinkError>;
