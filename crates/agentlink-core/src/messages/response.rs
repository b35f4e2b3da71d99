//! Connection response
//!
//! The inviter's reply to a request. The identity block is not sent in the
//! clear; it is wrapped in a signature decorator proving control of the key
//! the invitation advertised, with a timestamp folded into the signed bytes.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{LinkError, LinkResult};
use crate::keys::KeyAgent;

use super::request::ConnectionData;
use super::thread::Thread;
use super::{build_type, ProtocolVersion, FAMILY_CONNECTIONS, FAMILY_SIGNATURE};

/// Length of the big-endian timestamp prefixed to the signed payload
const TIMESTAMP_LEN: usize = 8;

/// Plaintext response, only ever held locally. What goes on the wire is
/// [`SignedResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    pub connection: ConnectionData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedResponse {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "~thread")]
    pub thread: Thread,
    #[serde(rename = "connection~sig")]
    pub connection_sig: ConnectionSignature,
}

/// Signature decorator over the identity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSignature {
    #[serde(rename = "@type")]
    pub msg_type: String,
    /// base64url ed25519 signature over the decoded `sig_data` bytes
    pub signature: String,
    /// base64url of `timestamp_be8 || connection JSON`
    pub sig_data: String,
    /// Verkey that produced the signature
    pub signer: String,
}

impl Response {
    pub fn new(protocol: ProtocolVersion, did: &str, did_doc: super::did_doc::DidDoc, thread_id: &str) -> Self {
        Response {
            msg_type: build_type(protocol, FAMILY_CONNECTIONS, "response"),
            id: Ulid::new().to_string(),
            thread: Thread::new().set_thid(thread_id),
            connection: ConnectionData {
                did: did.to_string(),
                did_doc,
            },
        }
    }

    /// Wrap the identity block in a signature produced by `signer_verkey`.
    ///
    /// The signed bytes are an 8-byte big-endian unix timestamp followed by
    /// the connection JSON, so a captured response cannot be replayed as
    /// fresh without invalidating the signature.
    pub async fn sign(
        self,
        agent: &dyn KeyAgent,
        signer_verkey: &str,
        protocol: ProtocolVersion,
    ) -> LinkResult<SignedResponse> {
        let connection_json = serde_json::to_string(&self.connection)
            .map_err(|e| LinkError::Serialization(format!("connection block encode: {}", e)))?;

        let timestamp = chrono::Utc::now().timestamp() as u64;
        let mut sig_data = timestamp.to_be_bytes().to_vec();
        sig_data.extend_from_slice(connection_json.as_bytes());

        let signature = agent.sign(signer_verkey, &sig_data).await?;

        Ok(SignedResponse {
            msg_type: self.msg_type,
            id: self.id,
            thread: self.thread,
            connection_sig: ConnectionSignature {
                msg_type: build_type(protocol, FAMILY_SIGNATURE, "ed25519Sha512_single"),
                signature: URL_SAFE_NO_PAD.encode(&signature),
                sig_data: URL_SAFE_NO_PAD.encode(&sig_data),
                signer: signer_verkey.to_string(),
            },
        })
    }
}

impl SignedResponse {
    /// Check the signature and recover the identity block.
    ///
    /// `expected_signer` is the recipient key from the invitation; a
    /// response signed by any other key is rejected even if the signature
    /// itself is valid.
    pub async fn verify(
        &self,
        agent: &dyn KeyAgent,
        expected_signer: &str,
    ) -> LinkResult<ConnectionData> {
        let sig = &self.connection_sig;
        if sig.signer != expected_signer {
            return Err(LinkError::SignatureVerification(format!(
                "response signed by {} but invitation advertised {}",
                sig.signer, expected_signer
            )));
        }

        let sig_data = URL_SAFE_NO_PAD
            .decode(sig.sig_data.trim_end_matches('='))
            .map_err(|e| LinkError::SignatureVerification(format!("bad sig_data: {}", e)))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig.signature.trim_end_matches('='))
            .map_err(|e| LinkError::SignatureVerification(format!("bad signature: {}", e)))?;

        if !agent.verify(&sig.signer, &sig_data, &signature).await? {
            return Err(LinkError::SignatureVerification(
                "connection signature does not verify".to_string(),
            ));
        }

        if sig_data.len() <= TIMESTAMP_LEN {
            return Err(LinkError::SignatureVerification(
                "sig_data too short to hold a payload".to_string(),
            ));
        }
        serde_json::from_slice(&sig_data[TIMESTAMP_LEN..])
            .map_err(|e| LinkError::Serialization(format!("connection block decode: {}", e)))
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread.thid.as_deref()
    }
}
