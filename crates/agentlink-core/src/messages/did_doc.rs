//! Peer DID document
//!
//! Requests and responses embed a DID document describing how to reach the
//! sender: its pairwise DID, verification key, and service endpoint. Only
//! the parts the connection protocol needs are modeled.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

pub const CONTEXT: &str = "https://w3id.org/did/v1";
pub const ED25519_KEY_TYPE: &str = "Ed25519VerificationKey2018";
pub const AUTHENTICATION_TYPE: &str = "Ed25519SignatureAuthentication2018";
pub const AGENT_SERVICE_TYPE: &str = "IndyAgent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDoc {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: Vec<Ed25519PublicKey>,
    pub authentication: Vec<Authentication>,
    pub service: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519PublicKey {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase58")]
    pub public_key_base_58: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(rename = "recipientKeys")]
    pub recipient_keys: Vec<String>,
    #[serde(default, rename = "routingKeys")]
    pub routing_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

impl DidDoc {
    /// Build the document for one side of a pairwise channel.
    pub fn new(did: &str, verkey: &str, endpoint: &str, routing_keys: &[String]) -> Self {
        let key_ref = format!("{}#1", did);
        DidDoc {
            context: CONTEXT.to_string(),
            id: did.to_string(),
            public_key: vec![Ed25519PublicKey {
                id: key_ref.clone(),
                type_: ED25519_KEY_TYPE.to_string(),
                controller: did.to_string(),
                public_key_base_58: verkey.to_string(),
            }],
            authentication: vec![Authentication {
                type_: AUTHENTICATION_TYPE.to_string(),
                public_key: key_ref,
            }],
            service: vec![Service {
                id: format!("{};indy", did),
                type_: AGENT_SERVICE_TYPE.to_string(),
                priority: 0,
                recipient_keys: vec![verkey.to_string()],
                routing_keys: routing_keys.to_vec(),
                service_endpoint: endpoint.to_string(),
            }],
        }
    }

    pub fn endpoint(&self) -> Option<String> {
        self.service.first().map(|s| s.service_endpoint.clone())
    }

    /// Recipient verkeys with `#`-style key references resolved.
    pub fn recipient_keys(&self) -> Vec<String> {
        self.service
            .first()
            .map(|s| {
                s.recipient_keys
                    .iter()
                    .filter_map(|k| self.resolve_key(k))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.service
            .first()
            .map(|s| s.routing_keys.clone())
            .unwrap_or_default()
    }

    /// First usable verkey for the peer.
    pub fn first_recipient_key(&self) -> LinkResult<String> {
        self.recipient_keys()
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::Identity("DID document has no recipient key".to_string()))
    }

    fn resolve_key(&self, key: &str) -> Option<String> {
        if key.contains('#') {
            self.public_key
                .iter()
                .find(|pk| pk.id == key)
                .map(|pk| pk.public_key_base_58.clone())
        } else {
            Some(key.to_string())
        }
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.id.is_empty() {
            return Err(LinkError::Identity("DID document id is empty".to_string()));
        }
        let service = self
            .service
            .first()
            .ok_or_else(|| LinkError::Identity("DID document has no service".to_string()))?;
        if service.service_endpoint.is_empty() {
            return Err(LinkError::Identity(
                "DID document service endpoint is empty".to_string(),
            ));
        }
        self.first_recipient_key()?;
        Ok(())
    }
}
