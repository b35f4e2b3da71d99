//! Connection invitation
//!
//! The out-of-band message that starts a handshake. Invitations travel
//! outside the channel (QR code, link, file) and carry everything the
//! invitee needs to send the first encrypted message back: recipient keys
//! and a service endpoint.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{LinkError, LinkResult};

use super::{build_type, parse_type, ProtocolVersion, FAMILY_CONNECTIONS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "@type")]
    pub msg_type: String,
    #[serde(rename = "@id")]
    pub id: String,
    pub label: String,
    #[serde(rename = "recipientKeys")]
    pub recipient_keys: Vec<String>,
    #[serde(default, rename = "routingKeys", skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

impl Invitation {
    pub fn new(
        protocol: ProtocolVersion,
        label: &str,
        recipient_key: &str,
        routing_keys: &[String],
        service_endpoint: &str,
    ) -> Self {
        Invitation {
            msg_type: build_type(protocol, FAMILY_CONNECTIONS, "invitation"),
            id: Ulid::new().to_string(),
            label: label.to_string(),
            recipient_keys: vec![recipient_key.to_string()],
            routing_keys: routing_keys.to_vec(),
            service_endpoint: service_endpoint.to_string(),
        }
    }

    /// Parse and validate an invitation received as JSON.
    pub fn from_json(json: &str) -> LinkResult<Self> {
        let invitation: Invitation = serde_json::from_str(json)
            .map_err(|e| LinkError::MalformedInvitation(format!("invalid JSON: {}", e)))?;
        invitation.validate()?;
        Ok(invitation)
    }

    /// Parse an invitation URL of the form `{base}?c_i={base64url(json)}`.
    pub fn from_url(url: &str) -> LinkResult<Self> {
        let query = url
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| LinkError::MalformedInvitation("URL has no query string".to_string()))?;
        let encoded = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("c_i="))
            .ok_or_else(|| {
                LinkError::MalformedInvitation("URL has no c_i parameter".to_string())
            })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| LinkError::MalformedInvitation(format!("invalid base64url: {}", e)))?;
        let json = String::from_utf8(bytes)
            .map_err(|e| LinkError::MalformedInvitation(format!("invalid UTF-8: {}", e)))?;
        Self::from_json(&json)
    }

    /// Render as a shareable URL against the given base.
    pub fn to_url(&self, base: &str) -> LinkResult<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| LinkError::Serialization(format!("invitation encode failed: {}", e)))?;
        Ok(format!("{}?c_i={}", base, URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn validate(&self) -> LinkResult<()> {
        match parse_type(&self.msg_type) {
            Ok((_, kind)) if kind.family == FAMILY_CONNECTIONS && kind.name == "invitation" => {}
            _ => {
                return Err(LinkError::MalformedInvitation(format!(
                    "not an invitation type: {}",
                    self.msg_type
                )))
            }
        }
        if self.recipient_keys.is_empty() {
            return Err(LinkError::MalformedInvitation(
                "invitation carries no recipient keys".to_string(),
            ));
        }
        if self.service_endpoint.is_empty() {
            return Err(LinkError::MalformedInvitation(
                "invitation carries no service endpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Key the inviter expects the first message to be addressed to.
    pub fn recipient_key(&self) -> LinkResult<String> {
        self.recipient_keys
            .first()
            .cloned()
            .ok_or_else(|| {
                LinkError::MalformedInvitation("invitation carries no recipient keys".to_string())
            })
    }

    pub fn protocol(&self) -> ProtocolVersion {
        parse_type(&self.msg_type)
            .map(|(p, _)| p)
            .unwrap_or(ProtocolVersion::V2)
    }
}
