//! Pairwise key management
//!
//! Every connection gets its own DID/verkey pair, generated through the
//! [`KeyAgent`] capability so the protocol core never touches key material
//! directly. [`LocalKeyAgent`] is the bundled ed25519 implementation backed
//! by an in-memory key store; callers with an external wallet or HSM inject
//! their own implementation instead.
//!
//! DID format: base58 of the first 16 bytes of `blake3(verkey)`. Verkeys are
//! base58-encoded ed25519 public keys.

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;

use crate::error::{LinkError, LinkResult};

/// Number of verkey bytes hashed into the pairwise DID
const DID_LEN: usize = 16;

/// Capability interface for pairwise key operations.
///
/// The connection state machine calls this for key generation during
/// `create`, response signing on the inviter side, and signature checks on
/// the invitee side. Implementations must be safe to share across records.
#[async_trait]
pub trait KeyAgent: Send + Sync {
    /// Generate a fresh pairwise keypair.
    ///
    /// Returns `(did, verkey)`, both base58 strings. The secret half stays
    /// inside the agent, addressable by verkey.
    async fn generate_keypair(&self) -> LinkResult<(String, String)>;

    /// Sign `message` with the secret key belonging to `verkey`.
    async fn sign(&self, verkey: &str, message: &[u8]) -> LinkResult<Vec<u8>>;

    /// Verify `signature` over `message` against `verkey`.
    ///
    /// A cryptographically wrong signature yields `Ok(false)`; only
    /// malformed inputs (bad base58, wrong lengths) produce an error.
    async fn verify(&self, verkey: &str, message: &[u8], signature: &[u8]) -> LinkResult<bool>;
}

/// Derive the pairwise DID for a verkey.
///
/// The DID is stable for the lifetime of the relationship and does not
/// reveal the full public key.
pub fn derive_did(verkey_bytes: &[u8]) -> String {
    let hash = blake3::hash(verkey_bytes);
    bs58::encode(&hash.as_bytes()[..DID_LEN]).into_string()
}

/// Decode and length-check a base58 verkey.
pub(crate) fn decode_verkey(verkey: &str) -> LinkResult<[u8; 32]> {
    let bytes = bs58::decode(verkey)
        .into_vec()
        .map_err(|e| LinkError::Identity(format!("verkey is not valid base58: {}", e)))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| LinkError::Identity(format!("verkey must be 32 bytes, got {}", bytes.len())))
}

/// In-memory ed25519 key agent.
///
/// Keys live only for the lifetime of the process; persistence of secret
/// material is deliberately left to the embedding application.
#[derive(Default)]
pub struct LocalKeyAgent {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl LocalKeyAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keypairs currently held.
    pub fn key_count(&self) -> usize {
        self.keys.lock().len()
    }
}

impl std::fmt::Debug for LocalKeyAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyAgent")
            .field("key_count", &self.key_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyAgent for LocalKeyAgent {
    async fn generate_keypair(&self) -> LinkResult<(String, String)> {
        // Seed from the OS RNG directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| LinkError::KeyGeneration(format!("OS RNG unavailable: {}", e)))?;

        let signing = SigningKey::from_bytes(&seed);
        let verifying = signing.verifying_key();

        let verkey = bs58::encode(verifying.as_bytes()).into_string();
        let did = derive_did(verifying.as_bytes());

        self.keys.lock().insert(verkey.clone(), signing);
        Ok((did, verkey))
    }

    async fn sign(&self, verkey: &str, message: &[u8]) -> LinkResult<Vec<u8>> {
        let keys = self.keys.lock();
        let signing = keys
            .get(verkey)
            .ok_or_else(|| LinkError::Identity(format!("no secret key for verkey {}", verkey)))?;
        Ok(signing.sign(message).to_bytes().to_vec())
    }

    async fn verify(&self, verkey: &str, message: &[u8], signature: &[u8]) -> LinkResult<bool> {
        let key_bytes = decode_verkey(verkey)?;
        let verifying = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| LinkError::Identity(format!("invalid ed25519 verkey: {}", e)))?;

        let sig_bytes: [u8; 64] = signature.try_into().map_err(|_| {
            LinkError::Identity(format!("signature must be 64 bytes, got {}", signature.len()))
        })?;
        let sig = Signature::from_bytes(&sig_bytes);

        Ok(verifying.verify(message, &sig).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_keypair_format() {
        let agent = LocalKeyAgent::new();
        let (did, verkey) = agent.generate_keypair().await.unwrap();

        // Verkey decodes to a 32-byte ed25519 public key
        let vk_bytes = bs58::decode(&verkey).into_vec().unwrap();
        assert_eq!(vk_bytes.len(), 32);

        // DID decodes to the 16-byte blake3 prefix
        let did_bytes = bs58::decode(&did).into_vec().unwrap();
        assert_eq!(did_bytes.len(), 16);
        assert_eq!(did, derive_did(&vk_bytes));
    }

    #[tokio::test]
    async fn test_keypairs_are_unique() {
        let agent = LocalKeyAgent::new();
        let (did1, vk1) = agent.generate_keypair().await.unwrap();
        let (did2, vk2) = agent.generate_keypair().await.unwrap();

        assert_ne!(did1, did2);
        assert_ne!(vk1, vk2);
        assert_eq!(agent.key_count(), 2);
    }

    #[tokio::test]
    async fn test_sign_verify_roundtrip() {
        let agent = LocalKeyAgent::new();
        let (_, verkey) = agent.generate_keypair().await.unwrap();

        let message = b"pairwise channel payload";
        let signature = agent.sign(&verkey, message).await.unwrap();
        assert_eq!(signature.len(), 64);

        assert!(agent.verify(&verkey, message, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_message_fails_verification() {
        let agent = LocalKeyAgent::new();
        let (_, verkey) = agent.generate_keypair().await.unwrap();

        let signature = agent.sign(&verkey, b"original").await.unwrap();
        assert!(!agent.verify(&verkey, b"modified", &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_flipped_bit_fails_verification() {
        let agent = LocalKeyAgent::new();
        let (_, verkey) = agent.generate_keypair().await.unwrap();

        let message = b"bit flip target";
        let mut signature = agent.sign(&verkey, message).await.unwrap();
        signature[0] ^= 0x01;

        // Structurally valid signature, cryptographically wrong: false, not an error
        assert!(!agent.verify(&verkey, message, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_key_fails_verification() {
        let agent = LocalKeyAgent::new();
        let (_, verkey1) = agent.generate_keypair().await.unwrap();
        let (_, verkey2) = agent.generate_keypair().await.unwrap();

        let message = b"cross key check";
        let signature = agent.sign(&verkey1, message).await.unwrap();
        assert!(!agent.verify(&verkey2, message, &signature).await.unwrap());
    }

    #[tokio::test]
    async fn test_sign_with_unknown_verkey() {
        let agent = LocalKeyAgent::new();
        let result = agent.sign("9wvFgnLUX8jSsGbGvUBtuWGoLyb6gBLqSGvbcZaMF3mC", b"x").await;
        assert!(matches!(result, Err(LinkError::Identity(_))));
    }

    #[tokio::test]
    async fn test_verify_malformed_inputs_error() {
        let agent = LocalKeyAgent::new();
        let (_, verkey) = agent.generate_keypair().await.unwrap();
        let signature = agent.sign(&verkey, b"m").await.unwrap();

        // Not base58 at all
        let result = agent.verify("0OIl-not-base58", b"m", &signature).await;
        assert!(matches!(result, Err(LinkError::Identity(_))));

        // Wrong signature length
        let result = agent.verify(&verkey, b"m", &signature[..32]).await;
        assert!(matches!(result, Err(LinkError::Identity(_))));
    }

    #[test]
    fn test_derive_did_deterministic() {
        let bytes = [7u8; 32];
        assert_eq!(derive_did(&bytes), derive_did(&bytes));
        assert_ne!(derive_did(&bytes), derive_did(&[8u8; 32]));
    }
}
