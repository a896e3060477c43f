//! # Callback Signing Key
//!
//! Every callback envelope the gateway delivers is signed so subscribers can
//! verify it came from this gateway (the "miner id" in callback payloads).
//! Ed25519 keeps the signature deterministic and compact.
//!
//! Key bytes are never logged.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key: expected {SECRET_KEY_LENGTH} hex-encoded bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature bytes: expected 64 bytes")]
    InvalidSignature,
}

/// The gateway's envelope signing identity.
///
/// Intentionally not `Serialize`: persisting the secret is an explicit
/// `secret_hex()` call.
#[derive(Clone)]
pub struct CallbackSigner {
    signing_key: SigningKey,
}

impl CallbackSigner {
    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    /// Restore a key from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Restore a key from its hex-encoded secret (as written by `init`).
    pub fn from_hex(secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(secret.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret. Handle with care.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Hex-encoded public key; reported as `minerId` / `publicKey`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign `message` and return the hex-encoded 64-byte signature.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for CallbackSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSigner")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Verify a hex signature produced by [`CallbackSigner::sign_hex`].
///
/// Used by subscribers (and tests) to check an envelope.
pub fn verify_hex(public_key_hex: &str, message: &[u8], signature_hex: &str) -> Result<bool, KeyError> {
    let pk_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|_| KeyError::InvalidPublicKey)?
        .try_into()
        .map_err(|_| KeyError::InvalidPublicKey)?;
    let key = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| KeyError::InvalidPublicKey)?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|_| KeyError::InvalidSignature)?
        .try_into()
        .map_err(|_| KeyError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    Ok(key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = CallbackSigner::generate();
        let sig = signer.sign_hex(b"payload");
        assert!(verify_hex(&signer.public_key_hex(), b"payload", &sig).unwrap());
        assert!(!verify_hex(&signer.public_key_hex(), b"tampered", &sig).unwrap());
    }

    #[test]
    fn secret_hex_round_trip() {
        let signer = CallbackSigner::generate();
        let restored = CallbackSigner::from_hex(&signer.secret_hex()).unwrap();
        assert_eq!(signer.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn from_hex_rejects_short_secret() {
        assert!(matches!(
            CallbackSigner::from_hex("abcd"),
            Err(KeyError::InvalidSecretKey)
        ));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let signer = CallbackSigner::from_seed(&[7u8; 32]);
        let shown = format!("{:?}", signer);
        assert!(!shown.contains(&signer.secret_hex()));
    }
}
