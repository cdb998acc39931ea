//! Payload signing.
//!
//! The worker signs every published package with its private key. Keys are
//! stored as text in the `privKey` fragment; the [`Signer`] decides their
//! format.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde_json::Value;

use crate::error::WorkerError;
use crate::version::canonical_json;

/// Field appended to signed packages.
pub const SIGNATURE_FIELD: &str = "signature";

/// Key generation and signing for published data.
pub trait Signer: Send + Sync {
    /// Fresh private key in its stored text form.
    fn generate_key(&self) -> Result<String, WorkerError>;

    /// Signature over `payload` with the stored `key`.
    fn sign(&self, payload: &Value, key: &str) -> Result<String, WorkerError>;
}

/// Sign `package` and insert the result as its `signature` field.
///
/// Any existing signature is excluded from the signed bytes and replaced.
pub fn append_signature(
    signer: &dyn Signer,
    package: &mut Value,
    key: &str,
) -> Result<(), WorkerError> {
    let Some(object) = package.as_object_mut() else {
        return Err(WorkerError::Signer("package must be a JSON object".into()));
    };
    object.remove(SIGNATURE_FIELD);
    let signature = signer.sign(package, key)?;
    if let Some(object) = package.as_object_mut() {
        object.insert(SIGNATURE_FIELD.into(), Value::String(signature));
    }
    Ok(())
}

/// Ed25519 signer. Keys are base64 32-byte seeds; signatures are base64
/// over the canonical JSON of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Signer;

impl Ed25519Signer {
    fn signing_key(key: &str) -> Result<SigningKey, WorkerError> {
        let bytes = STANDARD
            .decode(key.trim())
            .map_err(|e| WorkerError::Signer(format!("private key is not base64: {e}")))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            WorkerError::Signer(format!(
                "invalid key length: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(SigningKey::from_bytes(&seed))
    }

    /// Base64 verifying key for a stored private key.
    pub fn public_key(&self, key: &str) -> Result<String, WorkerError> {
        let signing_key = Self::signing_key(key)?;
        Ok(STANDARD.encode(signing_key.verifying_key().to_bytes()))
    }

    /// Check a signature produced by [`Signer::sign`].
    pub fn verify(
        &self,
        payload: &Value,
        signature: &str,
        public_key: &str,
    ) -> Result<bool, WorkerError> {
        let public = STANDARD
            .decode(public_key)
            .map_err(|e| WorkerError::Signer(format!("public key is not base64: {e}")))?;
        let public: [u8; 32] = public
            .as_slice()
            .try_into()
            .map_err(|_| WorkerError::Signer("public key must be 32 bytes".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&public)
            .map_err(|e| WorkerError::Signer(format!("invalid public key: {e}")))?;

        let signature = STANDARD
            .decode(signature)
            .map_err(|e| WorkerError::Signer(format!("signature is not base64: {e}")))?;
        let Ok(signature) = Signature::from_slice(&signature) else {
            return Ok(false);
        };

        Ok(verifying_key
            .verify(canonical_json(payload).as_bytes(), &signature)
            .is_ok())
    }
}

impl Signer for Ed25519Signer {
    fn generate_key(&self) -> Result<String, WorkerError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        Ok(STANDARD.encode(signing_key.to_bytes()))
    }

    fn sign(&self, payload: &Value, key: &str) -> Result<String, WorkerError> {
        let signing_key = Self::signing_key(key)?;
        let signature = signing_key.sign(canonical_json(payload).as_bytes());
        Ok(STANDARD.encode(signature.to_bytes()))
    }
}
