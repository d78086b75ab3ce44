//! Sealed cluster credentials.
//!
//! The administrative plane encrypts connection credentials before they
//! reach this system; the core stores them opaque and only decodes the
//! payload and checks its sha256 fingerprint when a connector needs it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use devgrid_state::SealedCredential;

use crate::error::RegistryError;

/// Seal raw credential bytes into the stored form.
pub fn seal_credential(raw: &[u8]) -> SealedCredential {
    SealedCredential {
        payload: BASE64.encode(raw),
        fingerprint: hex::encode(Sha256::digest(raw)),
    }
}

/// Decode a sealed credential and verify its fingerprint.
pub fn open_credential(sealed: &SealedCredential) -> Result<Vec<u8>, RegistryError> {
    let raw = BASE64
        .decode(&sealed.payload)
        .map_err(|e| RegistryError::Credential(format!("payload decode failed: {e}")))?;
    let fingerprint = hex::encode(Sha256::digest(&raw));
    if fingerprint != sealed.fingerprint {
        return Err(RegistryError::Credential(
            "credential fingerprint mismatch".to_string(),
        ));
    }
    Ok(raw)
}
