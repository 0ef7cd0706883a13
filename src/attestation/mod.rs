//! Attestation documents: issuing, decoding and verifying
//!
//! The enclave obtains documents from an [`AttestationIssuer`]: the Nitro
//! Secure Module inside an enclave, or [`LocalIssuer`] during development.
//! Callers check them with a [`Verifier`] pinned to the issuer's root.

mod document;
mod local;
mod nsm;
mod verify;

pub use document::AttestationDocument;
pub use local::LocalIssuer;
pub use nsm::NsmIssuer;
pub use verify::Verifier;

use crate::error::{EnclaveError, Result};

/// Fields the issuer embeds in a new document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttestationRequest {
    pub nonce: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
}

/// Produces signed attestation documents (COSE_Sign1 bytes)
pub trait AttestationIssuer: Send + Sync {
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>>;
}

/// Reads the current PCR0 through a zero-content attestation
pub fn code_measurement(issuer: &dyn AttestationIssuer) -> Result<Vec<u8>> {
    let document = issuer.attest(AttestationRequest::default())?;
    let (_, doc) = AttestationDocument::decode_unverified(&document)
        .map_err(|e| EnclaveError::Issuer(format!("malformed attestation: {}", e)))?;
    doc.code_measurement()
        .map(<[u8]>::to_vec)
        .map_err(|e| EnclaveError::Issuer(e.to_string()))
}
