//! Error types for the KMS enclave protocol

use thiserror::Error;

/// Reasons an attestation document is rejected by a verifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid COSE_Sign1 structure: {0}")]
    Cose(String),

    #[error("invalid attestation payload: {0}")]
    Payload(String),

    #[error("attestation is missing PCR{0}")]
    MissingPcr(usize),

    #[error("attestation PCR0 does not match the expected measurement")]
    Pcr0Mismatch,

    #[error("attestation issued {age_secs}s ago, outside the {window_secs}s freshness window")]
    Stale { age_secs: u64, window_secs: u64 },

    #[error("attestation issued {ahead_secs}s in the future")]
    FromFuture { ahead_secs: u64 },

    #[error("attestation carries an empty CA bundle")]
    EmptyCaBundle,

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("certificate chain does not verify: {0}")]
    CertificateChain(String),

    #[error("certificate not valid at verification time: {0}")]
    CertificateValidity(String),

    #[error("COSE signature does not verify against the leaf certificate")]
    Signature,

    #[error("attestation is missing {0}")]
    MissingField(&'static str),
}

/// Errors that can occur in the enclave and in the caller flows
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Custodian failures keep the service's own message verbatim
    #[error("{0}")]
    Custodian(String),

    #[error("Attestation issuer error: {0}")]
    Issuer(String),

    #[error("Authenticated decryption failed")]
    Authentication,

    #[error("Response mismatch: attested request hash {attested} != sent request hash {sent}")]
    ResponseMismatch { attested: String, sent: String },

    #[error("Nonce reuse detected under the same channel key")]
    NonceReuse,

    #[error("Attestation verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Enclave returned an error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnclaveError {
    /// Whether the error ends the session it occurred on
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, EnclaveError::Transport(_) | EnclaveError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, EnclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custodian_message_is_verbatim() {
        let err = EnclaveError::Custodian("AccessDeniedException: denied".to_string());
        assert_eq!(err.to_string(), "AccessDeniedException: denied");
    }

    #[test]
    fn test_only_transport_errors_end_a_session() {
        assert!(EnclaveError::Transport("reset".into()).is_fatal_to_session());
        assert!(EnclaveError::Io(std::io::Error::other("eof")).is_fatal_to_session());
        assert!(!EnclaveError::Decode("bad json".into()).is_fatal_to_session());
        assert!(!EnclaveError::Authentication.is_fatal_to_session());
        assert!(!EnclaveError::Custodian("throttled".into()).is_fatal_to_session());
    }

    #[test]
    fn test_verify_error_converts() {
        let err: EnclaveError = VerifyError::Pcr0Mismatch.into();
        assert!(matches!(err, EnclaveError::Verification(VerifyError::Pcr0Mismatch)));
    }
}
