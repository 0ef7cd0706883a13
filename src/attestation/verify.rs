//! Attestation verification against a pinned root certificate

use super::document::{AttestationDocument, P384PublicKey, Sha2};
use crate::config::ATTESTATION_FRESHNESS;
use crate::error::VerifyError;
use der::Decode;
use p384::ecdsa::VerifyingKey;
use rustls_pki_types::{CertificateDer, SignatureVerificationAlgorithm, UnixTime};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use webpki::{EndEntityCert, KeyUsage};
use x509_cert::Certificate;

/// Validates attestation documents
///
/// A document passes when its certificate chain leads to the pinned root, its
/// COSE signature verifies with the leaf key, it was issued within the
/// freshness window of the verification time and it carries PCR0 (equal to the
/// expected measurement, when one is pinned).
#[derive(Debug, Clone)]
pub struct Verifier {
    root: Vec<u8>,
    window: Duration,
    expected_pcr0: Option<Vec<u8>>,
}

impl Verifier {
    /// `root` is the DER encoded trust anchor, e.g. the AWS Nitro Enclaves root G1
    pub fn new(root: Vec<u8>) -> Self {
        Self {
            root,
            window: ATTESTATION_FRESHNESS,
            expected_pcr0: None,
        }
    }

    /// Builds a verifier from a PEM or DER root certificate
    pub fn from_root_bytes(bytes: &[u8]) -> Result<Self, VerifyError> {
        let der = match std::str::from_utf8(bytes) {
            Ok(text) if text.contains("-----BEGIN") => {
                let (_, doc) = der::Document::from_pem(text)
                    .map_err(|e| VerifyError::Certificate(format!("root PEM: {}", e)))?;
                doc.as_bytes().to_vec()
            }
            _ => bytes.to_vec(),
        };
        Certificate::from_der(&der)
            .map_err(|e| VerifyError::Certificate(format!("root: {}", e)))?;
        Ok(Self::new(der))
    }

    pub fn with_expected_measurement(mut self, pcr0: impl Into<Vec<u8>>) -> Self {
        self.expected_pcr0 = Some(pcr0.into());
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn verify(&self, bytes: &[u8], now: SystemTime) -> Result<AttestationDocument, VerifyError> {
        let (cose, doc) = AttestationDocument::decode_unverified(bytes)?;

        let pcr0 = doc.code_measurement()?;
        if let Some(expected) = &self.expected_pcr0 {
            if pcr0 != expected.as_slice() {
                return Err(VerifyError::Pcr0Mismatch);
            }
        }

        self.check_freshness(doc.issued_at(), now)?;

        let leaf = verify_chain(&self.root, &doc.cabundle, &doc.certificate, now)?;
        let leaf_key = P384PublicKey(leaf);
        match cose.verify_signature::<Sha2>(&leaf_key) {
            Ok(true) => Ok(doc),
            _ => Err(VerifyError::Signature),
        }
    }

    fn check_freshness(&self, issued_at: SystemTime, now: SystemTime) -> Result<(), VerifyError> {
        let window_secs = self.window.as_secs();
        match now.duration_since(issued_at) {
            Ok(age) if age > self.window => Err(VerifyError::Stale {
                age_secs: age.as_secs(),
                window_secs,
            }),
            Ok(_) => Ok(()),
            Err(ahead) if ahead.duration() > self.window => Err(VerifyError::FromFuture {
                ahead_secs: ahead.duration().as_secs(),
            }),
            Err(_) => Ok(()),
        }
    }
}

/// Nitro chains are ECDSA P-384 / SHA-384 throughout
static CHAIN_ALGORITHMS: &[&dyn SignatureVerificationAlgorithm] = &[webpki::ring::ECDSA_P384_SHA384];

/// Validates the path `root -> cabundle[1..] -> leaf` and returns the leaf's public key
///
/// `cabundle[0]` is the root as claimed by the document; the pinned root takes
/// its place. Every issuer on the path must be a CA and the leaf must not be.
fn verify_chain(
    root: &[u8],
    cabundle: &[Vec<u8>],
    leaf: &[u8],
    now: SystemTime,
) -> Result<VerifyingKey, VerifyError> {
    if cabundle.is_empty() {
        return Err(VerifyError::EmptyCaBundle);
    }

    let root = CertificateDer::from(root);
    let anchor = webpki::anchor_from_trusted_cert(&root)
        .map_err(|e| VerifyError::Certificate(format!("root: {}", e)))?;
    let intermediates: Vec<CertificateDer<'_>> = cabundle[1..]
        .iter()
        .map(|der| CertificateDer::from(der.as_slice()))
        .collect();
    let leaf_der = CertificateDer::from(leaf);
    let end_entity = EndEntityCert::try_from(&leaf_der)
        .map_err(|e| VerifyError::Certificate(format!("leaf: {}", e)))?;

    let since_epoch = now
        .duration_since(UNIX_EPOCH)
        .map_err(|_| VerifyError::CertificateValidity("clock before 1970".to_string()))?;
    end_entity
        .verify_for_usage(
            CHAIN_ALGORITHMS,
            &[anchor],
            &intermediates,
            UnixTime::since_unix_epoch(since_epoch),
            KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(chain_error)?;

    certificate_key(leaf)
}

fn chain_error(e: webpki::Error) -> VerifyError {
    match e {
        webpki::Error::CertExpired { .. } | webpki::Error::CertNotValidYet { .. } => {
            VerifyError::CertificateValidity(e.to_string())
        }
        other => VerifyError::CertificateChain(other.to_string()),
    }
}

fn certificate_key(der: &[u8]) -> Result<VerifyingKey, VerifyError> {
    let cert =
        Certificate::from_der(der).map_err(|e| VerifyError::Certificate(format!("leaf: {}", e)))?;
    let key = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    VerifyingKey::from_sec1_bytes(key).map_err(|_| {
        VerifyError::Certificate(format!(
            "{} does not hold a P-384 key",
            cert.tbs_certificate.subject
        ))
    })
}
