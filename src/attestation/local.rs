//! Local attestation issuer for running outside a Nitro enclave
//!
//! Keeps a long-lived P-384 root and, like the Nitro Secure Module, signs
//! every document with a fresh short-lived leaf. Its root is not the AWS root,
//! so a verifier only accepts these documents when explicitly pinned to it.

use super::document::{P384PrivateKey, Sha2};
use super::{AttestationIssuer, AttestationRequest};
use crate::error::{EnclaveError, Result};
use aws_nitro_enclaves_cose::header_map::HeaderMap;
use aws_nitro_enclaves_cose::CoseSign1;
use aws_nitro_enclaves_nsm_api::api::{AttestationDoc, Digest};
use der::Encode;
use p384::ecdsa::{DerSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

pub(crate) const ROOT_SUBJECT: &str = "CN=local.nitro-enclaves,OU=kms-enclave";
const LEAF_SUBJECT: &str = "CN=local-enclave.nitro-enclaves,OU=kms-enclave";
pub(crate) const ROOT_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// NSM leaves are valid for a few hours
pub(crate) const LEAF_LIFETIME: Duration = Duration::from_secs(3 * 60 * 60);
const PCR_COUNT: usize = 16;
const PCR_LENGTH: usize = 48;
const MODULE_ID: &str = "i-local-enc0000000000000000";

pub struct LocalIssuer {
    pcr0: Vec<u8>,
    root_key: SigningKey,
    root_der: Vec<u8>,
}

impl LocalIssuer {
    /// Creates an issuer reporting `pcr0` as its code measurement
    pub fn new(pcr0: Vec<u8>) -> Result<Self> {
        let root_key = SigningKey::random(&mut OsRng);
        let root_der = issue_certificate(
            Profile::Root,
            &root_key,
            ROOT_SUBJECT,
            &root_key,
            ROOT_LIFETIME,
        )?;

        warn!(
            pcr0 = %hex::encode(&pcr0),
            "Using a local attestation issuer; documents are not signed by AWS"
        );

        Ok(Self {
            pcr0,
            root_key,
            root_der,
        })
    }

    /// Trust anchor a verifier must be pinned to
    pub fn root_certificate_der(&self) -> &[u8] {
        &self.root_der
    }

    /// Root certificate as PEM, the form callers load with `--root-path`
    pub fn root_certificate_pem(&self) -> Result<String> {
        der::pem::encode_string("CERTIFICATE", der::pem::LineEnding::LF, &self.root_der)
            .map_err(certificate_error)
    }

    pub fn measurement(&self) -> &[u8] {
        &self.pcr0
    }
}

impl AttestationIssuer for LocalIssuer {
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>> {
        let leaf_key = SigningKey::random(&mut OsRng);
        let leaf_der = issue_certificate(
            Profile::Leaf {
                issuer: parse_name(ROOT_SUBJECT)?,
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            &self.root_key,
            LEAF_SUBJECT,
            &leaf_key,
            LEAF_LIFETIME,
        )?;

        let document = sign_document(
            &self.pcr0,
            leaf_der,
            vec![self.root_der.clone()],
            leaf_key,
            request,
        )?;
        info!(document_len = document.len(), "Issued local attestation");
        Ok(document)
    }
}

/// Issues a certificate for `subject_key` signed by `issuer_key`, valid from now
pub(crate) fn issue_certificate(
    profile: Profile,
    issuer_key: &SigningKey,
    subject: &str,
    subject_key: &SigningKey,
    lifetime: Duration,
) -> Result<Vec<u8>> {
    let certificate = CertificateBuilder::new(
        profile,
        random_serial()?,
        Validity::from_now(lifetime).map_err(certificate_error)?,
        parse_name(subject)?,
        SubjectPublicKeyInfoOwned::from_key(VerifyingKey::from(subject_key))
            .map_err(certificate_error)?,
        issuer_key,
    )
    .map_err(certificate_error)?
    .build::<DerSignature>()
    .map_err(certificate_error)?;
    certificate.to_der().map_err(certificate_error)
}

/// Signs a Nitro-format document with `signer`, the key of `certificate`
pub(crate) fn sign_document(
    pcr0: &[u8],
    certificate: Vec<u8>,
    cabundle: Vec<Vec<u8>>,
    signer: SigningKey,
    request: AttestationRequest,
) -> Result<Vec<u8>> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EnclaveError::Issuer(e.to_string()))?
        .as_millis() as u64;

    let mut pcrs = BTreeMap::new();
    pcrs.insert(0, ByteBuf::from(pcr0.to_vec()));
    for index in 1..PCR_COUNT {
        pcrs.insert(index, ByteBuf::from(vec![0u8; PCR_LENGTH]));
    }

    let doc = AttestationDoc {
        module_id: MODULE_ID.to_string(),
        digest: Digest::SHA384,
        timestamp,
        pcrs,
        certificate: ByteBuf::from(certificate),
        cabundle: cabundle.into_iter().map(ByteBuf::from).collect(),
        public_key: request.public_key.map(ByteBuf::from),
        user_data: request.user_data.map(ByteBuf::from),
        nonce: request.nonce.map(ByteBuf::from),
    };

    let cose = CoseSign1::new::<Sha2>(&doc.to_binary(), &HeaderMap::new(), &P384PrivateKey(signer))
        .map_err(|e| EnclaveError::Issuer(format!("signing attestation: {}", e)))?;
    cose.as_bytes(false)
        .map_err(|e| EnclaveError::Issuer(format!("encoding attestation: {}", e)))
}

pub(crate) fn parse_name(name: &str) -> Result<Name> {
    Name::from_str(name).map_err(certificate_error)
}

fn random_serial() -> Result<SerialNumber> {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    // keep it positive and non-zero
    serial[0] = (serial[0] & 0x7f) | 0x01;
    SerialNumber::new(&serial).map_err(certificate_error)
}

fn certificate_error(e: impl std::fmt::Display) -> EnclaveError {
    EnclaveError::Issuer(format!("local certificate: {}", e))
}
