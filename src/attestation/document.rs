//! Nitro attestation documents: a COSE_Sign1 envelope around a CBOR `AttestationDoc`

use crate::error::{EnclaveError, VerifyError};
use aws_nitro_enclaves_cose::crypto::{
    Hash, MessageDigest, SignatureAlgorithm, SigningPrivateKey, SigningPublicKey,
};
use aws_nitro_enclaves_cose::error::CoseError;
use aws_nitro_enclaves_cose::CoseSign1;
use aws_nitro_enclaves_nsm_api::api::AttestationDoc;
use p384::ecdsa::signature::hazmat::{PrehashVerifier, RandomizedPrehashSigner};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A decoded attestation document
///
/// Holding one says nothing about its authenticity; see [`super::Verifier`].
#[derive(Debug, Clone)]
pub struct AttestationDocument {
    pub module_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub pcrs: BTreeMap<usize, Vec<u8>>,
    /// Leaf certificate, DER
    pub certificate: Vec<u8>,
    /// Root first, then intermediates, DER
    pub cabundle: Vec<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

impl AttestationDocument {
    /// Decodes the COSE envelope and the payload without checking any signature
    pub fn decode_unverified(bytes: &[u8]) -> Result<(CoseSign1, Self), VerifyError> {
        let cose = CoseSign1::from_bytes(bytes).map_err(|e| VerifyError::Cose(e.to_string()))?;
        let payload = cose
            .get_payload::<Sha2>(None)
            .map_err(|e| VerifyError::Cose(e.to_string()))?;
        let doc = AttestationDoc::from_binary(&payload)
            .map_err(|e| VerifyError::Payload(format!("{:?}", e)))?;
        Ok((cose, Self::from(doc)))
    }

    pub fn pcr(&self, index: usize) -> Option<&[u8]> {
        self.pcrs.get(&index).map(Vec::as_slice)
    }

    /// PCR0, the measurement of the whole enclave image
    pub fn code_measurement(&self) -> Result<&[u8], VerifyError> {
        self.pcr(0).ok_or(VerifyError::MissingPcr(0))
    }

    pub fn issued_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.timestamp)
    }

    /// Parses the JSON user data the enclave attached
    pub fn user_data_as<T: DeserializeOwned>(&self) -> Result<T, EnclaveError> {
        let user_data = self
            .user_data
            .as_deref()
            .ok_or(VerifyError::MissingField("user data"))?;
        serde_json::from_slice(user_data)
            .map_err(|e| EnclaveError::Decode(format!("attestation user data: {}", e)))
    }
}

impl From<AttestationDoc> for AttestationDocument {
    fn from(doc: AttestationDoc) -> Self {
        Self {
            module_id: doc.module_id,
            timestamp: doc.timestamp,
            pcrs: doc
                .pcrs
                .into_iter()
                .map(|(index, value)| (index, value.into_vec()))
                .collect(),
            certificate: doc.certificate.into_vec(),
            cabundle: doc.cabundle.into_iter().map(|c| c.into_vec()).collect(),
            public_key: doc.public_key.map(|k| k.into_vec()),
            user_data: doc.user_data.map(|u| u.into_vec()),
            nonce: doc.nonce.map(|n| n.into_vec()),
        }
    }
}

/// SHA-2 backend for COSE hashing
pub(crate) struct Sha2;

impl Hash for Sha2 {
    fn hash(digest: MessageDigest, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        use sha2::Digest as _;
        match digest {
            MessageDigest::Sha256 => Ok(sha2::Sha256::digest(data).to_vec()),
            MessageDigest::Sha384 => Ok(sha2::Sha384::digest(data).to_vec()),
            MessageDigest::Sha512 => Ok(sha2::Sha512::digest(data).to_vec()),
        }
    }
}

/// ES384 verification key of a leaf certificate
pub(crate) struct P384PublicKey(pub VerifyingKey);

impl SigningPublicKey for P384PublicKey {
    fn get_parameters(&self) -> Result<(SignatureAlgorithm, MessageDigest), CoseError> {
        Ok((SignatureAlgorithm::ES384, MessageDigest::Sha384))
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<bool, CoseError> {
        let signature =
            Signature::try_from(signature).map_err(|e| CoseError::SignatureError(Box::new(e)))?;
        Ok(self.0.verify_prehash(digest, &signature).is_ok())
    }
}

/// ES384 signing key used by the local issuer
pub(crate) struct P384PrivateKey(pub SigningKey);

impl SigningPublicKey for P384PrivateKey {
    fn get_parameters(&self) -> Result<(SignatureAlgorithm, MessageDigest), CoseError> {
        Ok((SignatureAlgorithm::ES384, MessageDigest::Sha384))
    }

    fn verify(&self, digest: &[u8], signature: &[u8]) -> Result<bool, CoseError> {
        P384PublicKey(VerifyingKey::from(&self.0)).verify(digest, signature)
    }
}

impl SigningPrivateKey for P384PrivateKey {
    fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, CoseError> {
        let signature: Signature = self
            .0
            .sign_prehash_with_rng(&mut OsRng, digest)
            .map_err(|e| CoseError::SignatureError(Box::new(e)))?;
        Ok(signature.to_bytes().to_vec())
    }
}
