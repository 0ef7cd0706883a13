//! Session messages exchanged between the parent instance and the enclave
//!
//! Every message is one JSON object on one line. A request populates exactly
//! one of `createKey`, `getAttestation` or `decrypt`; a response populates
//! exactly one of the same keys, or `error` alone. Byte fields travel as
//! standard (padded) base64 strings.

use crate::error::{EnclaveError, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Short-lived AWS credentials of the parent's IAM role
///
/// Accepts both the camelCase wire names and the PascalCase names returned by
/// the instance metadata service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(alias = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(alias = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(alias = "Token")]
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Asks the enclave to create its KMS key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub region: String,
    pub account_id: String,
    pub aws_iam_role: String,
    pub credentials: Credentials,
}

/// Asks the enclave for a fresh attestation over its transport key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetAttestationRequest {}

/// Asks the enclave to open a ciphertext sealed under a KMS-derived key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptRequest {
    /// `CiphertextForRecipient` returned by KMS `DeriveSharedSecret`
    #[serde(with = "base64_bytes")]
    pub encrypted_shared_secret_or_cek: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// A request, exactly one variant per message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CreateKey(CreateKeyRequest),
    GetAttestation(GetAttestationRequest),
    Decrypt(DecryptRequest),
}

/// Discriminant shared by requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    CreateKey,
    GetAttestation,
    Decrypt,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::CreateKey => "createKey",
            MessageKind::GetAttestation => "getAttestation",
            MessageKind::Decrypt => "decrypt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create_key: Option<CreateKeyRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    get_attestation: Option<GetAttestationRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decrypt: Option<DecryptRequest>,
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::CreateKey(_) => MessageKind::CreateKey,
            Request::GetAttestation(_) => MessageKind::GetAttestation,
            Request::Decrypt(_) => MessageKind::Decrypt,
        }
    }

    /// Parses one request frame, rejecting frames with zero or several variants
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let frame: RequestFrame = serde_json::from_slice(bytes)
            .map_err(|e| EnclaveError::Decode(format!("malformed request: {}", e)))?;

        match (frame.create_key, frame.get_attestation, frame.decrypt) {
            (Some(req), None, None) => Ok(Request::CreateKey(req)),
            (None, Some(req), None) => Ok(Request::GetAttestation(req)),
            (None, None, Some(req)) => Ok(Request::Decrypt(req)),
            (None, None, None) => Err(EnclaveError::Decode(
                "request populates no variant".to_string(),
            )),
            _ => Err(EnclaveError::Decode(
                "request populates more than one variant".to_string(),
            )),
        }
    }

    /// Serializes the request as a single frame, without the trailing newline
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut frame = RequestFrame::default();
        match self {
            Request::CreateKey(req) => frame.create_key = Some(req.clone()),
            Request::GetAttestation(req) => frame.get_attestation = Some(req.clone()),
            Request::Decrypt(req) => frame.decrypt = Some(req.clone()),
        }
        Ok(serde_json::to_vec(&frame)?)
    }
}

/// Payload of every successful response: a signed attestation document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResponse {
    #[serde(with = "base64_bytes")]
    pub attestation: Vec<u8>,
}

/// A response: one populated result variant, or an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    CreateKey(AttestationResponse),
    GetAttestation(AttestationResponse),
    Decrypt(AttestationResponse),
    Error(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    create_key: Option<AttestationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    get_attestation: Option<AttestationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    decrypt: Option<AttestationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Response {
    pub fn for_kind(kind: MessageKind, attestation: Vec<u8>) -> Self {
        let body = AttestationResponse { attestation };
        match kind {
            MessageKind::CreateKey => Response::CreateKey(body),
            MessageKind::GetAttestation => Response::GetAttestation(body),
            MessageKind::Decrypt => Response::Decrypt(body),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let frame: ResponseFrame = serde_json::from_slice(bytes)
            .map_err(|e| EnclaveError::Decode(format!("malformed response: {}", e)))?;

        match (frame.create_key, frame.get_attestation, frame.decrypt, frame.error) {
            (Some(body), None, None, None) => Ok(Response::CreateKey(body)),
            (None, Some(body), None, None) => Ok(Response::GetAttestation(body)),
            (None, None, Some(body), None) => Ok(Response::Decrypt(body)),
            (None, None, None, Some(error)) => Ok(Response::Error(error)),
            (None, None, None, None) => Err(EnclaveError::Decode(
                "response populates neither a result nor an error".to_string(),
            )),
            _ => Err(EnclaveError::Decode(
                "response populates more than one of result and error".to_string(),
            )),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut frame = ResponseFrame::default();
        match self {
            Response::CreateKey(body) => frame.create_key = Some(body.clone()),
            Response::GetAttestation(body) => frame.get_attestation = Some(body.clone()),
            Response::Decrypt(body) => frame.decrypt = Some(body.clone()),
            Response::Error(error) => frame.error = Some(error.clone()),
        }
        Ok(serde_json::to_vec(&frame)?)
    }

    /// Extracts the attestation of a response to a request of kind `expected`
    pub fn into_attestation(self, expected: MessageKind) -> Result<Vec<u8>> {
        let (kind, body) = match self {
            Response::Error(error) => return Err(EnclaveError::Remote(error)),
            Response::CreateKey(body) => (MessageKind::CreateKey, body),
            Response::GetAttestation(body) => (MessageKind::GetAttestation, body),
            Response::Decrypt(body) => (MessageKind::Decrypt, body),
        };
        if kind != expected {
            return Err(EnclaveError::Decode(format!(
                "expected a {} response, got {}",
                expected, kind
            )));
        }
        Ok(body.attestation)
    }
}

/// User data of the CreateKey attestation: binds the enclave to its KMS key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyUserData {
    pub key_id: String,
    /// Uncompressed SEC1 P-256 point (65 bytes)
    #[serde(with = "base64_bytes")]
    pub pub_key: Vec<u8>,
    pub region: String,
}

/// User data of the Decrypt attestation: the result bound to its request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptUserData {
    /// SHA-256 of the exact request frame bytes the enclave received
    #[serde(with = "base64_bytes")]
    pub request_hash: Vec<u8>,
    pub count: u64,
}

/// Output of the caller's encrypt step, handed to decrypt later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// Caller's ephemeral P-256 public key, SPKI DER
    #[serde(rename = "e", with = "base64_bytes")]
    pub ephemeral_key: Vec<u8>,
    #[serde(rename = "n", with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(rename = "c", with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Compact printable form: unpadded base64url over the JSON object
    pub fn to_token(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn from_token(token: &str) -> Result<Self> {
        let json = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| EnclaveError::Decode(format!("invalid ciphertext token: {}", e)))?;
        Ok(serde_json::from_slice(&json)?)
    }
}

pub(crate) mod base64_bytes {
    use super::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
