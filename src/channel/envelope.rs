//! Recipient envelopes: KMS output wrapped for an attested enclave
//!
//! When a KMS request names a recipient attestation, KMS returns
//! `CiphertextForRecipient`: a CMS `EnvelopedData` (RFC 5652) with one
//! `KeyTransRecipientInfo`. Its content key is wrapped with RSAES-OAEP-SHA-256
//! under the public key embedded in the attestation, and the payload is
//! AES-256-CBC with PKCS#7 padding. KMS may use BER indefinite lengths, so
//! input is normalized to DER before decoding.

use crate::error::{EnclaveError, Result};
use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use der::asn1::{Any, ObjectIdentifier, OctetString};
use der::{Decode, Encode, Reader, Sequence, SliceReader, Tag, TagNumber, Tagged};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_cert::spki::AlgorithmIdentifierOwned;

/// Size of the enclave's transport key
pub const TRANSPORT_KEY_BITS: usize = 2048;

const ID_ENVELOPED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.3");
const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_RSAES_OAEP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.7");
const ID_MGF1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.8");
const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
const ID_AES256_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct ContentInfo {
    content_type: ObjectIdentifier,
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    content: Any,
}

/// `EnvelopedData` without originator info or unprotected attributes
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EnvelopedData {
    version: u8,
    /// SET OF RecipientInfo
    recipient_infos: Any,
    encrypted_content_info: EncryptedContentInfo,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct KeyTransRecipientInfo {
    version: u8,
    rid: Any,
    key_encryption_algorithm: AlgorithmIdentifierOwned,
    encrypted_key: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EncryptedContentInfo {
    content_type: ObjectIdentifier,
    content_encryption_algorithm: AlgorithmIdentifierOwned,
    /// `[0] IMPLICIT OCTET STRING`, primitive or constructed
    encrypted_content: Option<Any>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct RsaesOaepParams {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    hash_algorithm: AlgorithmIdentifierOwned,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT")]
    mask_gen_algorithm: AlgorithmIdentifierOwned,
}

/// The enclave's RSA key pair for receiving recipient envelopes
///
/// Generated once per process and never exported; its public half goes into
/// every `getAttestation` document.
pub struct TransportKey {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl TransportKey {
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, TRANSPORT_KEY_BITS)
            .map_err(|e| EnclaveError::Crypto(format!("Failed to generate transport key: {}", e)))?;
        let public_der = private
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| EnclaveError::Crypto(format!("Failed to encode transport key: {}", e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public_der,
        })
    }

    /// SubjectPublicKeyInfo, DER
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Opens an envelope addressed to this key and returns its payload
    pub fn unwrap(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let der = ber_to_der(envelope)?;
        let content_info = ContentInfo::from_der(&der).map_err(decode_error)?;
        if content_info.content_type != ID_ENVELOPED_DATA {
            return Err(EnclaveError::Decode(format!(
                "expected EnvelopedData, got content type {}",
                content_info.content_type
            )));
        }
        let enveloped: EnvelopedData = content_info.content.decode_as().map_err(decode_error)?;

        let content_key = self.unwrap_content_key(&enveloped.recipient_infos)?;
        let info = enveloped.encrypted_content_info;
        if info.content_encryption_algorithm.oid != ID_AES256_CBC {
            return Err(EnclaveError::Decode(format!(
                "unsupported content encryption {}",
                info.content_encryption_algorithm.oid
            )));
        }
        let iv: OctetString = info
            .content_encryption_algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| EnclaveError::Decode("missing AES-CBC IV".to_string()))?
            .decode_as()
            .map_err(decode_error)?;
        let ciphertext = encrypted_content(info.encrypted_content.as_ref())?;

        Aes256CbcDec::new_from_slices(&content_key, iv.as_bytes())
            .map_err(|e| EnclaveError::Decode(format!("AES-CBC parameters: {}", e)))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| EnclaveError::Authentication)
    }

    fn unwrap_content_key(&self, recipient_infos: &Any) -> Result<Vec<u8>> {
        if recipient_infos.tag() != Tag::Set {
            return Err(EnclaveError::Decode("recipientInfos is not a SET".to_string()));
        }

        let mut reader = SliceReader::new(recipient_infos.value()).map_err(decode_error)?;
        while !reader.is_finished() {
            let recipient = match KeyTransRecipientInfo::decode(&mut reader) {
                Ok(recipient) => recipient,
                // other RecipientInfo choices are tagged and cannot be for an RSA key
                Err(_) => break,
            };
            if recipient.key_encryption_algorithm.oid != ID_RSAES_OAEP {
                debug!(
                    algorithm = %recipient.key_encryption_algorithm.oid,
                    "Skipping recipient with unsupported key encryption"
                );
                continue;
            }
            if let Ok(key) = self.private.decrypt_blinded(
                &mut OsRng,
                Oaep::new::<Sha256>(),
                recipient.encrypted_key.as_bytes(),
            ) {
                if key.len() == AES_KEY_LEN {
                    return Ok(key);
                }
            }
        }
        Err(EnclaveError::Authentication)
    }
}

/// Wraps `payload` for the holder of the RSA key `recipient_spki` (DER)
///
/// Produces the same structure KMS returns as `CiphertextForRecipient`.
pub fn seal_for_recipient(recipient_spki: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let recipient = RsaPublicKey::from_public_key_der(recipient_spki)
        .map_err(|e| EnclaveError::Crypto(format!("recipient key: {}", e)))?;

    let mut content_key = [0u8; AES_KEY_LEN];
    let mut iv = [0u8; AES_IV_LEN];
    OsRng.fill_bytes(&mut content_key);
    OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&content_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(payload);
    let encrypted_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)
        .map_err(|e| EnclaveError::Crypto(format!("wrapping content key: {}", e)))?;

    let sha256 = AlgorithmIdentifierOwned {
        oid: ID_SHA256,
        parameters: None,
    };
    let oaep_params = RsaesOaepParams {
        hash_algorithm: sha256.clone(),
        mask_gen_algorithm: AlgorithmIdentifierOwned {
            oid: ID_MGF1,
            parameters: Some(Any::encode_from(&sha256).map_err(encode_error)?),
        },
    };

    let subject_key_id = Sha256::digest(recipient_spki);
    let recipient_info = KeyTransRecipientInfo {
        version: 2,
        rid: Any::new(
            Tag::ContextSpecific {
                constructed: false,
                number: TagNumber::N0,
            },
            &subject_key_id[..20],
        )
        .map_err(encode_error)?,
        key_encryption_algorithm: AlgorithmIdentifierOwned {
            oid: ID_RSAES_OAEP,
            parameters: Some(Any::encode_from(&oaep_params).map_err(encode_error)?),
        },
        encrypted_key: OctetString::new(encrypted_key).map_err(encode_error)?,
    };

    let enveloped = EnvelopedData {
        version: 2,
        recipient_infos: Any::new(Tag::Set, recipient_info.to_der().map_err(encode_error)?)
            .map_err(encode_error)?,
        encrypted_content_info: EncryptedContentInfo {
            content_type: ID_DATA,
            content_encryption_algorithm: AlgorithmIdentifierOwned {
                oid: ID_AES256_CBC,
                parameters: Some(
                    Any::encode_from(&OctetString::new(iv.to_vec()).map_err(encode_error)?)
                        .map_err(encode_error)?,
                ),
            },
            encrypted_content: Some(
                Any::new(
                    Tag::ContextSpecific {
                        constructed: false,
                        number: TagNumber::N0,
                    },
                    ciphertext,
                )
                .map_err(encode_error)?,
            ),
        },
    };

    ContentInfo {
        content_type: ID_ENVELOPED_DATA,
        content: Any::encode_from(&enveloped).map_err(encode_error)?,
    }
    .to_der()
    .map_err(encode_error)
}

fn encrypted_content(content: Option<&Any>) -> Result<Vec<u8>> {
    let content = content.ok_or_else(|| EnclaveError::Decode("missing encrypted content".to_string()))?;
    match content.tag() {
        Tag::ContextSpecific {
            constructed: false,
            number: TagNumber::N0,
        } => Ok(content.value().to_vec()),
        Tag::ContextSpecific {
            constructed: true,
            number: TagNumber::N0,
        } => {
            let mut reader = SliceReader::new(content.value()).map_err(decode_error)?;
            let mut joined = Vec::new();
            while !reader.is_finished() {
                let chunk = OctetString::decode(&mut reader).map_err(decode_error)?;
                joined.extend_from_slice(chunk.as_bytes());
            }
            Ok(joined)
        }
        tag => Err(EnclaveError::Decode(format!(
            "unexpected encrypted content tag {}",
            tag
        ))),
    }
}

/// Rewrites BER indefinite lengths and constructed OCTET STRINGs as DER
fn ber_to_der(input: &[u8]) -> Result<Vec<u8>> {
    let (element, rest) = ber_element(input, 0)?;
    if !rest.is_empty() {
        return Err(EnclaveError::Decode("trailing bytes after envelope".to_string()));
    }
    let mut out = Vec::with_capacity(input.len());
    element.write(&mut out);
    Ok(out)
}

const MAX_BER_DEPTH: usize = 32;
const OCTET_STRING: u8 = 0x04;
const CONSTRUCTED: u8 = 0x20;

struct BerElement {
    tag: Vec<u8>,
    content: Vec<u8>,
}

impl BerElement {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tag);
        let len = self.content.len();
        if len < 0x80 {
            out.push(len as u8);
        } else {
            let bytes = len.to_be_bytes();
            let skip = bytes.iter().take_while(|b| **b == 0).count();
            out.push(0x80 | (bytes.len() - skip) as u8);
            out.extend_from_slice(&bytes[skip..]);
        }
        out.extend_from_slice(&self.content);
    }
}

fn ber_element(input: &[u8], depth: usize) -> Result<(BerElement, &[u8])> {
    if depth > MAX_BER_DEPTH {
        return Err(EnclaveError::Decode("envelope nested too deeply".to_string()));
    }
    let truncated = || EnclaveError::Decode("truncated envelope".to_string());

    let first = *input.first().ok_or_else(truncated)?;
    let mut tag_len = 1;
    if first & 0x1f == 0x1f {
        loop {
            let byte = *input.get(tag_len).ok_or_else(truncated)?;
            tag_len += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }
    let mut tag = input[..tag_len].to_vec();
    let constructed = first & CONSTRUCTED != 0;

    let length_byte = *input.get(tag_len).ok_or_else(truncated)?;
    let mut rest = &input[tag_len + 1..];

    let definite_len = match length_byte {
        0x80 => None,
        len if len < 0x80 => Some(len as usize),
        len => {
            let count = (len & 0x7f) as usize;
            if count > std::mem::size_of::<usize>() || rest.len() < count {
                return Err(truncated());
            }
            let value = rest[..count]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            rest = &rest[count..];
            Some(value)
        }
    };

    if !constructed {
        let len = definite_len
            .ok_or_else(|| EnclaveError::Decode("indefinite length on primitive".to_string()))?;
        if rest.len() < len {
            return Err(truncated());
        }
        let element = BerElement {
            tag,
            content: rest[..len].to_vec(),
        };
        return Ok((element, &rest[len..]));
    }

    let mut children = Vec::new();
    let remainder = match definite_len {
        Some(len) => {
            if rest.len() < len {
                return Err(truncated());
            }
            let (mut body, after) = rest.split_at(len);
            while !body.is_empty() {
                let (child, next) = ber_element(body, depth + 1)?;
                children.push(child);
                body = next;
            }
            after
        }
        None => loop {
            if rest.starts_with(&[0, 0]) {
                break &rest[2..];
            }
            if rest.is_empty() {
                return Err(truncated());
            }
            let (child, next) = ber_element(rest, depth + 1)?;
            children.push(child);
            rest = next;
        },
    };

    let mut content = Vec::new();
    if first == OCTET_STRING | CONSTRUCTED {
        tag = vec![OCTET_STRING];
        for child in &children {
            content.extend_from_slice(&child.content);
        }
    } else {
        for child in &children {
            child.write(&mut content);
        }
    }

    Ok((BerElement { tag, content }, remainder))
}

fn decode_error(e: der::Error) -> EnclaveError {
    EnclaveError::Decode(format!("malformed recipient envelope: {}", e))
}

fn encode_error(e: der::Error) -> EnclaveError {
    EnclaveError::Crypto(format!("encoding recipient envelope: {}", e))
}
