//! Secure channel codec
//!
//! A content encryption key (CEK) is derived from an ECDH P-256 shared secret
//! with HKDF-SHA256 under a fixed salt and empty info, then used for
//! AES-256-GCM with a random 96-bit nonce and no associated data. The caller
//! computes the shared secret locally; the enclave only ever receives it
//! wrapped by KMS (see [`envelope`]).

pub mod envelope;

pub use envelope::{seal_for_recipient, TransportKey};

use crate::config::HKDF_SALT;
use crate::error::{EnclaveError, Result};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{agreement, digest, hkdf};
use std::collections::HashSet;

/// Uncompressed SEC1 encoding of a P-256 point
pub const P256_UNCOMPRESSED_LEN: usize = 65;

/// AES-256-GCM key derived from a shared secret
///
/// Tracks the nonces it sealed under and refuses to seal twice under one.
pub struct ContentKey {
    key: LessSafeKey,
    used_nonces: HashSet<[u8; NONCE_LEN]>,
}

impl ContentKey {
    /// HKDF-SHA256(salt = `HKDF_SALT`, info = empty) to a 256-bit key
    pub fn derive(shared_secret: &[u8]) -> Result<Self> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(shared_secret);
        let okm = prk
            .expand(&[], &AES_256_GCM)
            .map_err(|_| EnclaveError::Crypto("Failed to derive content key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            used_nonces: HashSet::new(),
        })
    }

    /// Seals under a fresh random nonce and returns `(nonce, ciphertext || tag)`
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        let mut nonce = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce)
            .map_err(|_| EnclaveError::Crypto("Failed to generate nonce".to_string()))?;
        let ciphertext = self.seal_with_nonce(nonce, plaintext)?;
        Ok((nonce, ciphertext))
    }

    pub fn seal_with_nonce(&mut self, nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        if !self.used_nonces.insert(nonce) {
            return Err(EnclaveError::NonceReuse);
        }
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| EnclaveError::Crypto("AES-GCM seal failed".to_string()))?;
        Ok(in_out)
    }

    /// Opens `ciphertext || tag`; any mismatch, including a malformed nonce, is `Authentication`
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| EnclaveError::Authentication)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EnclaveError::Authentication)?;
        Ok(plaintext.to_vec())
    }
}

/// Caller side of the key agreement
///
/// Generates an ephemeral P-256 key, runs ECDH against `peer_sec1` and
/// returns the ephemeral public key (SPKI DER, as KMS expects it) with the
/// derived content key.
pub fn agree_ephemeral(peer_sec1: &[u8]) -> Result<(Vec<u8>, ContentKey)> {
    let rng = SystemRandom::new();
    let private = agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, &rng)
        .map_err(|_| EnclaveError::Crypto("Failed to generate ephemeral key".to_string()))?;
    let public = private
        .compute_public_key()
        .map_err(|_| EnclaveError::Crypto("Failed to compute ephemeral public key".to_string()))?;

    let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, peer_sec1);
    let key = agreement::agree_ephemeral(private, &peer, ContentKey::derive)
        .map_err(|_| EnclaveError::Crypto("ECDH with the custodian key failed".to_string()))??;

    Ok((sec1_to_spki(public.as_ref())?, key))
}

/// SHA-256 over the exact bytes of a request frame
pub fn request_hash(frame: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, frame).as_ref().to_vec()
}

/// P-256 SubjectPublicKeyInfo (DER) to an uncompressed SEC1 point
pub fn spki_to_sec1(spki: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_public_key_der(spki)
        .map_err(|e| EnclaveError::Crypto(format!("not a P-256 public key: {}", e)))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

/// Uncompressed (or compressed) SEC1 P-256 point to SubjectPublicKeyInfo (DER)
pub fn sec1_to_spki(sec1: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_sec1_bytes(sec1)
        .map_err(|e| EnclaveError::Crypto(format!("not a P-256 point: {}", e)))?;
    key.to_public_key_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| EnclaveError::Crypto(format!("encoding P-256 key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdh::diffie_hellman;
    use p256::SecretKey;
    use rand::rngs::OsRng;
    use ring::hmac;

    #[test]
    fn test_seal_open() {
        let secret = [7u8; 32];
        let mut sender = ContentKey::derive(&secret).unwrap();
        let receiver = ContentKey::derive(&secret).unwrap();

        let (nonce, ciphertext) = sender.seal(b"banana").unwrap();
        assert_eq!(ciphertext.len(), b"banana".len() + 16);
        assert_eq!(receiver.open(&nonce, &ciphertext).unwrap(), b"banana");
    }

    #[test]
    fn test_derive_matches_rfc5869() {
        let secret = [5u8; 32];

        // single-block expansion: T(1) = HMAC(PRK, info || 0x01)
        let prk = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, HKDF_SALT), &secret);
        let okm = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, prk.as_ref()), &[0x01]);
        let expected = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, okm.as_ref()).unwrap());

        let mut in_out = b"banana".to_vec();
        expected
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key([0u8; NONCE_LEN]),
                Aad::empty(),
                &mut in_out,
            )
            .unwrap();
        let key = ContentKey::derive(&secret).unwrap();
        assert_eq!(key.open(&[0u8; NONCE_LEN], &in_out).unwrap(), b"banana");
    }

    #[test]
    fn test_different_secret_fails() {
        let mut sender = ContentKey::derive(&[1u8; 32]).unwrap();
        let receiver = ContentKey::derive(&[2u8; 32]).unwrap();
        let (nonce, ciphertext) = sender.seal(b"banana").unwrap();
        assert!(matches!(
            receiver.open(&nonce, &ciphertext),
            Err(EnclaveError::Authentication)
        ));
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut key = ContentKey::derive(&[3u8; 32]).unwrap();
        let (nonce, ciphertext) = key.seal(b"banana").unwrap();

        let mut flipped = ciphertext.clone();
        flipped[0] ^= 1;
        assert!(matches!(key.open(&nonce, &flipped), Err(EnclaveError::Authentication)));

        let mut other_nonce = nonce;
        other_nonce[11] ^= 1;
        assert!(matches!(
            key.open(&other_nonce, &ciphertext),
            Err(EnclaveError::Authentication)
        ));

        assert!(matches!(
            key.open(&nonce[..8], &ciphertext),
            Err(EnclaveError::Authentication)
        ));
        assert!(matches!(
            key.open(&nonce, &ciphertext[..ciphertext.len() - 1]),
            Err(EnclaveError::Authentication)
        ));
    }

    #[test]
    fn test_nonce_reuse_fails_closed() {
        let mut key = ContentKey::derive(&[4u8; 32]).unwrap();
        key.seal_with_nonce([9u8; NONCE_LEN], b"one").unwrap();
        assert!(matches!(
            key.seal_with_nonce([9u8; NONCE_LEN], b"two"),
            Err(EnclaveError::NonceReuse)
        ));
    }

    #[test]
    fn test_agreement_matches_recipient_side() {
        let custodian = SecretKey::random(&mut OsRng);
        let custodian_sec1 = custodian.public_key().to_encoded_point(false);

        let (ephemeral_spki, mut sender) = agree_ephemeral(custodian_sec1.as_bytes()).unwrap();
        let (nonce, ciphertext) = sender.seal(b"banana").unwrap();

        let ephemeral = p256::PublicKey::from_public_key_der(&ephemeral_spki).unwrap();
        let shared = diffie_hellman(custodian.to_nonzero_scalar(), ephemeral.as_affine());
        let receiver = ContentKey::derive(shared.raw_secret_bytes()).unwrap();
        assert_eq!(receiver.open(&nonce, &ciphertext).unwrap(), b"banana");
    }

    #[test]
    fn test_key_formats() {
        let key = SecretKey::random(&mut OsRng).public_key();
        let sec1 = key.to_encoded_point(false).as_bytes().to_vec();
        assert_eq!(sec1.len(), P256_UNCOMPRESSED_LEN);

        let spki = sec1_to_spki(&sec1).unwrap();
        assert_eq!(spki_to_sec1(&spki).unwrap(), sec1);
        assert!(spki_to_sec1(&sec1).is_err());
    }

    #[test]
    fn test_request_hash_covers_every_byte() {
        let frame = br#"{"getAttestation":{}}"#;
        assert_eq!(request_hash(frame).len(), 32);
        assert_ne!(request_hash(frame), request_hash(br#"{"getAttestation":{} }"#));
    }
}
