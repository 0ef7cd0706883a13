//! In-process key custodian
//!
//! Holds P-256 keys in memory and enforces their key policies the way KMS
//! does for the three operations the enclave uses. A recipient attestation is
//! verified against the pinned root before its PCR0 is matched against the
//! policy condition.

use super::{CustodianConnector, KeyCustodian};
use crate::attestation::Verifier;
use crate::channel::seal_for_recipient;
use crate::error::{EnclaveError, Result};
use crate::messages::Credentials;
use crate::policy::{KeyPolicy, ACTION_DERIVE_SHARED_SECRET, ACTION_GET_PUBLIC_KEY, RECIPIENT_PCR0};
use async_trait::async_trait;
use p256::ecdh::diffie_hellman;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{info, warn};

const ACTION_PUT_KEY_POLICY: &str = "kms:PutKeyPolicy";

struct StoredKey {
    secret: SecretKey,
    policy: KeyPolicy,
}

/// Cloning shares the key store
#[derive(Clone)]
pub struct MemoryCustodian {
    principal: String,
    verifier: Arc<Verifier>,
    keys: Arc<Mutex<HashMap<String, StoredKey>>>,
}

impl MemoryCustodian {
    /// Custodian authenticating every call as `principal`, trusting recipient
    /// attestations that chain to `verifier`'s root
    pub fn new(principal: impl Into<String>, verifier: Verifier) -> Self {
        Self {
            principal: principal.into(),
            verifier: Arc::new(verifier),
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self, key_id: &str) -> Option<KeyPolicy> {
        self.lock().ok()?.get(key_id).map(|key| key.policy.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredKey>>> {
        self.keys
            .lock()
            .map_err(|_| EnclaveError::Custodian("KMSInternalException: key store poisoned".to_string()))
    }

    fn authorize(
        &self,
        key_id: &str,
        action: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<SecretKey> {
        let keys = self.lock()?;
        let key = keys
            .get(key_id)
            .ok_or_else(|| EnclaveError::Custodian(format!("NotFoundException: Key '{}' does not exist", key_id)))?;
        if !key.policy.allows(&self.principal, action, context) {
            warn!(key_id = %key_id, action = %action, "Key policy denied request");
            return Err(EnclaveError::Custodian(format!(
                "AccessDeniedException: User: {} is not authorized to perform: {} on resource: {} because no resource-based policy allows the {} action",
                self.principal, action, key_id, action
            )));
        }
        Ok(key.secret.clone())
    }
}

#[async_trait]
impl KeyCustodian for MemoryCustodian {
    async fn create_key(&self, policy: &KeyPolicy, bypass_policy_lockout: bool) -> Result<String> {
        if !bypass_policy_lockout && !policy.allows(&self.principal, ACTION_PUT_KEY_POLICY, &BTreeMap::new()) {
            return Err(EnclaveError::Custodian(
                "MalformedPolicyDocumentException: The new key policy will not allow you to update the key policy in the future."
                    .to_string(),
            ));
        }

        let mut id = [0u8; 16];
        OsRng.fill_bytes(&mut id);
        let key_id = hex::encode(id);

        self.lock()?.insert(
            key_id.clone(),
            StoredKey {
                secret: SecretKey::random(&mut OsRng),
                policy: policy.clone(),
            },
        );

        info!(key_id = %key_id, "In-memory key created");
        Ok(key_id)
    }

    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        let secret = self.authorize(key_id, ACTION_GET_PUBLIC_KEY, &BTreeMap::new())?;
        secret
            .public_key()
            .to_public_key_der()
            .map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| EnclaveError::Custodian(format!("KMSInternalException: {}", e)))
    }

    async fn derive_shared_secret(
        &self,
        key_id: &str,
        peer_public_key: &[u8],
        recipient_attestation: &[u8],
    ) -> Result<Vec<u8>> {
        let recipient = self
            .verifier
            .verify(recipient_attestation, SystemTime::now())
            .map_err(|e| EnclaveError::Custodian(format!("ValidationException: invalid recipient attestation: {}", e)))?;
        let recipient_key = recipient.public_key.as_deref().ok_or_else(|| {
            EnclaveError::Custodian("ValidationException: recipient attestation has no public key".to_string())
        })?;
        let pcr0 = recipient
            .code_measurement()
            .map_err(|e| EnclaveError::Custodian(format!("ValidationException: {}", e)))?;

        let mut context = BTreeMap::new();
        context.insert(RECIPIENT_PCR0.to_string(), hex::encode(pcr0));
        let secret = self.authorize(key_id, ACTION_DERIVE_SHARED_SECRET, &context)?;

        let peer = PublicKey::from_public_key_der(peer_public_key).map_err(|e| {
            EnclaveError::Custodian(format!("ValidationException: invalid peer public key: {}", e))
        })?;
        let shared = diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

        seal_for_recipient(recipient_key, shared.raw_secret_bytes())
            .map_err(|e| EnclaveError::Custodian(format!("KMSInternalException: {}", e)))
    }
}

#[async_trait]
impl CustodianConnector for MemoryCustodian {
    async fn connect(&self, _region: &str, _credentials: &Credentials) -> Result<Arc<dyn KeyCustodian>> {
        Ok(Arc::new(self.clone()))
    }
}
