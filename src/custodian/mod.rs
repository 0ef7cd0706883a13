//! Key custodians: the service holding the enclave's key-agreement key
//!
//! [`KmsCustodian`] talks to AWS KMS; [`MemoryCustodian`] models the same
//! contract in process, including policy enforcement, for local runs and
//! tests. Custodian errors carry the service's message verbatim.

mod kms;
mod memory;

pub use kms::{KmsConnector, KmsCustodian};
pub use memory::MemoryCustodian;

use crate::error::Result;
use crate::messages::Credentials;
use crate::policy::KeyPolicy;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait KeyCustodian: Send + Sync {
    /// Creates a P-256 key-agreement key with `policy` attached; returns its id
    async fn create_key(&self, policy: &KeyPolicy, bypass_policy_lockout: bool) -> Result<String>;

    /// Public half of `key_id` as SubjectPublicKeyInfo DER
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>>;

    /// ECDH between `key_id` and `peer_public_key` (SPKI DER), wrapped for the
    /// recipient attested by `recipient_attestation`
    async fn derive_shared_secret(
        &self,
        key_id: &str,
        peer_public_key: &[u8],
        recipient_attestation: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Opens a custodian session for the credentials carried by a request
#[async_trait]
pub trait CustodianConnector: Send + Sync {
    async fn connect(&self, region: &str, credentials: &Credentials) -> Result<Arc<dyn KeyCustodian>>;
}
