//! AWS KMS custodian
//!
//! Inside the enclave the client is built with the caller's short-lived
//! credentials and the vsock connector; on the parent instance it uses the
//! default credential chain and the SDK's own HTTP client.
//!
//! ## Reference
//!
//! - [AWS KMS cryptographic attestation](https://docs.aws.amazon.com/kms/latest/developerguide/services-nitro-enclaves.html)

use super::{CustodianConnector, KeyCustodian};
use crate::config::{EnclaveConfig, KEY_DESCRIPTION};
use crate::error::{EnclaveError, Result};
use crate::messages::Credentials;
use crate::policy::KeyPolicy;
use crate::vsock_transport::VsockHttpConnector;
use async_trait::async_trait;
use aws_sdk_kms::config::timeout::TimeoutConfig;
use aws_sdk_kms::config::{BehaviorVersion, Region};
use aws_sdk_kms::error::DisplayErrorContext;
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::{
    KeyAgreementAlgorithmSpec, KeyEncryptionMechanism, KeySpec, KeyUsageType, RecipientInfo,
};
use aws_sdk_kms::Client as KmsClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Credentials provider name reported by the SDK for request-scoped keys
const PROVIDER_NAME: &str = "kms-enclave-request";

pub struct KmsCustodian {
    client: KmsClient,
}

impl KmsCustodian {
    pub fn new(client: KmsClient) -> Self {
        Self { client }
    }

    /// Client routed over vsock with static credentials, for use inside the enclave
    pub fn over_vsock(region: &str, credentials: &Credentials, config: &EnclaveConfig) -> Result<Self> {
        let connector = VsockHttpConnector::new(config.kms_proxy_cid, config.kms_proxy_port)?;
        let credentials = aws_credential_types::Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.token.clone()),
            None,
            PROVIDER_NAME,
        );

        let kms_config = aws_sdk_kms::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .http_client(connector)
            .timeout_config(operation_timeout(config.custodian_timeout))
            .build();

        Ok(Self::new(KmsClient::from_conf(kms_config)))
    }

    /// Client using the default credential chain, for the parent instance
    pub async fn from_env(region: &str, timeout: Duration) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .timeout_config(operation_timeout(timeout))
            .load()
            .await;
        Self::new(KmsClient::new(&sdk_config))
    }
}

#[async_trait]
impl KeyCustodian for KmsCustodian {
    async fn create_key(&self, policy: &KeyPolicy, bypass_policy_lockout: bool) -> Result<String> {
        let policy = policy.to_json()?;
        info!(policy_len = policy.len(), "Creating KMS key");

        let response = self
            .client
            .create_key()
            .key_spec(KeySpec::EccNistP256)
            .key_usage(KeyUsageType::KeyAgreement)
            .policy(policy)
            .bypass_policy_lockout_safety_check(bypass_policy_lockout)
            .description(KEY_DESCRIPTION)
            .send()
            .await
            .map_err(custodian_error)?;

        let key_id = response
            .key_metadata()
            .map(|metadata| metadata.key_id().to_string())
            .filter(|key_id| !key_id.is_empty())
            .ok_or_else(|| EnclaveError::Custodian("CreateKey returned no key metadata".to_string()))?;

        info!(key_id = %key_id, "KMS key created");
        Ok(key_id)
    }

    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_public_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(custodian_error)?;

        let public_key = response
            .public_key()
            .ok_or_else(|| EnclaveError::Custodian("GetPublicKey returned no public key".to_string()))?;

        debug!(key_id = %key_id, public_key_len = public_key.as_ref().len(), "Fetched public key");
        Ok(public_key.as_ref().to_vec())
    }

    async fn derive_shared_secret(
        &self,
        key_id: &str,
        peer_public_key: &[u8],
        recipient_attestation: &[u8],
    ) -> Result<Vec<u8>> {
        info!(
            key_id = %key_id,
            attestation_len = recipient_attestation.len(),
            "Deriving shared secret for attested recipient"
        );

        let recipient = RecipientInfo::builder()
            .attestation_document(Blob::new(recipient_attestation))
            .key_encryption_algorithm(KeyEncryptionMechanism::RsaesOaepSha256)
            .build();

        let response = self
            .client
            .derive_shared_secret()
            .key_id(key_id)
            .key_agreement_algorithm(KeyAgreementAlgorithmSpec::Ecdh)
            .public_key(Blob::new(peer_public_key))
            .recipient(recipient)
            .send()
            .await
            .map_err(custodian_error)?;

        // With a recipient, KMS never returns SharedSecret in the clear
        let wrapped = response.ciphertext_for_recipient().ok_or_else(|| {
            EnclaveError::Custodian("DeriveSharedSecret returned no CiphertextForRecipient".to_string())
        })?;

        debug!(wrapped_len = wrapped.as_ref().len(), "Received ciphertext for recipient");
        Ok(wrapped.as_ref().to_vec())
    }
}

/// Builds KMS sessions inside the enclave from the credentials of a CreateKey request
pub struct KmsConnector {
    config: EnclaveConfig,
}

impl KmsConnector {
    pub fn new(config: EnclaveConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CustodianConnector for KmsConnector {
    async fn connect(&self, region: &str, credentials: &Credentials) -> Result<Arc<dyn KeyCustodian>> {
        if region.is_empty() {
            return Err(EnclaveError::Config("region must not be empty".to_string()));
        }
        Ok(Arc::new(KmsCustodian::over_vsock(region, credentials, &self.config)?))
    }
}

fn operation_timeout(timeout: Duration) -> TimeoutConfig {
    TimeoutConfig::builder().operation_timeout(timeout).build()
}

fn custodian_error(e: impl std::error::Error) -> EnclaveError {
    EnclaveError::Custodian(DisplayErrorContext(&e).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_requires_region() {
        let connector = KmsConnector::new(EnclaveConfig::default());
        let credentials = Credentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            token: "token".to_string(),
        };
        assert!(matches!(
            connector.connect("", &credentials).await,
            Err(EnclaveError::Config(_))
        ));
        assert!(connector.connect("us-east-1", &credentials).await.is_ok());
    }
}
