//! Request handlers of the trusted code
//!
//! Every successful response is a fresh attestation document:
//! - `createKey`: user data `{keyId, pubKey, region}` binding this code image
//!   to a KMS key that only this code image may use for key agreement
//! - `getAttestation`: embeds the transport public key, so KMS can wrap its
//!   `DeriveSharedSecret` output for this process
//! - `decrypt`: user data `{requestHash, count}` binding the result to the
//!   exact request bytes it was computed from

use crate::attestation::{code_measurement, AttestationIssuer, AttestationRequest};
use crate::channel::{request_hash, spki_to_sec1, ContentKey, TransportKey};
use crate::custodian::CustodianConnector;
use crate::error::{EnclaveError, Result};
use crate::messages::{
    CreateKeyRequest, CreateKeyUserData, DecryptRequest, DecryptUserData, Request, Response,
};
use crate::policy::{account_root_arn, enclave_role_arn, KeyPolicy};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Character counted in decrypted plaintexts
const COUNTED_CHAR: u8 = b'a';

/// Fallback when even the error response cannot be serialized
const INTERNAL_ERROR_FRAME: &[u8] = br#"{"error":"Internal error"}"#;

/// Shared by all sessions; holds no per-session state
pub struct EnclaveService {
    issuer: Arc<dyn AttestationIssuer>,
    transport_key: Arc<TransportKey>,
    connector: Arc<dyn CustodianConnector>,
}

impl EnclaveService {
    pub fn new(
        issuer: Arc<dyn AttestationIssuer>,
        transport_key: Arc<TransportKey>,
        connector: Arc<dyn CustodianConnector>,
    ) -> Self {
        Self {
            issuer,
            transport_key,
            connector,
        }
    }

    /// Handles one request frame (without its newline) and returns the response frame
    ///
    /// Never fails: every error becomes a response carrying only `error`.
    pub async fn handle(&self, frame: &[u8]) -> Vec<u8> {
        let response = match self.process(frame).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Request failed");
                Response::Error(e.to_string())
            }
        };

        response
            .to_vec()
            .unwrap_or_else(|_| INTERNAL_ERROR_FRAME.to_vec())
    }

    async fn process(&self, frame: &[u8]) -> Result<Response> {
        let request = Request::from_slice(frame)?;
        let kind = request.kind();
        debug!(kind = %kind, frame_len = frame.len(), "Processing request");

        let attestation = match request {
            Request::CreateKey(req) => self.create_key(req).await?,
            Request::GetAttestation(_) => self.get_attestation()?,
            Request::Decrypt(req) => self.decrypt(frame, &req)?,
        };

        info!(kind = %kind, attestation_len = attestation.len(), "Request complete");
        Ok(Response::for_kind(kind, attestation))
    }

    /// Provisions the KMS key bound to this code image
    pub async fn create_key(&self, request: CreateKeyRequest) -> Result<Vec<u8>> {
        for (field, value) in [
            ("region", &request.region),
            ("accountId", &request.account_id),
            ("awsIamRole", &request.aws_iam_role),
        ] {
            if value.is_empty() {
                return Err(EnclaveError::Decode(format!("createKey: {} must not be empty", field)));
            }
        }
        info!(
            region = %request.region,
            account_id = %request.account_id,
            role = %request.aws_iam_role,
            "Creating enclave key"
        );

        let pcr0 = code_measurement(self.issuer.as_ref())?;
        let policy = KeyPolicy::for_enclave(
            &enclave_role_arn(&request.account_id, &request.aws_iam_role),
            &account_root_arn(&request.account_id),
            &pcr0,
        );

        let custodian = self
            .connector
            .connect(&request.region, &request.credentials)
            .await?;
        // the policy already denies everything but the enclave and the account root
        let key_id = custodian.create_key(&policy, true).await?;
        let public_key = custodian.get_public_key(&key_id).await?;

        let user_data = CreateKeyUserData {
            pub_key: spki_to_sec1(&public_key)?,
            key_id,
            region: request.region,
        };
        info!(key_id = %user_data.key_id, pcr0 = %hex::encode(&pcr0), "Enclave key ready");

        self.issuer.attest(AttestationRequest {
            user_data: Some(serde_json::to_vec(&user_data)?),
            ..Default::default()
        })
    }

    /// Fresh attestation over the transport key, for `DeriveSharedSecret`
    pub fn get_attestation(&self) -> Result<Vec<u8>> {
        self.issuer.attest(AttestationRequest {
            public_key: Some(self.transport_key.public_key_der().to_vec()),
            ..Default::default()
        })
    }

    /// Opens a sealed message; `frame` is the exact request line it arrived in
    pub fn decrypt(&self, frame: &[u8], request: &DecryptRequest) -> Result<Vec<u8>> {
        let shared_secret = self
            .transport_key
            .unwrap(&request.encrypted_shared_secret_or_cek)?;
        let key = ContentKey::derive(&shared_secret)?;
        let plaintext = key.open(&request.nonce, &request.ciphertext)?;

        let user_data = DecryptUserData {
            request_hash: request_hash(frame),
            count: plaintext.iter().filter(|&&b| b == COUNTED_CHAR).count() as u64,
        };
        debug!(
            request_hash = %hex::encode(&user_data.request_hash),
            count = user_data.count,
            "Decrypted message"
        );

        self.issuer.attest(AttestationRequest {
            user_data: Some(serde_json::to_vec(&user_data)?),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{AttestationDocument, LocalIssuer, Verifier};
    use crate::custodian::MemoryCustodian;
    use crate::messages::{Credentials, MessageKind};
    use std::time::SystemTime;

    const PCR0: [u8; 48] = [0x42; 48];

    struct Fixture {
        issuer: Arc<LocalIssuer>,
        service: EnclaveService,
    }

    fn fixture() -> Fixture {
        let issuer = Arc::new(LocalIssuer::new(PCR0.to_vec()).unwrap());
        let verifier = Verifier::new(issuer.root_certificate_der().to_vec());
        let custodian = MemoryCustodian::new(
            enclave_role_arn("123456789012", "nitro-test-iam-role"),
            verifier,
        );
        let service = EnclaveService::new(
            issuer.clone(),
            Arc::new(TransportKey::generate().unwrap()),
            Arc::new(custodian),
        );
        Fixture { issuer, service }
    }

    fn verify(fixture: &Fixture, attestation: &[u8]) -> AttestationDocument {
        Verifier::new(fixture.issuer.root_certificate_der().to_vec())
            .with_expected_measurement(PCR0.to_vec())
            .verify(attestation, SystemTime::now())
            .unwrap()
    }

    fn create_key_request(account_id: &str) -> Vec<u8> {
        format!(
            r#"{{"createKey":{{"region":"us-east-1","accountId":"{}","awsIamRole":"nitro-test-iam-role","credentials":{{"accessKeyId":"AKIA","secretAccessKey":"secret","token":"token"}}}}}}"#,
            account_id
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_create_key() {
        let fixture = fixture();
        let response = fixture.service.handle(&create_key_request("123456789012")).await;
        let attestation = Response::from_slice(&response)
            .unwrap()
            .into_attestation(MessageKind::CreateKey)
            .unwrap();

        let doc = verify(&fixture, &attestation);
        let user_data: CreateKeyUserData = doc.user_data_as().unwrap();
        assert!(!user_data.key_id.is_empty());
        assert_eq!(user_data.pub_key.len(), 65);
        assert_eq!(user_data.pub_key[0], 0x04);
        assert_eq!(user_data.region, "us-east-1");
    }

    #[tokio::test]
    async fn test_get_attestation_embeds_transport_key() {
        let fixture = fixture();
        let response = fixture.service.handle(br#"{"getAttestation":{}}"#).await;
        let attestation = Response::from_slice(&response)
            .unwrap()
            .into_attestation(MessageKind::GetAttestation)
            .unwrap();

        let doc = verify(&fixture, &attestation);
        assert_eq!(
            doc.public_key.as_deref(),
            Some(fixture.service.transport_key.public_key_der())
        );
        assert_eq!(doc.user_data, None);
        assert_eq!(doc.nonce, None);
    }

    #[tokio::test]
    async fn test_malformed_requests_become_errors() {
        let fixture = fixture();
        for frame in [
            &b"not json"[..],
            br#"{}"#,
            br#"{"getAttestation":{},"decrypt":{"encryptedSharedSecretOrCek":"","nonce":"","ciphertext":""}}"#,
            br#"{"unknown":{}}"#,
        ] {
            let response = Response::from_slice(&fixture.service.handle(frame).await).unwrap();
            assert!(matches!(response, Response::Error(_)), "{:?}", response);
        }
    }

    #[tokio::test]
    async fn test_custodian_error_is_verbatim() {
        let fixture = fixture();
        // a different account's role is not the principal the custodian authenticates
        let response = fixture.service.handle(&create_key_request("999999999999")).await;
        let Response::Error(error) = Response::from_slice(&response).unwrap() else {
            panic!("expected an error response");
        };
        assert!(error.starts_with("AccessDeniedException: User: "), "{}", error);
    }

    #[tokio::test]
    async fn test_garbage_envelope_is_rejected() {
        let fixture = fixture();
        let request = Request::Decrypt(DecryptRequest {
            encrypted_shared_secret_or_cek: vec![0x30, 0x03, 0x02, 0x01, 0x00],
            nonce: vec![0; 12],
            ciphertext: vec![0; 32],
        });
        let response = fixture.service.handle(&request.to_vec().unwrap()).await;
        assert!(matches!(
            Response::from_slice(&response).unwrap(),
            Response::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_fields_are_rejected() {
        let fixture = fixture();
        let result = fixture
            .service
            .create_key(CreateKeyRequest {
                region: String::new(),
                account_id: "123456789012".to_string(),
                aws_iam_role: "nitro-test-iam-role".to_string(),
                credentials: Credentials {
                    access_key_id: "AKIA".to_string(),
                    secret_access_key: "secret".to_string(),
                    token: "token".to_string(),
                },
            })
            .await;
        assert!(matches!(result, Err(EnclaveError::Decode(_))));
    }
}
