//! Caller-side flows, run on the parent instance
//!
//! ## Decrypt flow
//!
//! 1. verify the stored `createKey` attestation and read `{keyId, pubKey, region}`
//! 2. ask the enclave for a fresh attestation over its transport key
//! 3. call `DeriveSharedSecret` with the caller's ephemeral key, wrapped for
//!    that attestation; KMS checks PCR0 against the key policy
//! 4. send the wrapped secret, nonce and ciphertext to the enclave
//! 5. verify the response attestation (same root, same PCR0) and check that its
//!    request hash covers the exact bytes sent

use crate::attestation::{AttestationDocument, Verifier};
use crate::channel::{agree_ephemeral, request_hash, P256_UNCOMPRESSED_LEN};
use crate::config::MAX_FRAME_LEN;
use crate::custodian::KeyCustodian;
use crate::error::{EnclaveError, Result};
use crate::messages::{
    CreateKeyRequest, CreateKeyUserData, DecryptRequest, DecryptUserData, GetAttestationRequest,
    MessageKind, Request, Response, SealedMessage,
};
use crate::server::read_frame;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::{debug, info, warn};

/// Default bound on one request/response exchange with the enclave
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Any byte stream a session can run over
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// Where the enclave listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnclaveTarget {
    Vsock { cid: u32, port: u32 },
    Tcp(SocketAddr),
}

/// One session with the enclave; requests are sent strictly one at a time
pub struct EnclaveClient {
    reader: BufReader<ReadHalf<Box<dyn SessionStream>>>,
    writer: WriteHalf<Box<dyn SessionStream>>,
    timeout: Duration,
}

impl EnclaveClient {
    pub fn new(stream: impl SessionStream + 'static, timeout: Duration) -> Self {
        let stream: Box<dyn SessionStream> = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            timeout,
        }
    }

    pub async fn connect(target: &EnclaveTarget, timeout: Duration) -> Result<Self> {
        info!(target = ?target, "Connecting to enclave");
        tokio::time::timeout(timeout, Self::open(target, timeout))
            .await
            .map_err(|_| EnclaveError::Transport(format!("connecting to {:?} timed out", target)))?
    }

    async fn open(target: &EnclaveTarget, timeout: Duration) -> Result<Self> {
        match target {
            EnclaveTarget::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                Ok(Self::new(stream, timeout))
            }
            EnclaveTarget::Vsock { cid, port } => connect_vsock(*cid, *port, timeout).await,
        }
    }

    /// Sends one request and returns the response with the exact frame bytes sent
    pub async fn send(&mut self, request: &Request) -> Result<(Response, Vec<u8>)> {
        let frame = request.to_vec()?;
        if frame.len() > MAX_FRAME_LEN {
            return Err(EnclaveError::Transport(format!(
                "{} request of {} bytes exceeds the {} byte frame limit",
                request.kind(),
                frame.len(),
                MAX_FRAME_LEN
            )));
        }
        let timeout = self.timeout;
        debug!(kind = %request.kind(), frame_len = frame.len(), "Sending request");

        let line = tokio::time::timeout(timeout, self.exchange(&frame))
            .await
            .map_err(|_| {
                EnclaveError::Transport(format!("no response within {}s", timeout.as_secs()))
            })??;

        Ok((Response::from_slice(&line)?, frame))
    }

    async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = Vec::new();
        if !read_frame(&mut self.reader, &mut line).await? {
            return Err(EnclaveError::Transport(
                "enclave closed the connection".to_string(),
            ));
        }
        Ok(line)
    }

    /// Sends `request` and extracts the attestation of a successful response
    pub async fn attestation(&mut self, request: &Request) -> Result<Vec<u8>> {
        let (response, _) = self.send(request).await?;
        response.into_attestation(request.kind())
    }
}

#[cfg(target_os = "linux")]
async fn connect_vsock(cid: u32, port: u32, timeout: Duration) -> Result<EnclaveClient> {
    use tokio_vsock::{VsockAddr, VsockStream};

    let stream = VsockStream::connect(VsockAddr::new(cid, port)).await?;
    Ok(EnclaveClient::new(stream, timeout))
}

#[cfg(not(target_os = "linux"))]
async fn connect_vsock(_cid: u32, _port: u32, _timeout: Duration) -> Result<EnclaveClient> {
    Err(EnclaveError::Config(
        "vsock is only supported on Linux".to_string(),
    ))
}

/// A verified `createKey` attestation: which key this code image owns
#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub document: AttestationDocument,
    pub user_data: CreateKeyUserData,
}

impl KeyBinding {
    pub fn verify(verifier: &Verifier, attestation: &[u8], now: SystemTime) -> Result<Self> {
        let document = verifier.verify(attestation, now)?;
        let user_data: CreateKeyUserData = document.user_data_as()?;
        if user_data.key_id.is_empty() {
            return Err(EnclaveError::Decode("key binding has an empty keyId".to_string()));
        }
        if user_data.pub_key.len() != P256_UNCOMPRESSED_LEN {
            return Err(EnclaveError::Decode(format!(
                "key binding pubKey is {} bytes, expected {}",
                user_data.pub_key.len(),
                P256_UNCOMPRESSED_LEN
            )));
        }
        info!(
            key_id = %user_data.key_id,
            region = %user_data.region,
            pcr0 = %hex::encode(document.code_measurement()?),
            "Key binding verified"
        );
        Ok(Self {
            document,
            user_data,
        })
    }

    /// Verifier accepting only documents from the same code image
    pub fn pinned(&self, verifier: &Verifier) -> Result<Verifier> {
        let pcr0 = self.document.code_measurement()?;
        Ok(verifier.clone().with_expected_measurement(pcr0.to_vec()))
    }
}

/// Result of a verified decrypt round trip
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub count: u64,
    pub request_hash: Vec<u8>,
    pub document: AttestationDocument,
}

/// Asks the enclave to provision its key; returns the `createKey` attestation
pub async fn create_key(client: &mut EnclaveClient, request: CreateKeyRequest) -> Result<Vec<u8>> {
    info!(
        region = %request.region,
        account_id = %request.account_id,
        role = %request.aws_iam_role,
        "Requesting enclave key"
    );
    client.attestation(&Request::CreateKey(request)).await
}

/// Seals `plaintext` so that only the enclave named by `binding` can open it
pub fn encrypt(binding: &KeyBinding, plaintext: &[u8]) -> Result<SealedMessage> {
    let (ephemeral_key, mut key) = agree_ephemeral(&binding.user_data.pub_key)?;
    let (nonce, ciphertext) = key.seal(plaintext)?;
    debug!(ciphertext_len = ciphertext.len(), "Sealed message");
    Ok(SealedMessage {
        ephemeral_key,
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Runs the decrypt flow for `sealed` and returns the attested result
pub async fn decrypt(
    client: &mut EnclaveClient,
    custodian: &dyn KeyCustodian,
    verifier: &Verifier,
    binding: &KeyBinding,
    sealed: &SealedMessage,
) -> Result<DecryptOutcome> {
    let verifier = binding.pinned(verifier)?;

    // KMS verifies this one before wrapping anything for it
    let fresh = client
        .attestation(&Request::GetAttestation(GetAttestationRequest {}))
        .await?;

    let wrapped = custodian
        .derive_shared_secret(&binding.user_data.key_id, &sealed.ephemeral_key, &fresh)
        .await?;

    let request = Request::Decrypt(DecryptRequest {
        encrypted_shared_secret_or_cek: wrapped,
        nonce: sealed.nonce.clone(),
        ciphertext: sealed.ciphertext.clone(),
    });
    let (response, sent) = client.send(&request).await?;
    let attestation = response.into_attestation(MessageKind::Decrypt)?;

    let document = verifier.verify(&attestation, SystemTime::now())?;
    let user_data: DecryptUserData = document.user_data_as()?;

    let sent_hash = request_hash(&sent);
    if user_data.request_hash != sent_hash {
        warn!("Decrypt response is bound to a different request");
        return Err(EnclaveError::ResponseMismatch {
            attested: hex::encode(&user_data.request_hash),
            sent: hex::encode(&sent_hash),
        });
    }

    info!(
        request_hash = %hex::encode(&sent_hash),
        count = user_data.count,
        "Decrypt response verified"
    );
    Ok(DecryptOutcome {
        count: user_data.count,
        request_hash: user_data.request_hash,
        document,
    })
}
