//! KMS Enclave Server
//!
//! Runs inside an AWS Nitro enclave and serves newline-delimited JSON sessions
//! on vsock port 1000.
//!
//! # Modes
//!
//! - **enclave** (production): `/dev/nsm` present - NSM attestation
//! - **local** (development): no NSM - a local issuer with PCR0 all zeros,
//!   its root written to `LOCAL_ROOT_PATH` when set
//!
//! `USE_TCP=1` listens on TCP (`LISTEN_ADDR`) instead of vsock.

use anyhow::{Context, Result};
use kms_enclave::attestation::{AttestationIssuer, LocalIssuer, NsmIssuer};
use kms_enclave::channel::TransportKey;
use kms_enclave::config::{EnclaveConfig, Listen};
use kms_enclave::custodian::KmsConnector;
use kms_enclave::enclave::EnclaveService;
use kms_enclave::server::{run_tcp, run_vsock};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// PCR0 reported in local mode, matching an enclave started with `--debug-mode`
const LOCAL_PCR0: [u8; 48] = [0u8; 48];

async fn init_issuer(config: &EnclaveConfig) -> Result<Arc<dyn AttestationIssuer>> {
    if let Some(nsm) = NsmIssuer::open() {
        return Ok(Arc::new(nsm));
    }

    let issuer = LocalIssuer::new(LOCAL_PCR0.to_vec())?;
    if let Some(path) = &config.local_root_path {
        tokio::fs::write(path, issuer.root_certificate_pem()?)
            .await
            .with_context(|| format!("writing local root to {}", path.display()))?;
        info!(path = %path.display(), "Local attestation root written");
    }
    Ok(Arc::new(issuer))
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting KMS Enclave Server...");

    let config = EnclaveConfig::from_env()?;
    let issuer = init_issuer(&config).await?;

    // generated once; shared read-only by every session
    let transport_key = Arc::new(TransportKey::generate()?);
    info!(
        public_key_len = transport_key.public_key_der().len(),
        "Transport key generated"
    );

    let connector = Arc::new(KmsConnector::new(config.clone()));
    let service = Arc::new(EnclaveService::new(issuer, transport_key, connector));

    info!(
        kms_proxy_cid = config.kms_proxy_cid,
        kms_proxy_port = config.kms_proxy_port,
        custodian_timeout_secs = config.custodian_timeout.as_secs(),
        "KMS relay configured"
    );

    match config.listen {
        Listen::Vsock { port } => run_vsock(service, port).await?,
        Listen::Tcp(addr) => run_tcp(service, addr).await?,
    }
    Ok(())
}
