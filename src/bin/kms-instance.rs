//! Parent-instance side of the KMS enclave
//!
//! - `create-key`: tells the enclave to create its KMS key and stores the
//!   returned attestation
//! - `encrypt`: seals a string to the key named in that attestation; needs no
//!   enclave and no AWS access
//! - `decrypt`: has KMS wrap the shared secret for the enclave, sends the
//!   ciphertext in and prints the attested count of 'a'
//!
//! The KMS relay for `create-key` (vsock-proxy on port 1001) must be running.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kms_enclave::attestation::Verifier;
use kms_enclave::config::{ATTESTATION_FRESHNESS, DEFAULT_CUSTODIAN_TIMEOUT, ENCLAVE_CID, ENCLAVE_PORT};
use kms_enclave::custodian::KmsCustodian;
use kms_enclave::instance::{self, EnclaveClient, EnclaveTarget, KeyBinding};
use kms_enclave::messages::{CreateKeyRequest, Credentials, SealedMessage};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Parser)]
#[command(name = "kms-instance", about = "The AWS EC2 instance part of the KMS enclave")]
struct Cli {
    /// Enclave context identifier
    #[arg(long, env = "ENCLAVE_CID", default_value_t = ENCLAVE_CID)]
    enclave_cid: u32,

    /// Enclave vsock port
    #[arg(long, env = "ENCLAVE_PORT", default_value_t = ENCLAVE_PORT)]
    enclave_port: u32,

    /// Reach an enclave running in local mode over TCP instead of vsock
    #[arg(long, env = "ENCLAVE_TCP_ADDR")]
    tcp: Option<SocketAddr>,

    /// Bound on each exchange with the enclave and each KMS call
    #[arg(long, default_value_t = DEFAULT_CUSTODIAN_TIMEOUT.as_secs())]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Tells the enclave to create an AWS KMS key
    CreateKey {
        /// AWS IAM role the enclave acts as
        #[arg(long, default_value = "nitro-test-iam-role")]
        role: String,

        #[arg(long, env = "AWS_REGION")]
        region: String,

        #[arg(long, env = "AWS_ACCOUNT_ID")]
        account_id: String,

        #[command(flatten)]
        credentials: CredentialArgs,

        /// Path to save the attestation to
        #[arg(long, default_value = "./attestation.out")]
        attestation_path: PathBuf,
    },

    /// Encrypts a string to the KMS-backed key
    Encrypt {
        #[command(flatten)]
        key: KeyArgs,

        /// Text to encrypt
        #[arg(long)]
        plaintext: String,
    },

    /// Decrypts a ciphertext and prints the count of 'a'
    Decrypt {
        #[command(flatten)]
        key: KeyArgs,

        /// Output of `encrypt`
        #[arg(long)]
        ciphertext: String,
    },
}

#[derive(Debug, Args)]
struct CredentialArgs {
    /// Credentials JSON as served by the instance metadata service
    #[arg(long, conflicts_with_all = ["access_key_id", "secret_access_key", "session_token"])]
    credentials_path: Option<PathBuf>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,
}

impl CredentialArgs {
    fn load(&self) -> Result<Credentials> {
        if let Some(path) = &self.credentials_path {
            let raw = std::fs::read(path)
                .with_context(|| format!("reading credentials from {}", path.display()))?;
            return Ok(serde_json::from_slice(&raw)?);
        }
        Ok(Credentials {
            access_key_id: self
                .access_key_id
                .clone()
                .context("AWS_ACCESS_KEY_ID is not set")?,
            secret_access_key: self
                .secret_access_key
                .clone()
                .context("AWS_SECRET_ACCESS_KEY is not set")?,
            token: self
                .session_token
                .clone()
                .context("AWS_SESSION_TOKEN is not set; the enclave needs temporary credentials")?,
        })
    }
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// Attestation returned by `create-key`
    #[arg(long, default_value = "./attestation.out")]
    attestation_path: PathBuf,

    /// Enclave PKI root certificate (PEM or DER)
    #[arg(long, default_value = "./root.pem")]
    root_path: PathBuf,

    /// Oldest `create-key` attestation accepted, in seconds
    #[arg(long, default_value_t = ATTESTATION_FRESHNESS.as_secs())]
    max_age_secs: u64,
}

impl KeyArgs {
    /// Returns the verifier for enclave responses and the verified key binding
    fn load(&self) -> Result<(Verifier, KeyBinding)> {
        let root = read(&self.root_path)?;
        let verifier = Verifier::from_root_bytes(&root)?;
        let attestation = read(&self.attestation_path)?;

        let binding = KeyBinding::verify(
            &verifier.clone().with_window(Duration::from_secs(self.max_age_secs)),
            &attestation,
            SystemTime::now(),
        )
        .context("verifying the create-key attestation")?;
        Ok((verifier, binding))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

impl Cli {
    fn target(&self) -> EnclaveTarget {
        match self.tcp {
            Some(addr) => EnclaveTarget::Tcp(addr),
            None => EnclaveTarget::Vsock {
                cid: self.enclave_cid,
                port: self.enclave_port,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    match &cli.command {
        Command::CreateKey {
            role,
            region,
            account_id,
            credentials,
            attestation_path,
        } => {
            let request = CreateKeyRequest {
                region: region.clone(),
                account_id: account_id.clone(),
                aws_iam_role: role.clone(),
                credentials: credentials.load()?,
            };
            let mut client = EnclaveClient::connect(&cli.target(), timeout).await?;
            let attestation = instance::create_key(&mut client, request).await?;

            std::fs::write(attestation_path, &attestation)
                .with_context(|| format!("writing {}", attestation_path.display()))?;
            info!(path = %attestation_path.display(), "Attestation saved");
        }
        Command::Encrypt { key, plaintext } => {
            let (_, binding) = key.load()?;
            let sealed = instance::encrypt(&binding, plaintext.as_bytes())?;
            println!("{}", sealed.to_token()?);
        }
        Command::Decrypt { key, ciphertext } => {
            let (verifier, binding) = key.load()?;
            let sealed = SealedMessage::from_token(ciphertext)?;

            let custodian = KmsCustodian::from_env(&binding.user_data.region, timeout).await;
            let mut client = EnclaveClient::connect(&cli.target(), timeout).await?;
            let outcome =
                instance::decrypt(&mut client, &custodian, &verifier, &binding, &sealed).await?;

            info!(request_hash = %hex::encode(&outcome.request_hash), "Request hash matches");
            println!("Count 'a': {}", outcome.count);
        }
    }

    Ok(())
}
