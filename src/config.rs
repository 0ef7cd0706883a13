//! Protocol constants and environment-driven configuration
//!
//! ## Setup on Parent EC2 Instance
//!
//! The parent instance must relay the enclave's KMS traffic. The enclave
//! speaks TLS end-to-end with KMS, so the relay only forwards bytes:
//!
//! ```bash
//! vsock-proxy 1001 kms.us-east-1.amazonaws.com 443 &
//! ```

use crate::error::{EnclaveError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Context identifier of the enclave; must match `nitro-cli run-enclave --enclave-cid`
pub const ENCLAVE_CID: u32 = 16;

/// Port the enclave listens on for session messages
pub const ENCLAVE_PORT: u32 = 1000;

/// Context identifier of the parent instance (always 3)
pub const PARENT_CID: u32 = 3;

/// Port the parent relays to KMS on
pub const KMS_PROXY_PORT: u32 = 1001;

/// Domain-separation salt for the content key derivation
pub const HKDF_SALT: &[u8] = b"foobar-service-salt";

/// KMS refuses recipient attestations older than this
pub const ATTESTATION_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// Upper bound on one custodian operation, including retries inside the SDK
pub const DEFAULT_CUSTODIAN_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest session frame accepted, excluding its newline; a longer frame ends the session
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Description attached to keys created by the enclave
pub const KEY_DESCRIPTION: &str = "kms-enclave attestation-bound key agreement key";

/// Where the enclave accepts sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    /// vsock on `VMADDR_CID_ANY`
    Vsock { port: u32 },
    /// Plain TCP, for local development outside an enclave
    Tcp(SocketAddr),
}

/// Configuration of the enclave binary
#[derive(Debug, Clone)]
pub struct EnclaveConfig {
    pub listen: Listen,
    /// vsock CID the KMS relay is reachable on
    pub kms_proxy_cid: u32,
    /// vsock port the KMS relay is reachable on
    pub kms_proxy_port: u32,
    pub custodian_timeout: Duration,
    /// Where to write the local issuer's root certificate when running outside an enclave
    pub local_root_path: Option<PathBuf>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            listen: Listen::Vsock { port: ENCLAVE_PORT },
            kms_proxy_cid: PARENT_CID,
            kms_proxy_port: KMS_PROXY_PORT,
            custodian_timeout: DEFAULT_CUSTODIAN_TIMEOUT,
            local_root_path: None,
        }
    }
}

impl EnclaveConfig {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let port: u32 = parse_var(&lookup, "ENCLAVE_PORT")?.unwrap_or(ENCLAVE_PORT);
        config.listen = if lookup("USE_TCP").is_some() {
            let addr = match lookup("LISTEN_ADDR") {
                Some(addr) => addr.parse().map_err(|e| {
                    EnclaveError::Config(format!("LISTEN_ADDR {:?}: {}", addr, e))
                })?,
                None => {
                    let port = u16::try_from(port).map_err(|_| {
                        EnclaveError::Config(format!("ENCLAVE_PORT {} is not a TCP port", port))
                    })?;
                    SocketAddr::from(([127, 0, 0, 1], port))
                }
            };
            Listen::Tcp(addr)
        } else {
            Listen::Vsock { port }
        };

        if let Some(cid) = parse_var(&lookup, "KMS_PROXY_CID")? {
            config.kms_proxy_cid = cid;
        }
        if let Some(port) = parse_var(&lookup, "KMS_PROXY_PORT")? {
            config.kms_proxy_port = port;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CUSTODIAN_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(EnclaveError::Config(
                    "CUSTODIAN_TIMEOUT_SECS must be positive".to_string(),
                ));
            }
            config.custodian_timeout = Duration::from_secs(secs);
        }
        config.local_root_path = lookup("LOCAL_ROOT_PATH").map(PathBuf::from);

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|e| EnclaveError::Config(format!("{} {:?}: {}", key, value, e)))
        })
        .transpose()
}
