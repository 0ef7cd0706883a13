//! Attestation issuer backed by the Nitro Secure Module
//!
//! A session with `/dev/nsm` is opened for each request and closed right after.

use super::{AttestationIssuer, AttestationRequest};
use crate::error::{EnclaveError, Result};

#[cfg(target_os = "linux")]
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
#[cfg(target_os = "linux")]
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
#[cfg(target_os = "linux")]
use serde_bytes::ByteBuf;

#[derive(Debug)]
pub struct NsmIssuer {
    _private: (),
}

impl NsmIssuer {
    /// Returns `None` when no Nitro Secure Module is present
    #[cfg(target_os = "linux")]
    pub fn open() -> Option<Self> {
        let fd = nsm_init();
        if fd < 0 {
            tracing::warn!("Failed to initialize NSM, not running inside an enclave");
            return None;
        }
        nsm_exit(fd);
        tracing::info!("NSM initialized successfully, running in enclave mode");
        Some(Self { _private: () })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open() -> Option<Self> {
        tracing::warn!("NSM not available on this platform");
        None
    }
}

impl AttestationIssuer for NsmIssuer {
    #[cfg(target_os = "linux")]
    fn attest(&self, request: AttestationRequest) -> Result<Vec<u8>> {
        let fd = nsm_init();
        if fd < 0 {
            return Err(EnclaveError::Issuer(
                "issuer unavailable: cannot open /dev/nsm".to_string(),
            ));
        }

        let response = nsm_process_request(
            fd,
            Request::Attestation {
                user_data: request.user_data.map(ByteBuf::from),
                nonce: request.nonce.map(ByteBuf::from),
                public_key: request.public_key.map(ByteBuf::from),
            },
        );
        nsm_exit(fd);

        match response {
            Response::Attestation { document } if !document.is_empty() => Ok(document),
            Response::Attestation { .. } => Err(EnclaveError::Issuer(
                "NSM returned an empty attestation".to_string(),
            )),
            Response::Error(err) => Err(EnclaveError::Issuer(format!(
                "Failed to get attestation: {:?}",
                err
            ))),
            _ => Err(EnclaveError::Issuer("Unexpected NSM response".to_string())),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn attest(&self, _request: AttestationRequest) -> Result<Vec<u8>> {
        Err(EnclaveError::Issuer(
            "issuer unavailable: NSM not available on this platform".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_nsm_outside_enclave() {
        // test hosts have no /dev/nsm
        assert!(NsmIssuer::open().is_none());
    }
}
