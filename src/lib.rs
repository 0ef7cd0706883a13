//! KMS Enclave - attestation-bound key exchange for AWS Nitro Enclaves
//!
//! The enclave creates a KMS key whose key-agreement operations are only
//! released to its own code measurement (PCR0), and opens messages that
//! callers seal under an ECDH secret with that key. This library provides:
//! - attestation issuing (NSM or local) and verification
//! - the secure channel codec (HKDF-SHA256 + AES-256-GCM) and recipient envelopes
//! - the KMS custodian, reached over vsock from inside the enclave
//! - the enclave's request handlers and session server
//! - the caller-side flows run on the parent instance

pub mod attestation;
pub mod channel;
pub mod config;
pub mod custodian;
pub mod enclave;
pub mod error;
pub mod instance;
pub mod messages;
pub mod policy;
pub mod server;
pub mod vsock_transport;
