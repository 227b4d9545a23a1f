//! Cryptographic capability and secure CA exchange for Kiln.
//!
//! This crate provides:
//! - The [`CryptoOps`] capability trait that every backend implements
//! - [`SoftwareOps`], the default backend over x25519-dalek, p256,
//!   AES-128-GCM, and HKDF-SHA256
//! - Session key derivation and the per-exchange state machine that
//!   builds encrypted CA requests and opens CA responses
//! - The seam to the external anonymous-attestation signer
//!
//! # Design
//!
//! Backends are selected by dependency injection: anything implementing
//! [`CryptoOps`] can drive an [`Exchange`]. Deterministic test keys are
//! per-instance constructor state on the backend, never process-wide, so
//! concurrent exchanges with different configurations cannot interfere.
//!
//! One exchange owns one ephemeral key pair and one session key; both
//! are discarded when the exchange ends. Nothing here retries, times
//! out, or resumes: a failed exchange stays failed.

#![forbid(unsafe_code)]

pub mod gsig;
pub mod keys;
pub mod ops;
pub mod session;
pub mod testing;

pub use gsig::{GroupHashAlg, GroupSigner};
pub use ops::{CryptoError, CryptoOps, EcdhAgreement, KeyPair, SoftwareOps};
pub use session::{
    derive_session_key, open_with_key, operation_payload, Exchange, ExchangeError, ExchangeState,
    SessionKey,
};
