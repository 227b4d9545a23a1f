//! Core Kiln provisioning wire protocol: constants, framing, and payloads.
//!
//! This crate provides:
//! - Protocol constants and fixed field widths
//! - A bounds-checked cursor for parsing fixed-offset binary messages
//! - The outer CA request/response envelope codec
//! - Operation-specific inner payload codecs
//!
//! Every wire integer is little-endian, and every field lives at a fixed
//! offset. Decoders validate the remaining byte count before each read;
//! a buffer that is too short for a declared field is rejected as
//! malformed, never read past its end.

#![forbid(unsafe_code)]

use thiserror::Error;

pub mod cursor;
pub mod envelope;
pub mod payload;

pub use cursor::Reader;
pub use envelope::Envelope;
pub use payload::{
    AuthAttachment, CaAuth, Curve, IssuePayload, KeyType, Operation, OperationStart, SomPayload,
};

/// Protocol version, written into the reserved word of every header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message header: 4 reserved/version bytes + 4-byte length of the
/// remainder. Outer envelopes and inner payloads share this shape.
pub const HEADER_LEN: usize = 8;

/// Serialized ECDH public key field width. P-256 keys use the compressed
/// point encoding; X25519 keys occupy the first 32 bytes, zero padded.
pub const ECDH_KEY_LEN: usize = 33;

/// ECDH shared secret length, identical for both curve families.
pub const ECDH_SHARED_SECRET_LEN: usize = 32;

/// AES-128 session key length.
pub const AES_128_KEY_LEN: usize = 16;

/// AES-GCM IV length.
pub const GCM_IV_LEN: usize = 12;

/// AES-GCM authentication tag length.
pub const GCM_TAG_LEN: usize = 16;

/// SHA-256 digest length.
pub const SHA256_DIGEST_LEN: usize = 32;

/// HKDF context label for session key derivation.
pub const SESSION_KEY_INFO: &[u8] = b"KEY";

/// Fixed length of an anonymous-attestation signature blob.
pub const GROUP_SIG_LEN: usize = 360;

/// Wire decoding errors.
///
/// Every variant means the same thing to a caller: the message is
/// malformed and must be rejected without further processing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short: need {needed} more bytes, {remaining} remain")]
    TooShort { needed: usize, remaining: usize },

    #[error("length field mismatch: header says {declared}, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("negative length field: {0}")]
    NegativeLength(i32),

    #[error("unknown operation code: {0}")]
    UnknownOperation(u32),

    #[error("unknown curve code: {0}")]
    UnknownCurve(u32),

    #[error("unknown key type code: {0}")]
    UnknownKeyType(u32),

    #[error("certificate chain size {chain_size} does not match entry length {cert_len}")]
    BadCertChain { chain_size: usize, cert_len: usize },

    #[error("signature present without certificate chain ({0} bytes)")]
    SignatureWithoutCerts(usize),

    #[error("reserved key length field must be zero, got {0}")]
    ReservedKeyLen(i32),
}
