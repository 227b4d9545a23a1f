//! Operation-specific inner payloads.
//!
//! The inner payload is the plaintext protected by the envelope AEAD. It
//! mirrors the outer header shape (reserved word, then a length covering
//! the remainder), followed by fields that depend on the requested
//! operation:
//!
//! - `Issue`: optional authentication certificate chain and signature,
//!   the 32-byte product identity hash, and three reserved attestation
//!   key length fields (RSA, ECDSA, EdDSA) that must be zero.
//! - `IssueSomKey`: the 32-byte SOM identity hash only.
//!
//! Also defined here: the operation-start message a CA sends to open an
//! exchange, and the caller-owned authentication attachment.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::cursor::Reader;
use crate::{WireError, ECDH_KEY_LEN, HEADER_LEN, PROTOCOL_VERSION, SHA256_DIGEST_LEN};

/// Provisioning operations a device can be asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Operation {
    /// Issue product attestation keys.
    Issue = 1,
    /// Issue a SOM key.
    IssueSomKey = 2,
}

impl TryFrom<u32> for Operation {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Issue),
            2 => Ok(Self::IssueSomKey),
            other => Err(WireError::UnknownOperation(other)),
        }
    }
}

/// ECDH curve families supported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Curve {
    X25519 = 1,
    P256 = 2,
}

impl TryFrom<u32> for Curve {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::X25519),
            2 => Ok(Self::P256),
            other => Err(WireError::UnknownCurve(other)),
        }
    }
}

/// Authentication key algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum KeyType {
    /// No authentication key configured.
    None = 0,
    Rsa = 1,
    Ecdsa = 2,
    EdDsa = 3,
}

impl TryFrom<u32> for KeyType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Rsa),
            2 => Ok(Self::Ecdsa),
            3 => Ok(Self::EdDsa),
            other => Err(WireError::UnknownKeyType(other)),
        }
    }
}

/// Caller-owned authentication material attached to `Issue` requests.
///
/// Persists across exchanges until cleared. Absence is represented by
/// `KeyType::None` with empty certificate and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttachment {
    pub key_type: KeyType,
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

impl AuthAttachment {
    /// The cleared attachment: no key type, no material.
    pub fn none() -> Self {
        Self {
            key_type: KeyType::None,
            certificate: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Wire form of the attachment, `None` when cleared.
    pub fn to_wire(&self) -> Option<CaAuth> {
        if self.key_type == KeyType::None {
            return None;
        }
        Some(CaAuth {
            certificate: self.certificate.clone(),
            signature: self.signature.clone(),
        })
    }
}

impl Default for AuthAttachment {
    fn default() -> Self {
        Self::none()
    }
}

/// Authentication block as it travels inside an `Issue` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaAuth {
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Inner payload for [`Operation::Issue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuePayload {
    /// Authentication block; `None` for unauthenticated issuance.
    pub auth: Option<CaAuth>,
    /// SHA-256 of the product identity.
    pub product_id_hash: [u8; SHA256_DIGEST_LEN],
}

impl IssuePayload {
    fn body_len(&self) -> usize {
        let auth_len = match &self.auth {
            // chain size + entry length + cert + signature size + signature
            Some(auth) => 4 + 4 + auth.certificate.len() + 4 + auth.signature.len(),
            // both size fields, zero
            None => 4 + 4,
        };
        auth_len + SHA256_DIGEST_LEN + 3 * 4
    }

    /// Encode the payload, including its mirrored 8-byte header.
    pub fn encode(&self) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
        buf.put_u32_le(PROTOCOL_VERSION);
        buf.put_u32_le(body_len as u32);
        match &self.auth {
            Some(auth) => {
                buf.put_i32_le((4 + auth.certificate.len()) as i32);
                buf.put_i32_le(auth.certificate.len() as i32);
                buf.put_slice(&auth.certificate);
                buf.put_i32_le(auth.signature.len() as i32);
                buf.put_slice(&auth.signature);
            }
            None => {
                buf.put_i32_le(0);
                buf.put_i32_le(0);
            }
        }
        buf.put_slice(&self.product_id_hash);
        // Reserved attestation key length fields (RSA, ECDSA, EdDSA),
        // zero until a CA schema assigns them meaning.
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        buf.put_i32_le(0);
        buf.freeze()
    }

    /// Decode and validate an `Issue` payload.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let _version = r.read_u32()?;
        let declared = r.read_u32()? as usize;
        if declared != r.remaining() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: r.remaining(),
            });
        }

        let chain_size = r.read_len_i32()?;
        let auth = if chain_size > 0 {
            let cert_len = r.read_len_i32()?;
            if chain_size != 4 + cert_len {
                return Err(WireError::BadCertChain {
                    chain_size,
                    cert_len,
                });
            }
            let certificate = r.take(cert_len)?.to_vec();
            let sig_len = r.read_len_i32()?;
            let signature = r.take(sig_len)?.to_vec();
            Some(CaAuth {
                certificate,
                signature,
            })
        } else {
            let sig_len = r.read_len_i32()?;
            if sig_len != 0 {
                return Err(WireError::SignatureWithoutCerts(sig_len));
            }
            None
        };

        let product_id_hash = r.take_array::<SHA256_DIGEST_LEN>()?;
        for _ in 0..3 {
            let reserved = r.read_i32()?;
            if reserved != 0 {
                return Err(WireError::ReservedKeyLen(reserved));
            }
        }
        r.finish()?;

        Ok(Self {
            auth,
            product_id_hash,
        })
    }
}

/// Inner payload for [`Operation::IssueSomKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomPayload {
    /// SHA-256 of the SOM identity.
    pub som_id_hash: [u8; SHA256_DIGEST_LEN],
}

impl SomPayload {
    /// Encode the payload, including its mirrored 8-byte header.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + SHA256_DIGEST_LEN);
        buf.put_u32_le(PROTOCOL_VERSION);
        buf.put_u32_le(SHA256_DIGEST_LEN as u32);
        buf.put_slice(&self.som_id_hash);
        buf.freeze()
    }

    /// Decode and validate a SOM key payload.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let _version = r.read_u32()?;
        let declared = r.read_u32()? as usize;
        if declared != r.remaining() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: r.remaining(),
            });
        }
        let som_id_hash = r.take_array::<SHA256_DIGEST_LEN>()?;
        r.finish()?;
        Ok(Self { som_id_hash })
    }
}

/// The CA message that opens an exchange: requested operation, curve,
/// and the CA's ephemeral public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStart {
    pub operation: Operation,
    pub curve: Curve,
    pub ca_public_key: [u8; ECDH_KEY_LEN],
}

impl OperationStart {
    /// Encoded size: header + operation + curve + CA public key.
    pub const ENCODED_LEN: usize = HEADER_LEN + 4 + 4 + ECDH_KEY_LEN;

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u32_le(PROTOCOL_VERSION);
        buf.put_u32_le((4 + 4 + ECDH_KEY_LEN) as u32);
        buf.put_u32_le(self.operation as u32);
        buf.put_u32_le(self.curve as u32);
        buf.put_slice(&self.ca_public_key);
        buf.freeze()
    }

    /// Decode and validate an operation-start message.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let _version = r.read_u32()?;
        let declared = r.read_u32()? as usize;
        if declared != r.remaining() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: r.remaining(),
            });
        }
        let operation = Operation::try_from(r.read_u32()?)?;
        let curve = Curve::try_from(r.read_u32()?)?;
        let ca_public_key = r.take_array::<ECDH_KEY_LEN>()?;
        r.finish()?;
        Ok(Self {
            operation,
            curve,
            ca_public_key,
        })
    }
}
