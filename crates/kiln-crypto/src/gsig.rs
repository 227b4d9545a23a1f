//! Seam to the external anonymous-attestation signer.
//!
//! The group-signature scheme lives outside this workspace. We hand it a
//! message, an optional basename, opaque key material, and a digest
//! selector, and get back a fixed 360-byte signature blob whose internal
//! structure this code never interprets. Selector validation happens
//! here, before the external component is ever invoked.

use serde::{Deserialize, Serialize};

use kiln_proto::GROUP_SIG_LEN;

use crate::ops::CryptoError;

/// Digest selector understood by the external signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum GroupHashAlg {
    Sha256 = 0,
    Sha384 = 1,
    Sha512 = 2,
    Sha512_256 = 3,
}

impl GroupHashAlg {
    /// Parse a wire selector. Anything unknown is rejected without
    /// touching the external component.
    pub fn from_wire(code: u32) -> Result<Self, CryptoError> {
        match code {
            0 => Ok(Self::Sha256),
            1 => Ok(Self::Sha384),
            2 => Ok(Self::Sha512),
            3 => Ok(Self::Sha512_256),
            other => Err(CryptoError::InvalidArgument(format!(
                "unknown hash algorithm selector: {other}"
            ))),
        }
    }
}

/// External group-signature signing/verification component.
///
/// Implementations wrap whatever library provides the scheme; callers
/// treat the signature as an opaque fixed-length blob.
pub trait GroupSigner {
    /// Sign `message`, optionally bound to `basename`.
    fn sign(
        &self,
        message: &[u8],
        basename: Option<&[u8]>,
        key_material: &[u8],
        hash_alg: GroupHashAlg,
    ) -> Result<[u8; GROUP_SIG_LEN], CryptoError>;

    /// Verify an opaque signature blob against the group public key.
    fn verify(
        &self,
        message: &[u8],
        basename: Option<&[u8]>,
        group_public_key: &[u8],
        hash_alg: GroupHashAlg,
        signature: &[u8; GROUP_SIG_LEN],
    ) -> Result<(), CryptoError>;
}

/// Sign with a wire-encoded digest selector, validating it first.
pub fn sign_with_selector<S: GroupSigner + ?Sized>(
    signer: &S,
    message: &[u8],
    basename: Option<&[u8]>,
    key_material: &[u8],
    selector: u32,
) -> Result<[u8; GROUP_SIG_LEN], CryptoError> {
    let hash_alg = GroupHashAlg::from_wire(selector)?;
    signer.sign(message, basename, key_material, hash_alg)
}

/// Verify with a wire-encoded digest selector, validating it first.
pub fn verify_with_selector<S: GroupSigner + ?Sized>(
    signer: &S,
    message: &[u8],
    basename: Option<&[u8]>,
    group_public_key: &[u8],
    selector: u32,
    signature: &[u8; GROUP_SIG_LEN],
) -> Result<(), CryptoError> {
    let hash_alg = GroupHashAlg::from_wire(selector)?;
    signer.verify(message, basename, group_public_key, hash_alg, signature)
}
