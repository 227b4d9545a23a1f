//! Test capability implementations.
//!
//! [`TestOps`] wraps a [`SoftwareOps`] and lets tests override individual
//! operations while delegating the rest. Override state is plain
//! per-instance configuration set at construction, replacing the
//! original design's process-wide hooks; two instances with different
//! overrides never interfere.

use kiln_proto::{
    Curve, Envelope, AES_128_KEY_LEN, ECDH_KEY_LEN, GCM_IV_LEN, GCM_TAG_LEN, SHA256_DIGEST_LEN,
};

use crate::ops::{CryptoError, CryptoOps, EcdhAgreement, KeyPair, SoftwareOps};
use crate::session::SessionKey;

/// Delegating test capability.
#[derive(Default, Clone)]
pub struct TestOps {
    inner: SoftwareOps,
    fixed_random: Option<Vec<u8>>,
    fail_random: bool,
}

impl TestOps {
    /// Delegate everything to a fresh [`SoftwareOps`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Delegate to a backend holding a deterministic ECDH key.
    pub fn with_test_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: SoftwareOps::with_test_key(key),
            fixed_random: None,
            fail_random: false,
        }
    }

    /// Serve these bytes from every `random_bytes` call instead of the
    /// OS CSPRNG. The requested length must match exactly.
    pub fn fixed_random(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.fixed_random = Some(bytes.into());
        self
    }

    /// Make `random_bytes` fail, as an unreadable entropy source would.
    pub fn failing_entropy(mut self) -> Self {
        self.fail_random = true;
        self
    }
}

impl CryptoOps for TestOps {
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError> {
        if self.fail_random {
            return Err(CryptoError::Io("entropy source disabled for test".into()));
        }
        if let Some(bytes) = &self.fixed_random {
            if bytes.len() != n {
                return Err(CryptoError::InvalidArgument(format!(
                    "fixed random override holds {} bytes, {} requested",
                    bytes.len(),
                    n
                )));
            }
            return Ok(bytes.clone());
        }
        self.inner.random_bytes(n)
    }

    fn generate_ecdh_keypair(&self, curve: Curve) -> Result<KeyPair, CryptoError> {
        self.inner.generate_ecdh_keypair(curve)
    }

    fn ecdh_shared_secret(
        &self,
        curve: Curve,
        key_pair: &KeyPair,
        peer_public_key: &[u8; ECDH_KEY_LEN],
    ) -> Result<EcdhAgreement, CryptoError> {
        self.inner.ecdh_shared_secret(curve, key_pair, peer_public_key)
    }

    fn aes_gcm_128_seal(
        &self,
        plaintext: &[u8],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN]), CryptoError> {
        self.inner.aes_gcm_128_seal(plaintext, key, iv)
    }

    fn aes_gcm_128_open(
        &self,
        ciphertext: &[u8],
        tag: &[u8; GCM_TAG_LEN],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.aes_gcm_128_open(ciphertext, tag, key, iv)
    }

    fn sha256(&self, data: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
        self.inner.sha256(data)
    }

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        self.inner.hkdf_sha256(salt, ikm, info, okm_len)
    }
}

/// Seal a CA response envelope for tests, echoing the device public key
/// the way a real CA does.
pub fn seal_response<O: CryptoOps + ?Sized>(
    ops: &O,
    session_key: &SessionKey,
    device_public_key: &[u8; ECDH_KEY_LEN],
    inner: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let iv_bytes = ops.random_bytes(GCM_IV_LEN)?;
    let mut iv = [0u8; GCM_IV_LEN];
    iv.copy_from_slice(&iv_bytes);
    let (ciphertext, tag) = ops.aes_gcm_128_seal(inner, session_key.as_bytes(), &iv)?;
    Ok(Envelope::new(*device_public_key, iv, ciphertext, tag)
        .encode()
        .to_vec())
}
