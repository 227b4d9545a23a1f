//! The pluggable cryptographic capability.
//!
//! Protocol code never calls a primitive crate directly; everything goes
//! through [`CryptoOps`]. [`SoftwareOps`] is the production backend.
//! Hardware-backed or test implementations substitute at construction
//! time.
//!
//! Unsupported curve selectors never reach a backend: the wire decoder
//! rejects unknown curve codes, so a backend only ever sees the two
//! supported families.

use aes_gcm::{AeadInPlace, Aes128Gcm, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use kiln_proto::{
    Curve, WireError, AES_128_KEY_LEN, ECDH_KEY_LEN, ECDH_SHARED_SECRET_LEN, GCM_IV_LEN,
    GCM_TAG_LEN, SHA256_DIGEST_LEN,
};

/// Raw ECDH private key scalar length, shared by both curve families.
pub const ECDH_PRIVATE_KEY_LEN: usize = 32;

/// Maximum HKDF-SHA256 output, 255 times the hash length (RFC 5869).
pub const HKDF_MAX_OKM_LEN: usize = 255 * SHA256_DIGEST_LEN;

/// Errors surfaced by capability operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A primitive operation failed. AEAD failures deliberately carry no
    /// detail, so callers cannot distinguish a tag mismatch from any
    /// other decryption error.
    #[error("crypto operation failed: {0}")]
    Crypto(&'static str),

    #[error("entropy source unavailable: {0}")]
    Io(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Ephemeral ECDH key pair scoped to a single exchange.
///
/// The private key is the raw 32-byte scalar for both curve families.
/// Zeroized on drop, never persisted.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    pub private_key: [u8; ECDH_PRIVATE_KEY_LEN],
    /// Public key in the fixed wire field encoding.
    pub public_key: [u8; ECDH_KEY_LEN],
}

/// Result of one ECDH key agreement. Zeroized on drop.
#[derive(Clone, Debug, Zeroize, ZeroizeOnDrop)]
pub struct EcdhAgreement {
    /// Our public key in the fixed wire field encoding.
    pub public_key: [u8; ECDH_KEY_LEN],
    /// Raw shared secret.
    pub shared_secret: [u8; ECDH_SHARED_SECRET_LEN],
}

/// Capability set every cryptographic backend implements.
///
/// Operations either succeed completely or fail without partial output,
/// and none retries internally; callers treat any failure as terminal
/// for the exchange that issued it.
pub trait CryptoOps {
    /// Fill a fresh buffer with `n` bytes of entropy.
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError>;

    /// Generate an ephemeral ECDH key pair, or deterministically derive
    /// one when the backend holds a test key for `curve`.
    fn generate_ecdh_keypair(&self, curve: Curve) -> Result<KeyPair, CryptoError>;

    /// Compute the shared secret between `key_pair` and a peer public
    /// key. Malformed peer keys fail with [`CryptoError::Crypto`].
    fn ecdh_shared_secret(
        &self,
        curve: Curve,
        key_pair: &KeyPair,
        peer_public_key: &[u8; ECDH_KEY_LEN],
    ) -> Result<EcdhAgreement, CryptoError>;

    /// AES-128-GCM seal with no associated data.
    fn aes_gcm_128_seal(
        &self,
        plaintext: &[u8],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN]), CryptoError>;

    /// AES-128-GCM open. Fails with one uniform [`CryptoError::Crypto`]
    /// on any decryption error, tag mismatch included.
    fn aes_gcm_128_open(
        &self,
        ciphertext: &[u8],
        tag: &[u8; GCM_TAG_LEN],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<Vec<u8>, CryptoError>;

    /// SHA-256 digest.
    fn sha256(&self, data: &[u8]) -> [u8; SHA256_DIGEST_LEN];

    /// HKDF-SHA256 extract-then-expand.
    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm_len: usize,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Production backend over the RustCrypto and dalek crates.
///
/// A deterministic ECDH private key may be injected at construction for
/// tests: the X25519 path uses it when it is exactly 32 bytes, and the
/// P-256 path parses it as a SEC1 DER private key when it is non-empty.
/// Without a test key, every key pair is a fresh ephemeral one from the
/// OS CSPRNG.
#[derive(Default, Clone)]
pub struct SoftwareOps {
    test_key: Option<Vec<u8>>,
}

impl SoftwareOps {
    /// Backend with fresh ephemeral keys for every exchange.
    pub fn new() -> Self {
        Self { test_key: None }
    }

    /// Backend with a deterministic ECDH private key.
    pub fn with_test_key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            test_key: Some(key.into()),
        }
    }

    fn x25519_keypair(&self) -> Result<KeyPair, CryptoError> {
        let mut private_key = [0u8; ECDH_PRIVATE_KEY_LEN];
        match self.test_key.as_deref() {
            Some(key) if key.len() == ECDH_PRIVATE_KEY_LEN => private_key.copy_from_slice(key),
            _ => OsRng
                .try_fill_bytes(&mut private_key)
                .map_err(|e| CryptoError::Io(e.to_string()))?,
        }
        let secret = x25519_dalek::StaticSecret::from(private_key);
        let mut public_key = [0u8; ECDH_KEY_LEN];
        public_key[..32].copy_from_slice(x25519_dalek::PublicKey::from(&secret).as_bytes());
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    fn p256_keypair(&self) -> Result<KeyPair, CryptoError> {
        let secret = match self.test_key.as_deref() {
            Some(key) if !key.is_empty() => p256::SecretKey::from_sec1_der(key).map_err(|_| {
                CryptoError::InvalidArgument(
                    "test key is not a SEC1 DER P-256 private key".into(),
                )
            })?,
            _ => p256::SecretKey::random(&mut OsRng),
        };

        let mut private_key = [0u8; ECDH_PRIVATE_KEY_LEN];
        private_key.copy_from_slice(&secret.to_bytes());
        let encoded = secret.public_key().to_encoded_point(true);
        let mut public_key = [0u8; ECDH_KEY_LEN];
        public_key.copy_from_slice(encoded.as_bytes());
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    fn x25519_agree(
        &self,
        key_pair: &KeyPair,
        peer: &[u8; ECDH_KEY_LEN],
    ) -> Result<EcdhAgreement, CryptoError> {
        let secret = x25519_dalek::StaticSecret::from(key_pair.private_key);

        // Only the first 32 bytes of the wire field carry the X25519 key.
        let mut peer_key = [0u8; 32];
        peer_key.copy_from_slice(&peer[..32]);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer_key));
        if !shared.was_contributory() {
            return Err(CryptoError::Crypto("x25519 low-order peer key"));
        }

        Ok(EcdhAgreement {
            public_key: key_pair.public_key,
            shared_secret: *shared.as_bytes(),
        })
    }

    fn p256_agree(
        &self,
        key_pair: &KeyPair,
        peer: &[u8; ECDH_KEY_LEN],
    ) -> Result<EcdhAgreement, CryptoError> {
        let peer_key = p256::PublicKey::from_sec1_bytes(peer)
            .map_err(|_| CryptoError::Crypto("invalid P-256 peer public key"))?;
        let secret = p256::SecretKey::from_slice(&key_pair.private_key)
            .map_err(|_| CryptoError::InvalidArgument("invalid P-256 private key".into()))?;

        let shared = p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_key.as_affine());
        let mut shared_secret = [0u8; ECDH_SHARED_SECRET_LEN];
        shared_secret.copy_from_slice(shared.raw_secret_bytes());
        Ok(EcdhAgreement {
            public_key: key_pair.public_key,
            shared_secret,
        })
    }
}

impl CryptoOps for SoftwareOps {
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; n];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| CryptoError::Io(e.to_string()))?;
        Ok(buf)
    }

    fn generate_ecdh_keypair(&self, curve: Curve) -> Result<KeyPair, CryptoError> {
        match curve {
            Curve::X25519 => self.x25519_keypair(),
            Curve::P256 => self.p256_keypair(),
        }
    }

    fn ecdh_shared_secret(
        &self,
        curve: Curve,
        key_pair: &KeyPair,
        peer_public_key: &[u8; ECDH_KEY_LEN],
    ) -> Result<EcdhAgreement, CryptoError> {
        match curve {
            Curve::X25519 => self.x25519_agree(key_pair, peer_public_key),
            Curve::P256 => self.p256_agree(key_pair, peer_public_key),
        }
    }

    fn aes_gcm_128_seal(
        &self,
        plaintext: &[u8],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN]), CryptoError> {
        let cipher =
            Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::Crypto("aes-gcm key"))?;
        let mut buf = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buf)
            .map_err(|_| CryptoError::Crypto("aes-gcm seal failed"))?;
        let mut tag_out = [0u8; GCM_TAG_LEN];
        tag_out.copy_from_slice(&tag);
        Ok((buf, tag_out))
    }

    fn aes_gcm_128_open(
        &self,
        ciphertext: &[u8],
        tag: &[u8; GCM_TAG_LEN],
        key: &[u8; AES_128_KEY_LEN],
        iv: &[u8; GCM_IV_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::Crypto("aes-gcm open failed"))?;
        let mut buf = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buf, Tag::from_slice(tag))
            .map_err(|_| CryptoError::Crypto("aes-gcm open failed"))?;
        Ok(buf)
    }

    fn sha256(&self, data: &[u8]) -> [u8; SHA256_DIGEST_LEN] {
        Sha256::digest(data).into()
    }

    fn hkdf_sha256(
        &self,
        salt: &[u8],
        ikm: &[u8],
        info: &[u8],
        okm_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if okm_len > HKDF_MAX_OKM_LEN {
            return Err(CryptoError::Crypto("hkdf output length overflow"));
        }
        let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = vec![0u8; okm_len];
        hk.expand(info, &mut okm)
            .map_err(|_| CryptoError::Crypto("hkdf expand failed"))?;
        Ok(okm)
    }
}
