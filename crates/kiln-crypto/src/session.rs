//! Session keys and the per-exchange state machine.
//!
//! One exchange covers one CA request and its matching response. Each
//! exchange owns its ephemeral ECDH agreement and the derived AES-128
//! session key; nothing is shared across exchanges, so independent
//! exchanges can run concurrently without coordination.
//!
//! # Exchange flow
//!
//! ```text
//! Device                                  CA
//!   |                                      |
//!   |  ECDH(device ephemeral, CA public)   |
//!   |  session key = HKDF(secret, pubkeys) |
//!   |  envelope = seal(inner payload)      |
//!   |------------------------------------->|
//!   |                                      |  same ECDH + HKDF from the
//!   |                                      |  embedded device public key
//!   |<-------------------------------------|
//!   |  inner bytes = open(response)        |
//! ```

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use kiln_proto::{
    AuthAttachment, Curve, Envelope, IssuePayload, Operation, OperationStart, SomPayload,
    WireError, AES_128_KEY_LEN, ECDH_KEY_LEN, ECDH_SHARED_SECRET_LEN, GCM_IV_LEN,
    SESSION_KEY_INFO, SHA256_DIGEST_LEN,
};

use crate::ops::{CryptoError, CryptoOps};

/// AES-128 session key. Held only for the lifetime of one exchange,
/// zeroized on drop, never serialized.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; AES_128_KEY_LEN]);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; AES_128_KEY_LEN] {
        &self.0
    }
}

/// Derive the symmetric session key both sides of an exchange share.
///
/// Salt is the device public key followed by the CA public key (both
/// sides must use exactly that order), IKM is the ECDH shared secret,
/// and `info` is the protocol context label ([`SESSION_KEY_INFO`]).
/// Identical inputs yield byte-identical keys on either side; the whole
/// channel depends on that.
pub fn derive_session_key<O: CryptoOps + ?Sized>(
    ops: &O,
    device_public_key: &[u8; ECDH_KEY_LEN],
    ca_public_key: &[u8; ECDH_KEY_LEN],
    shared_secret: &[u8; ECDH_SHARED_SECRET_LEN],
    info: &[u8],
) -> Result<SessionKey, CryptoError> {
    let mut salt = [0u8; ECDH_KEY_LEN * 2];
    salt[..ECDH_KEY_LEN].copy_from_slice(device_public_key);
    salt[ECDH_KEY_LEN..].copy_from_slice(ca_public_key);

    let mut okm = ops.hkdf_sha256(&salt, shared_secret, info, AES_128_KEY_LEN)?;
    let mut key = [0u8; AES_128_KEY_LEN];
    key.copy_from_slice(&okm);
    okm.zeroize();
    Ok(SessionKey(key))
}

/// Lifecycle of a single request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    RequestBuilt,
    AwaitingResponse,
    ResponseDecoded,
    Failed,
}

/// Exchange errors.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("invalid state {0:?} for {1}")]
    InvalidState(ExchangeState, &'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] WireError),
}

enum Stage {
    Idle,
    RequestBuilt {
        request: Bytes,
        session_key: SessionKey,
    },
    AwaitingResponse {
        session_key: SessionKey,
    },
    ResponseDecoded,
    Failed,
}

impl Stage {
    fn state(&self) -> ExchangeState {
        match self {
            Stage::Idle => ExchangeState::Idle,
            Stage::RequestBuilt { .. } => ExchangeState::RequestBuilt,
            Stage::AwaitingResponse { .. } => ExchangeState::AwaitingResponse,
            Stage::ResponseDecoded => ExchangeState::ResponseDecoded,
            Stage::Failed => ExchangeState::Failed,
        }
    }
}

/// One secure exchange with the CA.
///
/// States move Idle → RequestBuilt → AwaitingResponse → ResponseDecoded;
/// any error parks the exchange in Failed, which is terminal. The device
/// key pair used for the exchange is never exposed; callers observe it
/// only through the derived session key's effects.
pub struct Exchange<'a, O: CryptoOps + ?Sized> {
    ops: &'a O,
    curve: Curve,
    ca_public_key: [u8; ECDH_KEY_LEN],
    stage: Stage,
}

impl<'a, O: CryptoOps + ?Sized> Exchange<'a, O> {
    /// Exchange against a CA identified by curve and public key.
    pub fn new(ops: &'a O, curve: Curve, ca_public_key: [u8; ECDH_KEY_LEN]) -> Self {
        Self {
            ops,
            curve,
            ca_public_key,
            stage: Stage::Idle,
        }
    }

    /// Exchange parameterized by a decoded operation-start message.
    pub fn from_start(ops: &'a O, start: &OperationStart) -> Self {
        Self::new(ops, start.curve, start.ca_public_key)
    }

    pub fn state(&self) -> ExchangeState {
        self.stage.state()
    }

    /// Encrypt `plaintext` into the CA request envelope for this
    /// exchange, deriving the session key along the way.
    pub fn build_request(&mut self, plaintext: &[u8]) -> Result<(), ExchangeError> {
        if !matches!(self.stage, Stage::Idle) {
            return Err(ExchangeError::InvalidState(self.state(), "build_request"));
        }
        match self.seal_request(plaintext) {
            Ok((request, session_key)) => {
                self.stage = Stage::RequestBuilt {
                    request,
                    session_key,
                };
                Ok(())
            }
            Err(e) => {
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }

    fn seal_request(&self, plaintext: &[u8]) -> Result<(Bytes, SessionKey), ExchangeError> {
        let key_pair = self.ops.generate_ecdh_keypair(self.curve)?;
        let agreement =
            self.ops
                .ecdh_shared_secret(self.curve, &key_pair, &self.ca_public_key)?;
        let session_key = derive_session_key(
            self.ops,
            &agreement.public_key,
            &self.ca_public_key,
            &agreement.shared_secret,
            SESSION_KEY_INFO,
        )?;

        let iv_bytes = self.ops.random_bytes(GCM_IV_LEN)?;
        let mut iv = [0u8; GCM_IV_LEN];
        iv.copy_from_slice(&iv_bytes);

        let (ciphertext, tag) =
            self.ops
                .aes_gcm_128_seal(plaintext, session_key.as_bytes(), &iv)?;
        let envelope = Envelope::new(agreement.public_key, iv, ciphertext, tag);
        debug!(
            curve = ?self.curve,
            request_len = envelope.encoded_len(),
            "built CA request"
        );
        Ok((envelope.encode(), session_key))
    }

    /// Hand the built request to the transport.
    pub fn take_request(&mut self) -> Result<Bytes, ExchangeError> {
        match std::mem::replace(&mut self.stage, Stage::Failed) {
            Stage::RequestBuilt {
                request,
                session_key,
            } => {
                self.stage = Stage::AwaitingResponse { session_key };
                Ok(request)
            }
            other => {
                let state = other.state();
                self.stage = other;
                Err(ExchangeError::InvalidState(state, "take_request"))
            }
        }
    }

    /// Decrypt the CA response with this exchange's session key and
    /// return the inner payload bytes.
    ///
    /// The envelope length fields are validated before any decryption is
    /// attempted; a decode failure is a malformed-message error, while
    /// any decryption failure surfaces as the uniform crypto error.
    pub fn open_response(&mut self, response: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        let session_key = match &self.stage {
            Stage::AwaitingResponse { session_key } => session_key.clone(),
            _ => return Err(ExchangeError::InvalidState(self.state(), "open_response")),
        };
        match open_with_key(self.ops, &session_key, response) {
            Ok(inner) => {
                self.stage = Stage::ResponseDecoded;
                debug!(inner_len = inner.len(), "opened CA response");
                Ok(inner)
            }
            Err(e) => {
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }
}

/// Inner payload bytes for the operation a start message requests.
///
/// Issue requests carry the caller's authentication attachment when one
/// is configured; SOM key issuance carries the identity hash alone.
pub fn operation_payload(
    start: &OperationStart,
    identity_hash: [u8; SHA256_DIGEST_LEN],
    auth: &AuthAttachment,
) -> Bytes {
    match start.operation {
        Operation::Issue => IssuePayload {
            auth: auth.to_wire(),
            product_id_hash: identity_hash,
        }
        .encode(),
        Operation::IssueSomKey => SomPayload {
            som_id_hash: identity_hash,
        }
        .encode(),
    }
}

/// Open a response envelope with an explicit session key.
pub fn open_with_key<O: CryptoOps + ?Sized>(
    ops: &O,
    session_key: &SessionKey,
    response: &[u8],
) -> Result<Vec<u8>, ExchangeError> {
    let envelope = Envelope::decode(response)?;
    let plaintext = ops.aes_gcm_128_open(
        &envelope.ciphertext,
        &envelope.tag,
        session_key.as_bytes(),
        &envelope.iv,
    )?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::SoftwareOps;
    use crate::testing::{seal_response, TestOps};
    use kiln_proto::{CaAuth, KeyType, GCM_TAG_LEN, HEADER_LEN};

    const CA_X25519_PRIV: &str =
        "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb";
    const P256_CA_KEY_DER: &str = concat!(
        "30310201010420",
        "c9afa9d845ba75166b5c215767b1d6934e50c3db36e89b127b8a622b120f6721",
        "a00a06082a8648ce3d030107",
    );

    fn ca_ops(curve: Curve) -> SoftwareOps {
        match curve {
            Curve::X25519 => SoftwareOps::with_test_key(hex::decode(CA_X25519_PRIV).unwrap()),
            Curve::P256 => SoftwareOps::with_test_key(hex::decode(P256_CA_KEY_DER).unwrap()),
        }
    }

    /// The CA's deterministic public key, as published to devices.
    fn ca_public_key(curve: Curve) -> [u8; ECDH_KEY_LEN] {
        let key_pair = ca_ops(curve).generate_ecdh_keypair(curve).unwrap();
        key_pair.public_key
    }

    /// CA-side session key recovery from a request envelope's embedded
    /// device public key.
    fn ca_session_key(
        ca: &SoftwareOps,
        curve: Curve,
        device_public_key: &[u8; ECDH_KEY_LEN],
    ) -> SessionKey {
        let key_pair = ca.generate_ecdh_keypair(curve).unwrap();
        let agreement = ca
            .ecdh_shared_secret(curve, &key_pair, device_public_key)
            .unwrap();
        derive_session_key(
            ca,
            device_public_key,
            &agreement.public_key,
            &agreement.shared_secret,
            SESSION_KEY_INFO,
        )
        .unwrap()
    }

    /// Device builds a request; the CA recovers the session key from the
    /// embedded public key, decrypts the inner payload, and answers.
    fn run_exchange(curve: Curve) {
        let device_ops = SoftwareOps::new();
        let ca = ca_ops(curve);
        let ca_public = ca_public_key(curve);

        let payload = IssuePayload {
            auth: Some(CaAuth {
                certificate: b"device batch certificate".to_vec(),
                signature: vec![0x77; 360],
            }),
            product_id_hash: [0x1f; 32],
        };

        let mut exchange = Exchange::new(&device_ops, curve, ca_public);
        exchange.build_request(&payload.encode()).unwrap();
        assert_eq!(exchange.state(), ExchangeState::RequestBuilt);
        let request = exchange.take_request().unwrap();
        assert_eq!(exchange.state(), ExchangeState::AwaitingResponse);

        // CA side: recover the session key from the envelope.
        let envelope = Envelope::decode(&request).unwrap();
        let ca_key = ca_session_key(&ca, curve, &envelope.device_public_key);

        let inner = ca
            .aes_gcm_128_open(
                &envelope.ciphertext,
                &envelope.tag,
                ca_key.as_bytes(),
                &envelope.iv,
            )
            .unwrap();
        assert_eq!(IssuePayload::decode(&inner).unwrap(), payload);

        // CA answers under the same session key.
        let response_inner = b"issued key material";
        let response = seal_response(&ca, &ca_key, &envelope.device_public_key, response_inner)
            .unwrap();
        let opened = exchange.open_response(&response).unwrap();
        assert_eq!(opened, response_inner);
        assert_eq!(exchange.state(), ExchangeState::ResponseDecoded);
    }

    #[test]
    fn exchange_roundtrip_x25519() {
        run_exchange(Curve::X25519);
    }

    #[test]
    fn exchange_roundtrip_p256() {
        run_exchange(Curve::P256);
    }

    #[test]
    fn som_exchange_roundtrip() {
        let curve = Curve::X25519;
        let device_ops = SoftwareOps::new();
        let ca = ca_ops(curve);
        let start = OperationStart {
            operation: Operation::IssueSomKey,
            curve,
            ca_public_key: ca_public_key(curve),
        };

        let payload = SomPayload {
            som_id_hash: device_ops.sha256(b"som-serial-0001"),
        };
        let mut exchange = Exchange::from_start(&device_ops, &start);
        exchange.build_request(&payload.encode()).unwrap();
        let request = exchange.take_request().unwrap();

        let envelope = Envelope::decode(&request).unwrap();
        let ca_key = ca_session_key(&ca, curve, &envelope.device_public_key);
        let inner = ca
            .aes_gcm_128_open(
                &envelope.ciphertext,
                &envelope.tag,
                ca_key.as_bytes(),
                &envelope.iv,
            )
            .unwrap();
        assert_eq!(SomPayload::decode(&inner).unwrap(), payload);
    }

    #[test]
    fn fresh_requests_never_repeat() {
        let ops = SoftwareOps::new();
        let ca_public = ca_public_key(Curve::X25519);
        let plaintext = SomPayload {
            som_id_hash: [0; 32],
        }
        .encode();

        let mut first = Exchange::new(&ops, Curve::X25519, ca_public);
        first.build_request(&plaintext).unwrap();
        let a = Envelope::decode(&first.take_request().unwrap()).unwrap();

        let mut second = Exchange::new(&ops, Curve::X25519, ca_public);
        second.build_request(&plaintext).unwrap();
        let b = Envelope::decode(&second.take_request().unwrap()).unwrap();

        assert_ne!(a.device_public_key, b.device_public_key);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.tag, b.tag);
    }

    #[test]
    fn corrupted_response_fails_closed() {
        let curve = Curve::X25519;
        let ops = SoftwareOps::new();
        let ca = ca_ops(curve);
        let ca_public = ca_public_key(curve);

        let mut exchange = Exchange::new(&ops, curve, ca_public);
        exchange.build_request(b"request").unwrap();
        let request = exchange.take_request().unwrap();

        let envelope = Envelope::decode(&request).unwrap();
        let ca_key = ca_session_key(&ca, curve, &envelope.device_public_key);
        let good = seal_response(&ca, &ca_key, &envelope.device_public_key, b"response").unwrap();

        // Flip one bit in the tag.
        let mut bad = good.clone();
        let tag_start = bad.len() - GCM_TAG_LEN;
        bad[tag_start] ^= 1;
        let err = exchange.open_response(&bad).unwrap_err();
        assert!(matches!(err, ExchangeError::Crypto(CryptoError::Crypto(_))));
        assert_eq!(exchange.state(), ExchangeState::Failed);

        // A failed exchange is terminal, even for a pristine response.
        assert!(matches!(
            exchange.open_response(&good),
            Err(ExchangeError::InvalidState(ExchangeState::Failed, _))
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails_closed() {
        let curve = Curve::X25519;
        let ops = SoftwareOps::new();
        let ca = ca_ops(curve);
        let ca_public = ca_public_key(curve);

        let mut exchange = Exchange::new(&ops, curve, ca_public);
        exchange.build_request(b"request").unwrap();
        let request = exchange.take_request().unwrap();

        let envelope = Envelope::decode(&request).unwrap();
        let ca_key = ca_session_key(&ca, curve, &envelope.device_public_key);
        let mut response =
            seal_response(&ca, &ca_key, &envelope.device_public_key, b"response").unwrap();
        response[HEADER_LEN + ECDH_KEY_LEN + GCM_IV_LEN + 4] ^= 1;

        let err = exchange.open_response(&response).unwrap_err();
        assert!(matches!(err, ExchangeError::Crypto(CryptoError::Crypto(_))));
    }

    #[test]
    fn bad_header_length_rejected_before_decryption() {
        let ops = SoftwareOps::new();
        let ca_public = ca_public_key(Curve::X25519);
        let mut exchange = Exchange::new(&ops, Curve::X25519, ca_public);
        exchange.build_request(b"request").unwrap();
        // Feed the exchange its own request with a lying header; the
        // length check fires before the cipher ever runs.
        let mut response = exchange.take_request().unwrap().to_vec();
        response[4..8].copy_from_slice(&1u32.to_le_bytes());

        let err = exchange.open_response(&response).unwrap_err();
        assert!(matches!(err, ExchangeError::Envelope(_)));
        assert_eq!(exchange.state(), ExchangeState::Failed);
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let ops = SoftwareOps::new();
        let ca_public = ca_public_key(Curve::X25519);
        let mut exchange = Exchange::new(&ops, Curve::X25519, ca_public);

        assert!(matches!(
            exchange.take_request(),
            Err(ExchangeError::InvalidState(ExchangeState::Idle, _))
        ));
        assert!(matches!(
            exchange.open_response(&[]),
            Err(ExchangeError::InvalidState(ExchangeState::Idle, _))
        ));

        exchange.build_request(b"x").unwrap();
        assert!(matches!(
            exchange.build_request(b"x"),
            Err(ExchangeError::InvalidState(ExchangeState::RequestBuilt, _))
        ));
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let ops = SoftwareOps::new();
        let device_pub = [0x0a; ECDH_KEY_LEN];
        let ca_pub = [0x0b; ECDH_KEY_LEN];
        let secret = [0x0c; ECDH_SHARED_SECRET_LEN];

        let a = derive_session_key(&ops, &device_pub, &ca_pub, &secret, SESSION_KEY_INFO).unwrap();
        let b = derive_session_key(&ops, &device_pub, &ca_pub, &secret, SESSION_KEY_INFO).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());

        // Swapping the salt order must change the key; both sides have
        // to agree on device-then-CA.
        let swapped =
            derive_session_key(&ops, &ca_pub, &device_pub, &secret, SESSION_KEY_INFO).unwrap();
        assert_ne!(a.as_bytes(), swapped.as_bytes());
    }

    #[test]
    fn operation_payload_dispatches_on_operation() {
        let mut start = OperationStart {
            operation: Operation::Issue,
            curve: Curve::X25519,
            ca_public_key: [1; ECDH_KEY_LEN],
        };

        let bytes = operation_payload(&start, [5; 32], &AuthAttachment::none());
        let decoded = IssuePayload::decode(&bytes).unwrap();
        assert_eq!(decoded.auth, None);
        assert_eq!(decoded.product_id_hash, [5; 32]);

        let attachment = AuthAttachment {
            key_type: KeyType::Rsa,
            certificate: vec![1, 2],
            signature: vec![3],
        };
        let bytes = operation_payload(&start, [5; 32], &attachment);
        let decoded = IssuePayload::decode(&bytes).unwrap();
        let auth = decoded.auth.unwrap();
        assert_eq!(auth.certificate, vec![1, 2]);
        assert_eq!(auth.signature, vec![3]);

        start.operation = Operation::IssueSomKey;
        let bytes = operation_payload(&start, [6; 32], &AuthAttachment::none());
        assert_eq!(SomPayload::decode(&bytes).unwrap().som_id_hash, [6; 32]);
    }

    #[test]
    fn entropy_failure_is_terminal() {
        let ops = TestOps::new().failing_entropy();
        let ca_public = [0x0b; ECDH_KEY_LEN];
        let mut exchange = Exchange::new(&ops, Curve::X25519, ca_public);
        let err = exchange.build_request(b"request").unwrap_err();
        assert!(matches!(err, ExchangeError::Crypto(CryptoError::Io(_))));
        assert_eq!(exchange.state(), ExchangeState::Failed);
    }
}
