//! Outer CA request/response envelope.
//!
//! Both directions share one layout:
//!
//! ```text
//! offset        field
//! 0             reserved/version (u32)
//! 4             length of everything after the header (u32)
//! 8             device ECDH public key (33 bytes)
//! 41            IV (12 bytes)
//! 53            ciphertext length (u32)
//! 57            ciphertext
//! 57 + ct_len   AEAD tag (16 bytes)
//! ```
//!
//! The header length field must equal
//! `ECDH_KEY_LEN + GCM_IV_LEN + 4 + ciphertext_len + GCM_TAG_LEN`; decode
//! enforces this before anything is handed to the cipher.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Reader;
use crate::{WireError, ECDH_KEY_LEN, GCM_IV_LEN, GCM_TAG_LEN, HEADER_LEN, PROTOCOL_VERSION};

/// Encrypted envelope carrying one CA request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Reserved/version word. Written as [`PROTOCOL_VERSION`], not
    /// enforced on decode.
    pub version: u32,
    /// Device ephemeral ECDH public key for this exchange.
    pub device_public_key: [u8; ECDH_KEY_LEN],
    /// AES-GCM IV, fresh per envelope.
    pub iv: [u8; GCM_IV_LEN],
    /// AEAD ciphertext of the inner payload.
    pub ciphertext: Vec<u8>,
    /// AEAD authentication tag.
    pub tag: [u8; GCM_TAG_LEN],
}

impl Envelope {
    /// Assemble an envelope with the current protocol version.
    pub fn new(
        device_public_key: [u8; ECDH_KEY_LEN],
        iv: [u8; GCM_IV_LEN],
        ciphertext: Vec<u8>,
        tag: [u8; GCM_TAG_LEN],
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            device_public_key,
            iv,
            ciphertext,
            tag,
        }
    }

    /// Byte count of everything following the header.
    pub fn body_len(&self) -> usize {
        ECDH_KEY_LEN + GCM_IV_LEN + 4 + self.ciphertext.len() + GCM_TAG_LEN
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    /// Encode to wire bytes. The header length field is derived from the
    /// actual layout, so it is consistent by construction.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.body_len() as u32);
        buf.put_slice(&self.device_public_key);
        buf.put_slice(&self.iv);
        buf.put_u32_le(self.ciphertext.len() as u32);
        buf.put_slice(&self.ciphertext);
        buf.put_slice(&self.tag);
        buf.freeze()
    }

    /// Decode and validate an envelope.
    ///
    /// The header length field must match both the actual remaining byte
    /// count and the fixed field layout; all checks happen before any
    /// field is copied out.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let version = r.read_u32()?;
        let declared = r.read_u32()? as usize;
        if declared != r.remaining() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: r.remaining(),
            });
        }

        let device_public_key = r.take_array::<ECDH_KEY_LEN>()?;
        let iv = r.take_array::<GCM_IV_LEN>()?;
        let ciphertext_len = r.read_u32()? as usize;

        let expected = ECDH_KEY_LEN + GCM_IV_LEN + 4 + ciphertext_len + GCM_TAG_LEN;
        if declared != expected {
            return Err(WireError::LengthMismatch {
                declared,
                actual: expected,
            });
        }

        let ciphertext = r.take(ciphertext_len)?.to_vec();
        let tag = r.take_array::<GCM_TAG_LEN>()?;
        r.finish()?;

        Ok(Self {
            version,
            device_public_key,
            iv,
            ciphertext,
            tag,
        })
    }
}
