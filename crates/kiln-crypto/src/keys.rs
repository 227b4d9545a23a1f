//! Loading and saving key material for provisioning runs.
//!
//! File handling sits outside the protocol core; these helpers exist so
//! tools and tests share one format. A key file holds either raw bytes
//! or hex text (whitespace tolerated).

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use zeroize::Zeroize;

use kiln_proto::ECDH_KEY_LEN;

/// Load a CA public key in the fixed wire encoding.
pub fn load_ca_public_key(path: impl AsRef<Path>) -> Result<[u8; ECDH_KEY_LEN]> {
    let path = path.as_ref();
    let raw = fs::read(path)
        .with_context(|| format!("failed to read CA public key {}", path.display()))?;
    let bytes = decode_raw_or_hex(&raw)
        .with_context(|| format!("invalid CA public key {}", path.display()))?;
    if bytes.len() != ECDH_KEY_LEN {
        bail!(
            "invalid CA public key length: expected {ECDH_KEY_LEN} bytes, got {}",
            bytes.len()
        );
    }
    let mut key = [0u8; ECDH_KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Load a deterministic ECDH private key for test provisioning (raw
/// X25519 bytes or a SEC1 DER blob, optionally hex encoded).
pub fn load_test_key(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let mut raw =
        fs::read(path).with_context(|| format!("failed to read test key {}", path.display()))?;
    let bytes = decode_raw_or_hex(&raw)
        .with_context(|| format!("invalid test key {}", path.display()))?;
    raw.zeroize();
    if bytes.is_empty() {
        bail!("test key {} is empty", path.display());
    }
    Ok(bytes)
}

/// Save a test private key with owner-only permissions on Unix.
pub fn save_test_key(path: impl AsRef<Path>, key: &[u8]) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, key)
        .with_context(|| format!("failed to write test key {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Hex if every byte is a hex digit or whitespace with an even digit
/// count; raw otherwise. Real binary keys land in the hex alphabet with
/// negligible probability.
fn decode_raw_or_hex(raw: &[u8]) -> Result<Vec<u8>> {
    let looks_hex = !raw.is_empty()
        && raw
            .iter()
            .all(|b| b.is_ascii_hexdigit() || b.is_ascii_whitespace());
    if looks_hex {
        let digits: String = raw
            .iter()
            .filter(|b| !b.is_ascii_whitespace())
            .map(|&b| b as char)
            .collect();
        if digits.len() % 2 == 0 && !digits.is_empty() {
            return hex::decode(&digits).context("invalid hex key file");
        }
    }
    Ok(raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        env::temp_dir().join(format!("kiln-keys-{}-{}", std::process::id(), name))
    }

    #[test]
    fn raw_roundtrip() {
        let path = scratch("raw");
        let key = vec![0xd7; 32];
        save_test_key(&path, &key).unwrap();
        assert_eq!(load_test_key(&path).unwrap(), key);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn hex_file_is_decoded() {
        let path = scratch("hex");
        fs::write(&path, "0011aaff\n").unwrap();
        assert_eq!(load_test_key(&path).unwrap(), vec![0x00, 0x11, 0xaa, 0xff]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn ca_public_key_length_enforced() {
        let path = scratch("short-pub");
        fs::write(&path, [0u8; 16]).unwrap();
        assert!(load_ca_public_key(&path).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn ca_public_key_roundtrip() {
        let path = scratch("pub");
        let key = [0x9cu8; ECDH_KEY_LEN];
        fs::write(&path, key).unwrap();
        assert_eq!(load_ca_public_key(&path).unwrap(), key);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_test_key("/nonexistent/kiln-test-key").unwrap_err();
        assert!(err.to_string().contains("kiln-test-key"));
    }
}
