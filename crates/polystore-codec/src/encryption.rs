//! Password-based AES-256-GCM encryption with PBKDF2-HMAC-SHA256 key derivation.
//!
//! Every encryption draws a fresh random salt and nonce; both travel with the
//! ciphertext so nothing is reused across operations. Layout of an encrypted
//! payload: `salt (16) ‖ nonce (12) ‖ ciphertext + 16-byte GCM tag`.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CodecError;

/// Salt length prepended to every encrypted payload.
pub const SALT_LEN: usize = 16;
/// AES-GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length; the minimum ciphertext size for empty plaintext.
pub const TAG_LEN: usize = 16;

/// Key-derivation parameters. Iterations are configurable per store; the salt
/// is always per-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// PBKDF2 iteration count.
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

/// 256-bit derived key, wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey([u8; 32]);

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DerivedKey([REDACTED])")
    }
}

fn derive_key(password: &str, salt: &[u8], params: KdfParams) -> Result<DerivedKey, CodecError> {
    let mut okm = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, params.iterations, &mut okm)
        .map_err(|e| CodecError::EncryptionFailed(format!("key derivation: {e}")))?;
    Ok(DerivedKey(okm))
}

/// Encrypt plaintext under a password. Salt and nonce are generated fresh and
/// prepended to the returned bytes.
pub fn encrypt_with_password(
    plaintext: &[u8],
    password: &str,
    params: KdfParams,
) -> Result<Vec<u8>, CodecError> {
    use rand::RngCore;

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(password, &salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt_with_password`].
///
/// Returns [`CodecError::DecryptionFailed`] on a wrong password or any
/// corruption of salt, nonce or ciphertext, never garbage plaintext.
pub fn decrypt_with_password(
    payload: &[u8],
    password: &str,
    params: KdfParams,
) -> Result<Vec<u8>, CodecError> {
    if payload.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(CodecError::TruncatedCiphertext(payload.len()));
    }
    let (salt, rest) = payload.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt, params)?;
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| CodecError::EncryptionFailed(e.to_string()))?;
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CodecError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Keep tests fast; production uses the 100k default.
    const TEST_PARAMS: KdfParams = KdfParams { iterations: 1_000 };

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_roundtrip(data in prop::collection::vec(0u8..=255, 0..4_096)) {
            let enc = encrypt_with_password(&data, "hunter2", TEST_PARAMS).unwrap();
            let dec = decrypt_with_password(&enc, "hunter2", TEST_PARAMS).unwrap();
            prop_assert_eq!(dec, data);
        }
    }

    #[test]
    fn salt_and_nonce_are_fresh() {
        let a = encrypt_with_password(b"same", "pw", TEST_PARAMS).unwrap();
        let b = encrypt_with_password(b"same", "pw", TEST_PARAMS).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
    }

    #[test]
    fn wrong_password_fails() {
        let enc = encrypt_with_password(b"secret", "right", TEST_PARAMS).unwrap();
        assert!(matches!(
            decrypt_with_password(&enc, "wrong", TEST_PARAMS),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let mut enc = encrypt_with_password(b"secret", "pw", TEST_PARAMS).unwrap();
        let last = enc.len() - 1;
        enc[last] ^= 0xff;
        assert!(matches!(
            decrypt_with_password(&enc, "pw", TEST_PARAMS),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn tampered_salt_fails() {
        let mut enc = encrypt_with_password(b"secret", "pw", TEST_PARAMS).unwrap();
        enc[0] ^= 0x01;
        assert!(matches!(
            decrypt_with_password(&enc, "pw", TEST_PARAMS),
            Err(CodecError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_payload_fails() {
        assert!(matches!(
            decrypt_with_password(&[0u8; 10], "pw", TEST_PARAMS),
            Err(CodecError::TruncatedCiphertext(10))
        ));
    }
}
