//! A minimal JWE implementation: `alg=dir`, `enc=A256GCM` (RFC 7516 compact
//! serialization). No key-wrapping algorithms or asymmetric encryption —
//! the server holds one symmetric key and uses it directly as the content
//! encryption key, which is all spec section 4.3's bearer-token validation
//! needs. Not found anywhere in the retrieved `gel-jwt` sources, so this is
//! hand-rolled against RFC 7516 directly rather than adapted from a
//! teacher file.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum JweError {
    #[display("malformed JWE compact serialization")]
    Malformed,
    #[display("unsupported JWE algorithm")]
    UnsupportedAlgorithm,
    #[display("decryption failed")]
    DecryptionFailed,
}

#[derive(Clone)]
pub struct JweKey(pub [u8; 32]);

impl JweKey {
    pub fn generate() -> Self {
        JweKey(rand_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        JweKey(bytes)
    }
}

fn rand_bytes() -> [u8; 32] {
    rand::random()
}

fn header_b64() -> String {
    B64.encode(br#"{"alg":"dir","enc":"A256GCM"}"#)
}

pub fn encrypt_compact(key: &JweKey, plaintext: &str) -> String {
    let header = header_b64();
    let iv: [u8; 12] = {
        let mut iv = [0u8; 12];
        let r = rand_bytes();
        iv.copy_from_slice(&r[..12]);
        iv
    };
    let cipher = Aes256Gcm::new_from_slice(&key.0).expect("32-byte key");
    let nonce = Nonce::from_slice(&iv);
    let aad = header.as_bytes();
    let mut ciphertext_and_tag = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext.as_bytes(),
                aad,
            },
        )
        .expect("encryption with a fresh key/nonce cannot fail");
    let tag = ciphertext_and_tag.split_off(ciphertext_and_tag.len() - 16);

    format!(
        "{}..{}.{}.{}",
        header,
        B64.encode(iv),
        B64.encode(&ciphertext_and_tag),
        B64.encode(&tag)
    )
}

pub fn decrypt_compact(key: &JweKey, token: &str) -> Result<String, JweError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 5 {
        return Err(JweError::Malformed);
    }
    let [header_b64, encrypted_key_b64, iv_b64, ciphertext_b64, tag_b64] = parts[..] else {
        return Err(JweError::Malformed);
    };
    if !encrypted_key_b64.is_empty() {
        // `dir` mode carries no encrypted key.
        return Err(JweError::UnsupportedAlgorithm);
    }
    let header_bytes = B64.decode(header_b64).map_err(|_| JweError::Malformed)?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_bytes).map_err(|_| JweError::Malformed)?;
    if header.get("alg").and_then(|v| v.as_str()) != Some("dir")
        || header.get("enc").and_then(|v| v.as_str()) != Some("A256GCM")
    {
        return Err(JweError::UnsupportedAlgorithm);
    }

    let iv = B64.decode(iv_b64).map_err(|_| JweError::Malformed)?;
    let mut ciphertext = B64.decode(ciphertext_b64).map_err(|_| JweError::Malformed)?;
    let tag = B64.decode(tag_b64).map_err(|_| JweError::Malformed)?;
    ciphertext.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(&key.0).map_err(|_| JweError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(&iv);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &ciphertext,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| JweError::DecryptionFailed)?;
    String::from_utf8(plaintext).map_err(|_| JweError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let key = JweKey::generate();
        let token = encrypt_compact(&key, "hello world");
        let decrypted = decrypt_compact(&key, &token).unwrap();
        assert_eq!(decrypted, "hello world");
    }

    #[test]
    fn wrong_key_fails() {
        let key = JweKey::generate();
        let other = JweKey::generate();
        let token = encrypt_compact(&key, "hello world");
        assert!(decrypt_compact(&other, &token).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = JweKey::generate();
        let mut token = encrypt_compact(&key, "hello world");
        token.push('x');
        assert!(decrypt_compact(&key, &token).is_err());
    }
}
