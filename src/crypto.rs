use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hkdf::Hkdf;
use serde_json::Value;
use sha2::Sha256;

const HKDF_SALT: &[u8] = b"auditlog-v1";
const HKDF_INFO: &[u8] = b"aes256gcm-meta-data";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Input is not something this cipher could have produced.
    #[error("malformed ciphertext: {0}")]
    Decryption(String),

    /// Tag check failed: wrong key, rotated key or tampered data.
    #[error("ciphertext failed authentication")]
    Authentication,

    #[error("encryption failed: {0}")]
    Encryption(String),
}

fn derive_key(secret: &str) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// AES-256-GCM cipher for the `meta_data` column.
///
/// Built once at startup from the configured secret and shared through
/// application state.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypt a field value as compact JSON, so a string that happens to look
    /// like JSON still decrypts to a string. Output is base64 of
    /// nonce || ciphertext.
    pub fn encrypt(&self, value: &Value) -> Result<String, CryptoError> {
        let plaintext = value.to_string();

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a value produced by [`FieldCipher::encrypt`]. Plaintext that is
    /// not JSON (bare text from older writers) comes back as a string.
    pub fn decrypt(&self, encoded: &str) -> Result<Value, CryptoError> {
        let data = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid base64: {e}")))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption(format!(
                "expected at least {} bytes, got {}",
                NONCE_LEN + TAG_LEN,
                data.len()
            )));
        }

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Authentication)?;

        let text = String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Decryption(format!("invalid UTF-8: {e}")))?;

        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_value_roundtrips() {
        let cipher = FieldCipher::new("test-key");
        let value = json!({ "browser": "firefox", "tags": ["a", "b"], "depth": { "n": 3 } });

        let encrypted = cipher.encrypt(&value).unwrap();
        assert_ne!(encrypted, value.to_string());
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), value);
    }

    #[test]
    fn plain_string_comes_back_as_string() {
        let cipher = FieldCipher::new("test-key");
        let value = Value::String("not json at all".to_string());

        let encrypted = cipher.encrypt(&value).unwrap();
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), value);
    }

    #[test]
    fn json_looking_strings_stay_strings() {
        let cipher = FieldCipher::new("test-key");
        for text in ["42", "true", "{}", "null", "[1,2]", "\"quoted\""] {
            let value = Value::String(text.to_string());
            let encrypted = cipher.encrypt(&value).unwrap();
            assert_eq!(cipher.decrypt(&encrypted).unwrap(), value, "{text}");
        }
    }

    #[test]
    fn bare_text_plaintext_decrypts_as_string() {
        let cipher = FieldCipher::new("test-key");
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut raw = nonce.to_vec();
        raw.extend(cipher.cipher.encrypt(&nonce, b"legacy note".as_slice()).unwrap());

        assert_eq!(cipher.decrypt(&BASE64.encode(raw)).unwrap(), json!("legacy note"));
    }

    #[test]
    fn nonce_differs_per_call() {
        let cipher = FieldCipher::new("test-key");
        let value = json!({ "same": true });
        assert_ne!(cipher.encrypt(&value).unwrap(), cipher.encrypt(&value).unwrap());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let encrypted = FieldCipher::new("key-one").encrypt(&json!({ "a": 1 })).unwrap();
        let err = FieldCipher::new("key-two").decrypt(&encrypted).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }

    #[test]
    fn truncated_input_is_malformed() {
        let cipher = FieldCipher::new("test-key");
        let short = BASE64.encode([0u8; 8]);
        assert!(matches!(cipher.decrypt(&short), Err(CryptoError::Decryption(_))));
        assert!(matches!(cipher.decrypt("%%%"), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let cipher = FieldCipher::new("test-key");
        let encrypted = cipher.encrypt(&json!("payload")).unwrap();
        let mut raw = BASE64.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = cipher.decrypt(&BASE64.encode(raw)).unwrap_err();
        assert!(matches!(err, CryptoError::Authentication));
    }
}
