use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Encrypts per-user adapter credentials and provider secrets at rest with
/// AES-256-GCM. The key is derived from a process-wide environment secret;
/// this module is the encryption boundary of the persistence adapter.
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Derive the symmetric key from an environment secret.
    pub fn from_secret(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"ojforge-credentials-v1");
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt a credential field map into a base64 blob for a TEXT column.
    pub fn encrypt_fields(&self, fields: &BTreeMap<String, String>) -> Result<String> {
        let plaintext = serde_json::to_vec(fields)?;
        let cipher = Aes256Gcm::new_from_slice(&self.key)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

        let mut framed = Vec::with_capacity(4 + nonce.len() + 4 + ciphertext.len());
        framed.extend_from_slice(&(nonce.len() as u32).to_le_bytes());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        framed.extend_from_slice(&ciphertext);

        use base64::Engine as _;
        Ok(base64::engine::general_purpose::STANDARD.encode(framed))
    }

    /// Decrypt a blob produced by [`encrypt_fields`].
    pub fn decrypt_fields(&self, blob: &str) -> Result<BTreeMap<String, String>> {
        use base64::Engine as _;
        let data = base64::engine::general_purpose::STANDARD.decode(blob)?;

        let read_len = |data: &[u8], offset: usize| -> Result<usize> {
            let bytes: [u8; 4] = data
                .get(offset..offset + 4)
                .ok_or_else(|| anyhow::anyhow!("credential blob truncated"))?
                .try_into()?;
            Ok(u32::from_le_bytes(bytes) as usize)
        };

        let nonce_len = read_len(&data, 0)?;
        let nonce_end = 4 + nonce_len;
        let nonce = data
            .get(4..nonce_end)
            .ok_or_else(|| anyhow::anyhow!("credential blob truncated"))?;
        let ct_len = read_len(&data, nonce_end)?;
        let ct_start = nonce_end + 4;
        let ciphertext = data
            .get(ct_start..ct_start + ct_len)
            .ok_or_else(|| anyhow::anyhow!("credential blob truncated"))?;

        let cipher = Aes256Gcm::new_from_slice(&self.key)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {e}"))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cipher = CredentialCipher::from_secret("test-secret");
        let mut fields = BTreeMap::new();
        fields.insert("base_url".to_string(), "https://oj.example.com".to_string());
        fields.insert("token".to_string(), "s3cr3t".to_string());

        let blob = cipher.encrypt_fields(&fields).unwrap();
        assert_ne!(blob, serde_json::to_string(&fields).unwrap());
        assert_eq!(cipher.decrypt_fields(&blob).unwrap(), fields);
    }

    #[test]
    fn wrong_key_fails() {
        let cipher = CredentialCipher::from_secret("one");
        let other = CredentialCipher::from_secret("two");
        let mut fields = BTreeMap::new();
        fields.insert("k".to_string(), "v".to_string());
        let blob = cipher.encrypt_fields(&fields).unwrap();
        assert!(other.decrypt_fields(&blob).is_err());
    }
}
