//! Database password decryption.
//!
//! The DB password may arrive AES-256-CBC encrypted as `hexIV:hexCiphertext`
//! with the key stored base64-encoded in a file. An absent key file or an
//! empty key means the password is plaintext.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use anyhow::{anyhow, Context, Result};
use base64::Engine;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub fn decrypt(encrypted: &str, key: &str) -> Result<String> {
    if key.is_empty() {
        return Ok(encrypted.to_string());
    }

    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(key.trim())
        .context("encryption key is not valid base64")?;

    let (iv_hex, data_hex) = encrypted
        .split_once(':')
        .ok_or_else(|| anyhow!("encrypted value is not in iv:ciphertext form"))?;
    let iv = hex::decode(iv_hex).context("bad iv")?;
    let data = hex::decode(data_hex).context("bad ciphertext")?;

    let plain = Aes256CbcDec::new_from_slices(&key_bytes, &iv)
        .map_err(|e| anyhow!("bad key or iv length: {e}"))?
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|e| anyhow!("decryption failed: {e}"))?;

    String::from_utf8(plain).context("decrypted password is not utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypts_known_vector() {
        let key = "+CYp6SnbG6v14/g136kdnx5oEOt34+aIOJrVpxSkMrA=";
        let encrypted = "c6adb7742a44cac7d52dbea2a7403522:a40af19d80e55cdd4d9ff8fb6199416e";
        assert_eq!(decrypt(encrypted, key).unwrap(), "cattle");
    }

    #[test]
    fn empty_key_passes_through() {
        assert_eq!(decrypt("plain-password", "").unwrap(), "plain-password");
    }

    #[test]
    fn rejects_malformed_input() {
        let key = "+CYp6SnbG6v14/g136kdnx5oEOt34+aIOJrVpxSkMrA=";
        assert!(decrypt("no-separator", key).is_err());
        assert!(decrypt("zz:zz", key).is_err());
    }
}
