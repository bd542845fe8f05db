//! Symmetric cipher for message content
//!
//! AES-256-CBC with PKCS#7 padding, keyed by SHA-256 of a shared password
//! and a fixed 16-byte IV. When no password is configured the cipher is
//! the identity function, which is the supported "encryption optional"
//! mode for local development setups.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Message content cipher
pub struct MessageCipher {
    keying: Option<Keying>,
}

struct Keying {
    key: [u8; 32],
    iv: [u8; 16],
}

impl MessageCipher {
    /// Build a cipher from the configured password and IV.
    ///
    /// A password without a 16-byte IV is a configuration error; no
    /// password at all yields the identity cipher.
    pub fn new(password: Option<&str>, iv: Option<&str>) -> Result<Self> {
        let Some(password) = password else {
            return Ok(Self { keying: None });
        };

        let iv = iv.ok_or_else(|| {
            Error::Config("a crypto IV is required when a crypto password is set".to_string())
        })?;
        let iv: [u8; 16] = iv.as_bytes().try_into().map_err(|_| {
            Error::Config(format!(
                "crypto IV must be exactly 16 bytes, got {}",
                iv.len()
            ))
        })?;

        let key: [u8; 32] = Sha256::digest(password.as_bytes()).into();

        Ok(Self {
            keying: Some(Keying { key, iv }),
        })
    }

    /// Whether encryption is active (a password was configured)
    pub fn is_enabled(&self) -> bool {
        self.keying.is_some()
    }

    /// Encrypt plaintext; identity when no password is configured
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match &self.keying {
            None => plaintext.to_vec(),
            Some(keying) => Aes256CbcEnc::new(&keying.key.into(), &keying.iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        }
    }

    /// Decrypt ciphertext; identity when no password is configured
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &self.keying {
            None => Ok(ciphertext.to_vec()),
            Some(keying) => Aes256CbcDec::new(&keying.key.into(), &keying.iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|e| Error::Decryption(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> MessageCipher {
        MessageCipher::new(Some("test-password"), Some("0123456789abcdef")).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = cipher();
        let plaintext = b"{\"body\":\"hello\"}";

        let ciphertext = cipher.encrypt(plaintext);
        assert_ne!(ciphertext, plaintext.to_vec());

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext.to_vec());
    }

    #[test]
    fn test_identity_without_password() {
        let cipher = MessageCipher::new(None, None).unwrap();
        assert!(!cipher.is_enabled());

        let plaintext = b"plain";
        assert_eq!(cipher.encrypt(plaintext), plaintext.to_vec());
        assert_eq!(cipher.decrypt(plaintext).unwrap(), plaintext.to_vec());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = cipher();
        let mut ciphertext = cipher.encrypt(b"secret message");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;

        assert!(cipher.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_wrong_iv_length_rejected() {
        let result = MessageCipher::new(Some("pw"), Some("too-short"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_password_without_iv_rejected() {
        let result = MessageCipher::new(Some("pw"), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
