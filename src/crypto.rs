//! Encryption-at-rest for tenant credentials.
//!
//! Bot tokens and webhook secrets are never stored in plaintext.  Each value
//! is sealed with ChaCha20-Poly1305 under a master key derived from the
//! configured secret, with the value's purpose bound in as associated data so
//! a blob encrypted as one kind of secret cannot be decrypted as another.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const MASTER_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;

/// Purpose tag mixed into the AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretKind {
    BotToken,
    WebhookToken,
    WebhookUrl,
    WebhookRedirectToken,
}

impl SecretKind {
    fn aad(self) -> &'static [u8] {
        match self {
            SecretKind::BotToken => b"bot-token",
            SecretKind::WebhookToken => b"webhook-token",
            SecretKind::WebhookUrl => b"webhook-url",
            SecretKind::WebhookRedirectToken => b"webhook-redirect-token",
        }
    }
}

#[derive(Debug)]
pub enum CryptoError {
    InvalidLength(&'static str),
    Aead(chacha20poly1305::aead::Error),
    Utf8(std::string::FromUtf8Error),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::InvalidLength(msg) => write!(f, "invalid length: {msg}"),
            CryptoError::Aead(_) => write!(f, "decryption failed"),
            CryptoError::Utf8(e) => write!(f, "decrypted value is not utf-8: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<chacha20poly1305::aead::Error> for CryptoError {
    fn from(error: chacha20poly1305::aead::Error) -> Self {
        CryptoError::Aead(error)
    }
}

impl From<std::string::FromUtf8Error> for CryptoError {
    fn from(error: std::string::FromUtf8Error) -> Self {
        CryptoError::Utf8(error)
    }
}

/// Credential sealer bound to one master key.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; MASTER_KEY_SIZE],
}

impl SecretBox {
    /// Derive the master key from an arbitrary-length secret string.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; MASTER_KEY_SIZE];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Seal a plaintext value. The output blob is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &str, kind: SecretKind) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let key = Key::from_slice(&self.key);
        let aead = ChaCha20Poly1305::new(key);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = aead.encrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: plaintext.as_bytes(),
                aad: kind.aad(),
            },
        )?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open a blob produced by [`seal`](Self::seal) with the same purpose.
    pub fn open(&self, blob: &[u8], kind: SecretKind) -> Result<String, CryptoError> {
        if blob.len() <= NONCE_SIZE {
            return Err(CryptoError::InvalidLength(
                "sealed blob shorter than nonce",
            ));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        let key = Key::from_slice(&self.key);
        let aead = ChaCha20Poly1305::new(key);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = aead.decrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad: kind.aad(),
            },
        )?;
        Ok(String::from_utf8(plaintext)?)
    }
}

/// Generate a random URL-safe webhook secret token.
pub fn generate_secret_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
