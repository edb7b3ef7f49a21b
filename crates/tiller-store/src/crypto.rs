use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext tampered or truncated")]
    Decrypt,

    #[error("invalid base64 ciphertext: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Symmetric encryption for credential blobs at rest.
///
/// The key is derived deterministically from an installation-local secret —
/// the database file path hashed to 32 bytes — so a copied database file is
/// unreadable without also knowing where it lived. AES-256-GCM with a random
/// 96-bit nonce prepended to the ciphertext, base64 on the wire.
pub struct Crypto {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Crypto {
    /// Derive the AEAD key from the database path.
    pub fn derive(db_path: &str) -> Self {
        let digest = Sha256::digest(db_path.as_bytes());
        let unbound =
            UnboundKey::new(&AES_256_GCM, &digest).expect("SHA-256 digest is a valid AES-256 key");
        Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        }
    }

    /// Encrypt a plaintext credential. Empty input round-trips to empty.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Encrypt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    /// Decrypt a credential blob produced by `encrypt`.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let blob = base64::engine::general_purpose::STANDARD.decode(ciphertext)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }

        let (nonce_bytes, sealed) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Decrypt)?;

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Decrypt)
    }
}
