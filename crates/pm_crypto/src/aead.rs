//! Authenticated Encryption with Associated Data
//!
//! AES-256-GCM with detached tags.
//! Key size: 32 bytes.  Nonce: 12 bytes (random, generated here).  Tag: 16 bytes.
//!
//! Ciphertext, nonce and tag travel as separate wire fields, so encrypt
//! returns them detached instead of the usual nonce-prefixed blob.

use aes_gcm::{
    aead::{AeadCore, KeyInit, OsRng},
    AeadInPlace, Aes256Gcm, Nonce, Tag,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under a 32-byte key with a fresh random nonce.
/// `aad` is authenticated but not encrypted. Empty plaintext is legal and
/// yields an empty ciphertext with a real tag.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN], [u8; TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthFail)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buf)
        .map_err(|_| CryptoError::AuthFail)?;

    let mut nonce_out = [0u8; NONCE_LEN];
    nonce_out.copy_from_slice(&nonce);
    let mut tag_out = [0u8; TAG_LEN];
    tag_out.copy_from_slice(&tag);
    Ok((buf, nonce_out, tag_out))
}

/// Decrypt detached-tag ciphertext. Any authentication failure is reported
/// as the opaque `AuthFail` kind.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    ciphertext: &[u8],
    nonce: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::BadSize {
            field: "nonce",
            expected: NONCE_LEN,
            got: nonce.len(),
        });
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::BadSize {
            field: "tag",
            expected: TAG_LEN,
            got: tag.len(),
        });
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AuthFail)?;
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            aad,
            &mut buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::AuthFail)?;

    Ok(Zeroizing::new(buf))
}
