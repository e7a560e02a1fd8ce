//! Media encryption
//!
//! Files are sealed once under a random per-file key, then that key is
//! wrapped to each recipient with a fresh ephemeral X25519 exchange. The
//! fan-out variant re-wraps the same file key per recipient, so a 50 MiB
//! video is encrypted exactly once no matter how many devices receive it.
//!
//! Key bundle layout: k_nonce(12) ‖ k_ciphertext(32) ‖ k_tag(16).

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    aead, b64d, b64e,
    error::CryptoError,
    keys::{dh, random_array, KeyPair},
};

/// Size cap enforced by the policy layer above this module.
pub const MAX_MEDIA_BYTES: usize = 50 * 1024 * 1024;

const KEY_BUNDLE_LEN: usize = aead::NONCE_LEN + 32 + aead::TAG_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMedia {
    /// AEAD ciphertext of the file bytes (base64)
    pub encrypted_data: String,
    /// k_nonce ‖ k_ciphertext ‖ k_tag — the wrapped file key (base64)
    pub encrypted_key: String,
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub tag: String,
}

fn wrap_file_key(
    file_key: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<(Vec<u8>, [u8; 32]), CryptoError> {
    let ephemeral = KeyPair::generate();
    let shared = Zeroizing::new(dh(ephemeral.secret_bytes(), recipient_public)?);

    let (k_cipher, k_nonce, k_tag) = aead::encrypt(&shared, file_key, b"")?;
    let mut bundle = Vec::with_capacity(KEY_BUNDLE_LEN);
    bundle.extend_from_slice(&k_nonce);
    bundle.extend_from_slice(&k_cipher);
    bundle.extend_from_slice(&k_tag);
    Ok((bundle, ephemeral.public))
}

pub fn encrypt_media(
    file_bytes: &[u8],
    recipient_public: &[u8; 32],
) -> Result<EncryptedMedia, CryptoError> {
    let file_key = Zeroizing::new(random_array::<32>());
    let (ciphertext, nonce, tag) = aead::encrypt(&file_key, file_bytes, b"")?;
    let (bundle, ephemeral_public) = wrap_file_key(&file_key, recipient_public)?;

    Ok(EncryptedMedia {
        encrypted_data: b64e(&ciphertext),
        encrypted_key: b64e(&bundle),
        ephemeral_public_key: b64e(&ephemeral_public),
        nonce: b64e(&nonce),
        tag: b64e(&tag),
    })
}

/// Seal once, wrap for every recipient. Output order matches input order.
pub fn encrypt_media_for_multiple(
    file_bytes: &[u8],
    recipient_publics: &[[u8; 32]],
) -> Result<Vec<EncryptedMedia>, CryptoError> {
    let file_key = Zeroizing::new(random_array::<32>());
    let (ciphertext, nonce, tag) = aead::encrypt(&file_key, file_bytes, b"")?;
    let data_b64 = b64e(&ciphertext);
    let nonce_b64 = b64e(&nonce);
    let tag_b64 = b64e(&tag);

    recipient_publics
        .iter()
        .map(|recipient| {
            let (bundle, ephemeral_public) = wrap_file_key(&file_key, recipient)?;
            Ok(EncryptedMedia {
                encrypted_data: data_b64.clone(),
                encrypted_key: b64e(&bundle),
                ephemeral_public_key: b64e(&ephemeral_public),
                nonce: nonce_b64.clone(),
                tag: tag_b64.clone(),
            })
        })
        .collect()
}

pub fn decrypt_media(
    media: &EncryptedMedia,
    our_secret: &[u8; 32],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let bundle = b64d(&media.encrypted_key)?;
    if bundle.len() != KEY_BUNDLE_LEN {
        return Err(CryptoError::BadSize {
            field: "media key bundle",
            expected: KEY_BUNDLE_LEN,
            got: bundle.len(),
        });
    }
    let ephemeral_bytes = b64d(&media.ephemeral_public_key)?;
    let len = ephemeral_bytes.len();
    let ephemeral: [u8; 32] = ephemeral_bytes.try_into().map_err(|_| CryptoError::BadSize {
        field: "ephemeral key",
        expected: 32,
        got: len,
    })?;

    let shared = Zeroizing::new(dh(our_secret, &ephemeral)?);

    let (k_nonce, rest) = bundle.split_at(aead::NONCE_LEN);
    let (k_cipher, k_tag) = rest.split_at(rest.len() - aead::TAG_LEN);
    let file_key_plain = aead::decrypt(&shared, k_cipher, k_nonce, k_tag, b"")?;
    let file_key: Zeroizing<[u8; 32]> = Zeroizing::new(
        file_key_plain[..]
            .try_into()
            .map_err(|_| CryptoError::AuthFail)?,
    );

    let ciphertext = b64d(&media.encrypted_data)?;
    let nonce = b64d(&media.nonce)?;
    let tag = b64d(&media.tag)?;
    aead::decrypt(&file_key, &ciphertext, &nonce, &tag, b"")
}
