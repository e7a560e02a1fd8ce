//! Signed, expiring invitation tokens
//!
//! An invitation is two artefacts travelling together:
//!   - the full `SecureInvitation` (signed ciphertext, serialisable), and
//!   - a short human-readable code `PHM-XXXX-XXXX-…` carrying id ‖ secret.
//!
//! The code alone cannot mint an invitation: it only identifies one and
//! derives the HKDF wrapping key that opens its payload. Validation order is
//! fixed — format, revocation, expiry, signature, decrypt, uses — and fails
//! fast with the specific kind at each step.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    aead, b64d, b64e,
    error::CryptoError,
    identity::Identity,
    kdf,
    keys::random_array,
};

const INVITATION_INFO: &[u8] = b"PhantomInvitation";
const DEFAULT_EXPIRY_MS: i64 = 24 * 60 * 60 * 1000;
const CODE_PREFIX: &str = "PHM-";
const CODE_GROUP: usize = 4;

#[derive(Debug, Clone)]
pub struct InvitationOptions {
    /// Lifetime in milliseconds; `None` means the 24 h default.
    pub expires_in_ms: Option<i64>,
    pub single_use: bool,
    pub max_uses: u32,
    pub metadata: serde_json::Value,
}

impl Default for InvitationOptions {
    fn default() -> Self {
        Self {
            expires_in_ms: None,
            single_use: true,
            max_uses: 1,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecureInvitation {
    /// 32-byte invitation id (base64)
    pub id: String,
    /// k_nonce ‖ ciphertext ‖ tag of the payload JSON (base64)
    pub encrypted_payload: String,
    /// Creator's X25519 identity public key (base64)
    pub creator_public_key: String,
    /// Ed25519 signature over id ‖ encrypted_payload ‖ expires_at (u64 LE)
    pub signature: String,
    /// Expiry, ms since epoch
    pub expires_at: u64,
    pub single_use: bool,
    pub revoked: bool,
}

/// Decrypted invitation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvitationData {
    pub creator_public_key: String,
    pub creator_signing_key: String,
    pub expires_at: u64,
    pub single_use: bool,
    pub max_uses: u32,
    pub uses_remaining: u32,
    pub metadata: serde_json::Value,
    pub created_at: u64,
}

fn wrap_key(secret: &[u8; 32], id: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    Ok(Zeroizing::new(kdf::hkdf_32(secret, Some(id), INVITATION_INFO)?))
}

fn signing_input(id: &[u8; 32], encrypted_payload: &[u8], expires_at: u64) -> Vec<u8> {
    let mut input = Vec::with_capacity(32 + encrypted_payload.len() + 8);
    input.extend_from_slice(id);
    input.extend_from_slice(encrypted_payload);
    input.extend_from_slice(&expires_at.to_le_bytes());
    input
}

/// Render `id ‖ secret` as the dash-grouped human code.
fn format_code(id: &[u8; 32], secret: &[u8; 32]) -> String {
    let mut raw = Vec::with_capacity(64);
    raw.extend_from_slice(id);
    raw.extend_from_slice(secret);
    let b64 = b64e(&raw);
    let grouped = b64
        .as_bytes()
        .chunks(CODE_GROUP)
        .map(|c| std::str::from_utf8(c).expect("base64 is ascii"))
        .collect::<Vec<_>>()
        .join("-");
    format!("{CODE_PREFIX}{grouped}")
}

fn parse_code(code: &str) -> Result<([u8; 32], Zeroizing<[u8; 32]>), CryptoError> {
    let body = code
        .strip_prefix(CODE_PREFIX)
        .ok_or_else(|| CryptoError::BadFormat("missing PHM- prefix".into()))?;
    let b64: String = body.chars().filter(|&c| c != '-').collect();
    let raw = b64d(&b64)?;
    if raw.len() != 64 {
        return Err(CryptoError::BadSize {
            field: "invitation code",
            expected: 64,
            got: raw.len(),
        });
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&raw[..32]);
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&raw[32..]);
    Ok((id, secret))
}

/// Mint an invitation. Returns the signed invitation, the human code and
/// the raw secret (for callers that store it separately from the code).
pub fn generate(
    creator: &Identity,
    options: &InvitationOptions,
) -> Result<(SecureInvitation, String, Zeroizing<[u8; 32]>), CryptoError> {
    let id: [u8; 32] = random_array();
    let secret = Zeroizing::new(random_array::<32>());

    let now = chrono::Utc::now().timestamp_millis();
    let expires_at = now
        .saturating_add(options.expires_in_ms.unwrap_or(DEFAULT_EXPIRY_MS))
        .max(0) as u64;

    let payload = InvitationData {
        creator_public_key: b64e(&creator.identity_keys()?.public),
        creator_signing_key: b64e(&creator.signing_keys()?.public),
        expires_at,
        single_use: options.single_use,
        max_uses: options.max_uses,
        uses_remaining: options.max_uses,
        metadata: options.metadata.clone(),
        created_at: now.max(0) as u64,
    };
    let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);

    let key = wrap_key(&secret, &id)?;
    let (ciphertext, nonce, tag) = aead::encrypt(&key, &plaintext, b"")?;
    let mut bundle = Vec::with_capacity(aead::NONCE_LEN + ciphertext.len() + aead::TAG_LEN);
    bundle.extend_from_slice(&nonce);
    bundle.extend_from_slice(&ciphertext);
    bundle.extend_from_slice(&tag);

    let signature = creator
        .signing_keys()?
        .sign(&signing_input(&id, &bundle, expires_at));

    let invitation = SecureInvitation {
        id: b64e(&id),
        encrypted_payload: b64e(&bundle),
        creator_public_key: b64e(&creator.identity_keys()?.public),
        signature: b64e(&signature),
        expires_at,
        single_use: options.single_use,
        revoked: false,
    };
    let code = format_code(&id, &secret);
    Ok((invitation, code, secret))
}

/// Cheap liveness check consulted before full validation.
pub fn is_valid(invitation: &SecureInvitation) -> bool {
    !invitation.revoked && chrono::Utc::now().timestamp_millis() as u64 <= invitation.expires_at
}

pub fn revoke(invitation: &mut SecureInvitation) {
    invitation.revoked = true;
}

/// Full validation of a code against its invitation.
pub fn validate(
    code: &str,
    invitation: &SecureInvitation,
    creator_signing_public: &[u8; 32],
) -> Result<InvitationData, CryptoError> {
    let (id, secret) = parse_code(code)?;
    if b64e(&id) != invitation.id {
        return Err(CryptoError::BadFormat("code does not match invitation".into()));
    }
    if invitation.revoked {
        return Err(CryptoError::Revoked);
    }
    if chrono::Utc::now().timestamp_millis() as u64 > invitation.expires_at {
        return Err(CryptoError::Expired);
    }

    let bundle = b64d(&invitation.encrypted_payload)?;
    if !crate::keys::verify(
        creator_signing_public,
        &signing_input(&id, &bundle, invitation.expires_at),
        &b64d(&invitation.signature)?,
    ) {
        return Err(CryptoError::AuthFail);
    }

    if bundle.len() < aead::NONCE_LEN + aead::TAG_LEN {
        return Err(CryptoError::BadFormat("payload bundle too short".into()));
    }
    let (nonce, rest) = bundle.split_at(aead::NONCE_LEN);
    let (ciphertext, tag) = rest.split_at(rest.len() - aead::TAG_LEN);

    let key = wrap_key(&secret, &id)?;
    let plaintext = aead::decrypt(&key, ciphertext, nonce, tag, b"")?;
    let data: InvitationData = serde_json::from_slice(&plaintext)?;

    if data.uses_remaining == 0 {
        return Err(CryptoError::Exhausted);
    }
    Ok(data)
}

pub fn serialize_invitation(invitation: &SecureInvitation) -> Result<String, CryptoError> {
    Ok(serde_json::to_string(invitation)?)
}

pub fn deserialize_invitation(data: &str) -> Result<SecureInvitation, CryptoError> {
    Ok(serde_json::from_str(data)?)
}
