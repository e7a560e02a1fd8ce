//! Session engine: per-message forward secrecy over an established session.
//!
//! A `SessionKeys` triple (send, receive, chain) is derived once from the
//! X3DH master secret and then advanced in lockstep by the symmetric
//! ratchet. Every message additionally gets its own ephemeral X25519 DH, so
//! compromise of the session state never exposes prior traffic.
//!
//! Wire layout of one message (all byte fields base64 on the wire):
//!   ciphertext, nonce(12), tag(16), mac(32), ephemeral_public_key(32),
//!   security_salt(16), version(1)
//!
//! MAC-then-decrypt: the outer HMAC over ciphertext‖nonce is checked in
//! constant time before any AEAD work, and every failure surfaces as the
//! same opaque `AuthFail`.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    aead, b64d, b64e,
    error::CryptoError,
    identity::Identity,
    kdf,
    keys::{dh, random_array, KeyPair},
};

const SESSION_INFO: &[u8] = b"PhantomSessionKeys";
const CHAIN_RATCHET_INFO: &[u8] = b"PhantomChainRatchet";
const MESSAGE_KEY_INFO: &[u8] = b"PhantomMessageKey";
const MESSAGE_VERSION: u8 = 1;
const SECURITY_SALT_LEN: usize = 16;
const PBKDF2_BASE_ITERATIONS: u32 = 600_000;

/// Symmetric state of one direction-agnostic session. Never serialized.
#[derive(ZeroizeOnDrop)]
pub struct SessionKeys {
    send_key: [u8; 32],
    receive_key: [u8; 32],
    chain_key: [u8; 32],
    #[zeroize(skip)]
    pub message_number: u32,
}

impl SessionKeys {
    pub fn send_key(&self) -> &[u8; 32] {
        &self.send_key
    }

    pub fn receive_key(&self) -> &[u8; 32] {
        &self.receive_key
    }

    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }
}

/// Derive the session triple from a shared secret and the two public keys.
///
/// The info string orders the publics lexicographically, so both parties
/// expand identical key material; the send/receive assignment then flips on
/// the comparison, guaranteeing `A.send == B.receive`.
pub fn derive_session_keys(
    shared_secret: &[u8; 32],
    our_public: &[u8; 32],
    their_public: &[u8; 32],
) -> Result<SessionKeys, CryptoError> {
    let (lo, hi) = if our_public <= their_public {
        (our_public, their_public)
    } else {
        (their_public, our_public)
    };
    let mut info = Vec::with_capacity(SESSION_INFO.len() + 64);
    info.extend_from_slice(SESSION_INFO);
    info.extend_from_slice(lo);
    info.extend_from_slice(hi);

    let mut okm = Zeroizing::new([0u8; 96]);
    kdf::hkdf_expand(shared_secret, Some(&[0u8; 32]), &info, okm.as_mut())?;

    let mut k1 = [0u8; 32];
    let mut k2 = [0u8; 32];
    let mut chain_key = [0u8; 32];
    k1.copy_from_slice(&okm[..32]);
    k2.copy_from_slice(&okm[32..64]);
    chain_key.copy_from_slice(&okm[64..]);

    let (send_key, receive_key) = if our_public < their_public {
        (k1, k2)
    } else {
        (k2, k1)
    };

    Ok(SessionKeys {
        send_key,
        receive_key,
        chain_key,
        message_number: 0,
    })
}

/// Advance the symmetric ratchet one step: a fresh chain key, fresh
/// send/receive keys, and an incremented message number. Both parties must
/// ratchet in lockstep.
pub fn ratchet(session: &mut SessionKeys) -> Result<(), CryptoError> {
    let next_chain = kdf::hkdf_32(&session.chain_key, Some(&[0u8; 32]), CHAIN_RATCHET_INFO)?;

    let mut okm = Zeroizing::new([0u8; 64]);
    kdf::hkdf_expand(&next_chain, Some(&[0u8; 32]), MESSAGE_KEY_INFO, okm.as_mut())?;

    session.send_key.zeroize();
    session.receive_key.zeroize();
    session.chain_key.zeroize();
    session.send_key.copy_from_slice(&okm[..32]);
    session.receive_key.copy_from_slice(&okm[32..]);
    session.chain_key = next_chain;
    session.message_number += 1;
    Ok(())
}

// ── On-wire message ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedMessage {
    pub ciphertext: String,
    pub nonce: String,
    pub tag: String,
    pub mac: String,
    pub ephemeral_public_key: String,
    pub security_salt: String,
    pub version: u8,
}

#[derive(Debug)]
pub struct DecryptedMessage {
    pub content: Zeroizing<Vec<u8>>,
    pub timestamp: u64,
    pub message_number: u32,
}

fn build_aad(recipient_public: &[u8; 32], ephemeral_public: &[u8; 32], message_number: u32) -> Vec<u8> {
    // Fixed order on both sides: recipient key, then ephemeral, then counter.
    let mut aad = Vec::with_capacity(68);
    aad.extend_from_slice(recipient_public);
    aad.extend_from_slice(ephemeral_public);
    aad.extend_from_slice(&message_number.to_be_bytes());
    aad
}

/// Salt-dependent PBKDF2 hardening of the per-message key. The iteration
/// count moves with the first two salt bytes so precomputation against a
/// fixed count does not pay off.
fn enhanced_key(base_key: &[u8; 32], salt: &[u8]) -> Zeroizing<[u8; 32]> {
    let iterations = PBKDF2_BASE_ITERATIONS + ((salt[0] as u32) << 8) + salt[1] as u32;
    Zeroizing::new(kdf::pbkdf2_sha256(base_key, salt, iterations))
}

/// Encrypt one message to `recipient_public` with per-message forward
/// secrecy layered over the session state.
pub fn encrypt_message(
    plaintext: &[u8],
    session: &SessionKeys,
    sender: &Identity,
    recipient_public: &[u8; 32],
) -> Result<EncryptedMessage, CryptoError> {
    if !sender.is_active() {
        return Err(CryptoError::IdentityDestroyed);
    }

    let ephemeral = KeyPair::generate();
    let shared = Zeroizing::new(dh(ephemeral.secret_bytes(), recipient_public)?);
    let message_keys = derive_session_keys(&shared, &ephemeral.public, recipient_public)?;

    let timestamp = chrono::Utc::now().timestamp_millis() as u64;
    let mut payload = Zeroizing::new(Vec::with_capacity(16 + plaintext.len()));
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(&session.message_number.to_be_bytes());
    payload.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
    payload.extend_from_slice(plaintext);

    let security_salt: [u8; SECURITY_SALT_LEN] = random_array();
    let aad = build_aad(recipient_public, &ephemeral.public, session.message_number);

    let key = enhanced_key(message_keys.send_key(), &security_salt);
    let (ciphertext, nonce, tag) = aead::encrypt(&key, &payload, &aad)?;

    let mut mac_input = Vec::with_capacity(ciphertext.len() + nonce.len());
    mac_input.extend_from_slice(&ciphertext);
    mac_input.extend_from_slice(&nonce);
    let mac = kdf::hmac_sha256(session.chain_key(), &mac_input);

    Ok(EncryptedMessage {
        ciphertext: b64e(&ciphertext),
        nonce: b64e(&nonce),
        tag: b64e(&tag),
        mac: b64e(&mac),
        ephemeral_public_key: b64e(&ephemeral.public),
        security_salt: b64e(&security_salt),
        version: MESSAGE_VERSION,
    })
}

/// Decrypt one message addressed to `recipient`. MAC first, AEAD second,
/// and all derived material is wiped on every exit path.
pub fn decrypt_message(
    message: &EncryptedMessage,
    session: &SessionKeys,
    recipient: &Identity,
) -> Result<DecryptedMessage, CryptoError> {
    if message.version != MESSAGE_VERSION {
        return Err(CryptoError::VersionUnsupported(message.version));
    }

    let ciphertext = b64d(&message.ciphertext)?;
    let nonce = b64d(&message.nonce)?;
    let tag = b64d(&message.tag)?;
    let mac = b64d(&message.mac)?;
    let ephemeral_public = decode_key32("ephemeral key", &message.ephemeral_public_key)?;
    let security_salt = b64d(&message.security_salt)?;
    if security_salt.len() != SECURITY_SALT_LEN {
        return Err(CryptoError::BadSize {
            field: "security salt",
            expected: SECURITY_SALT_LEN,
            got: security_salt.len(),
        });
    }

    let mut mac_input = Vec::with_capacity(ciphertext.len() + nonce.len());
    mac_input.extend_from_slice(&ciphertext);
    mac_input.extend_from_slice(&nonce);
    let expected_mac = kdf::hmac_sha256(session.chain_key(), &mac_input);
    if !kdf::constant_time_eq(&expected_mac, &mac) {
        return Err(CryptoError::AuthFail);
    }

    let our_public = recipient.identity_keys()?.public;
    let shared = Zeroizing::new(dh(
        recipient.identity_keys()?.secret_bytes(),
        &ephemeral_public,
    )?);
    let message_keys = derive_session_keys(&shared, &our_public, &ephemeral_public)?;

    let aad = build_aad(&our_public, &ephemeral_public, session.message_number);
    let key = enhanced_key(message_keys.receive_key(), &security_salt);
    let payload = aead::decrypt(&key, &ciphertext, &nonce, &tag, &aad)?;

    if payload.len() < 16 {
        return Err(CryptoError::BadFormat("message payload too short".into()));
    }
    let timestamp = u64::from_be_bytes(payload[..8].try_into().expect("checked length"));
    let message_number = u32::from_be_bytes(payload[8..12].try_into().expect("checked length"));
    let content_len = u32::from_be_bytes(payload[12..16].try_into().expect("checked length")) as usize;
    if payload.len() - 16 != content_len {
        return Err(CryptoError::BadFormat("content length mismatch".into()));
    }

    Ok(DecryptedMessage {
        content: Zeroizing::new(payload[16..].to_vec()),
        timestamp,
        message_number,
    })
}

fn decode_key32(field: &'static str, b64: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = b64d(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadSize { field, expected: 32, got: len })
}

// ── Burn-after-read ──────────────────────────────────────────────────────────

/// Plaintext wrapper carried inside a burn message. The recipient client is
/// responsible for deleting local state once the content is shown; the
/// server never learns the difference.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnEnvelope {
    pub content: String,
    pub burn_token: String,
    pub burn_after_read: bool,
}

pub fn create_burn_message(
    content: &str,
    session: &SessionKeys,
    sender: &Identity,
    recipient_public: &[u8; 32],
) -> Result<EncryptedMessage, CryptoError> {
    let envelope = BurnEnvelope {
        content: content.to_string(),
        burn_token: b64e(&random_array::<32>()),
        burn_after_read: true,
    };
    let json = serde_json::to_vec(&envelope)?;
    encrypt_message(&json, session, sender, recipient_public)
}

/// Parse a decrypted payload as a burn envelope, if it is one.
pub fn open_burn_message(content: &[u8]) -> Option<BurnEnvelope> {
    serde_json::from_slice::<BurnEnvelope>(content)
        .ok()
        .filter(|e| e.burn_after_read)
}
