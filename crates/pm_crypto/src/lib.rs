//! pm_crypto — Phantom Messenger client cryptographic engine
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Every secret buffer is zeroized before its memory is released, on
//!   every exit path.
//! - Cryptographic failures are opaque: one `AuthFail` kind for tag, MAC
//!   and signature mismatches alike.
//!
//! # Module layout
//! - `keys`       — X25519 / Ed25519 keypairs, DH, CSPRNG
//! - `aead`       — AES-256-GCM with detached tags
//! - `kdf`        — HKDF-SHA256, PBKDF2, HMAC, constant-time compare
//! - `identity`   — key bundles, deterministic identities, pre-key lifecycle
//! - `x3dh`       — asynchronous initial key agreement
//! - `session`    — per-message PFS, symmetric ratchet, burn-after-read
//! - `media`      — per-file keys with per-recipient wrapping
//! - `invitation` — signed, expiring, use-capped invitation tokens
//! - `error`      — unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod invitation;
pub mod kdf;
pub mod keys;
pub mod media;
pub mod session;
pub mod x3dh;

pub use error::CryptoError;

use base64::{engine::general_purpose::STANDARD, Engine};

/// Base64 (standard alphabet) used for every wire-visible byte field.
pub fn b64e(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(STANDARD.decode(s)?)
}
