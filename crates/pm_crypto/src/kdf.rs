//! Key derivation and message authentication
//!
//! `hkdf_expand` — HKDF-SHA256 (RFC 5869), used everywhere session and
//!   invitation key material is derived.
//! `pbkdf2_sha256` — credential-derived master seeds and the per-message
//!   hardened AEAD key.
//! `hmac_sha256` / `constant_time_eq` — outer message MACs.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
/// `salt` of `None` means the RFC 5869 zeroed salt.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Convenience: HKDF straight into a 32-byte key.
pub fn hkdf_32(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_expand(ikm, salt, info, &mut out)?;
    Ok(out)
}

/// PBKDF2-HMAC-SHA256 into a 32-byte output.
pub fn pbkdf2_sha256(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// HMAC-SHA256 tag over `data`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time equality. Differing lengths compare unequal immediately;
/// equal-length inputs are compared without data-dependent branching.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let a = hkdf_32(b"ikm", Some(&[0u8; 32]), b"info").unwrap();
        let b = hkdf_32(b"ikm", Some(&[0u8; 32]), b"info").unwrap();
        assert_eq!(a, b);
        let c = hkdf_32(b"ikm", Some(&[0u8; 32]), b"other").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn pbkdf2_matches_itself() {
        let a = pbkdf2_sha256(b"password", b"salt", 1000);
        let b = pbkdf2_sha256(b"password", b"salt", 1000);
        assert_eq!(a, b);
        assert_ne!(a, pbkdf2_sha256(b"password", b"salt", 1001));
    }

    #[test]
    fn ct_eq_handles_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
