//! Raw keypair types and curve operations
//!
//! `KeyPair` — X25519, used for identity encryption keys, pre-keys and
//!   per-message ephemerals.
//! `SigningKeyPair` — Ed25519, used for pre-key signatures, invitations and
//!   challenge responses.
//!
//! Secret halves are zeroized on drop. `verify` never panics; malformed
//! inputs simply fail verification.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const ED25519_SECRET_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

/// Fill `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fixed-size variant for the common 32-byte case.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

// ── X25519 ───────────────────────────────────────────────────────────────────

/// X25519 keypair. The secret is stored clamped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    pub public: [u8; 32],
    secret: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Deterministic keypair: the seed becomes the secret after RFC 7748
    /// clamping (done by `StaticSecret::from`).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*seed);
        let public = X25519Public::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret: secret.to_bytes(),
        }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Zeroize the secret in place. Used by identity destruction, where the
    /// struct must stay allocated to keep answering (with an error).
    pub fn wipe(&mut self) {
        self.secret.zeroize();
    }
}

/// X25519 shared secret. Rejects the all-zero output of small-subgroup
/// public keys.
pub fn dh(secret: &[u8; 32], public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
    let sk = StaticSecret::from(*secret);
    let shared = sk.diffie_hellman(&X25519Public::from(*public));
    let mut out = *shared.as_bytes();
    if out.iter().all(|&b| b == 0) {
        out.zeroize();
        return Err(CryptoError::KeyExchangeFailed);
    }
    Ok(out)
}

// ── Ed25519 ──────────────────────────────────────────────────────────────────

/// Ed25519 keypair. The secret is held as the 32-byte seed; the wire/export
/// representation is the 64-byte seed‖public form.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    pub public: [u8; 32],
    seed: [u8; 32],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(seed);
        Self {
            public: signing.verifying_key().to_bytes(),
            seed: *seed,
        }
    }

    /// Reconstruct from the 64-byte seed‖public export form.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ED25519_SECRET_LEN {
            return Err(CryptoError::BadSize {
                field: "ed25519 secret",
                expected: ED25519_SECRET_LEN,
                got: bytes.len(),
            });
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let pair = Self::from_seed(&seed);
        if pair.public != bytes[32..] {
            return Err(CryptoError::BadFormat(
                "ed25519 secret/public halves do not match".into(),
            ));
        }
        Ok(pair)
    }

    pub fn seed_bytes(&self) -> &[u8; 32] {
        &self.seed
    }

    /// 64-byte seed‖public form used by export.
    pub fn secret_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.seed);
        out[32..].copy_from_slice(&self.public);
        out
    }

    /// Sign arbitrary bytes; 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.seed).sign(msg).to_bytes()
    }

    /// Zeroize the seed in place.
    pub fn wipe(&mut self) {
        self.seed.zeroize();
    }
}

/// Verify an Ed25519 signature. Returns `false` for malformed keys or
/// signatures instead of surfacing a reason.
pub fn verify(public: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(pub_arr) = <&[u8; 32]>::try_from(public) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pub_arr) else {
        return false;
    };
    let Ok(sig_arr) = <&[u8; 64]>::try_from(signature) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(sig_arr)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_is_commutative() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = dh(a.secret_bytes(), &b.public).unwrap();
        let ba = dh(b.secret_bytes(), &a.public).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn dh_rejects_small_subgroup_point() {
        let a = KeyPair::generate();
        let err = dh(a.secret_bytes(), &[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::KeyExchangeFailed));
    }

    #[test]
    fn seeded_keypairs_are_deterministic() {
        let seed = [42u8; 32];
        assert_eq!(KeyPair::from_seed(&seed).public, KeyPair::from_seed(&seed).public);
        assert_eq!(
            SigningKeyPair::from_seed(&seed).public,
            SigningKeyPair::from_seed(&seed).public
        );
    }

    #[test]
    fn sign_verify_roundtrip() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"challenge");
        assert!(verify(&kp.public, b"challenge", &sig));
        assert!(!verify(&kp.public, b"challenge!", &sig));
        assert!(!verify(&[0u8; 31], b"challenge", &sig));
    }

    #[test]
    fn signing_secret_roundtrips_through_64_byte_form() {
        let kp = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public, restored.public);
        assert_eq!(kp.sign(b"m"), restored.sign(b"m"));
    }
}
