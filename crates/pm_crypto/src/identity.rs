//! Identity key management
//!
//! Each user holds one `Identity`: a 32-byte id, an X25519 encryption
//! keypair, an Ed25519 signing keypair, a rotating list of signed pre-keys
//! (front = current) and a pool of one-time pre-keys consumed on first use.
//!
//! Identities come in two flavours:
//!   - `generate()` — fully random.
//!   - `generate_from_credentials()` — byte-deterministic from
//!     username+password, so the same credentials reproduce the same
//!     identity on any device.
//!
//! Destruction zeroizes every secret in place; any public operation on a
//! destroyed identity fails with `IdentityDestroyed`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::{
    b64d, b64e,
    error::CryptoError,
    kdf,
    keys::{random_array, KeyPair, SigningKeyPair},
};

pub const SIGNED_PRE_KEY_COUNT: u32 = 10;
pub const ONE_TIME_PRE_KEY_COUNT: u32 = 100;
pub const BUNDLE_ONE_TIME_KEYS: usize = 10;

/// Old signed pre-keys are kept after rotation so in-flight handshakes can
/// still complete, but never more than twice the working set.
const SIGNED_PRE_KEY_RETENTION: usize = 2 * SIGNED_PRE_KEY_COUNT as usize;

const CREDENTIAL_ITERATIONS: u32 = 100_000;
const EXPORT_VERSION: u8 = 1;

/// An X25519 pre-key whose public half is signed by the owner's Ed25519 key.
#[derive(Clone)]
pub struct PreKey {
    pub id: u32,
    pub keypair: KeyPair,
    pub signature: [u8; 64],
}

impl PreKey {
    fn new(id: u32, keypair: KeyPair, signing: &SigningKeyPair) -> Self {
        let signature = signing.sign(&keypair.public);
        Self { id, keypair, signature }
    }
}

/// Public half of a signed pre-key, as advertised in a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPreKeyPublic {
    pub id: u32,
    /// X25519 public key (base64)
    pub public_key: String,
    /// Ed25519 signature over the raw public bytes (base64)
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: u32,
    /// X25519 public key (base64)
    pub public_key: String,
}

/// Everything a stranger needs to start a session with us. Safe to publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicBundle {
    /// Identity id (base64 of 32 bytes)
    pub id: String,
    /// X25519 identity public key (base64)
    pub identity_key: String,
    /// Ed25519 signing public key (base64)
    pub signing_key: String,
    pub signed_pre_key: SignedPreKeyPublic,
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

pub struct Identity {
    id: [u8; 32],
    identity_keys: KeyPair,
    signing_keys: SigningKeyPair,
    /// Front = current. Rotation prepends.
    signed_pre_keys: Vec<PreKey>,
    /// Consumed from the front.
    one_time_pre_keys: Vec<PreKey>,
    /// Next id handed to a freshly minted pre-key of either kind.
    next_pre_key_id: u32,
    pub created_at: i64,
    active: bool,
}

impl Identity {
    /// Fully random identity: fresh keypairs, signed pre-keys 0..9 and
    /// one-time pre-keys 10..109.
    pub fn generate() -> Self {
        let signing_keys = SigningKeyPair::generate();
        let signed_pre_keys = (0..SIGNED_PRE_KEY_COUNT)
            .map(|i| PreKey::new(i, KeyPair::generate(), &signing_keys))
            .collect();
        let one_time_pre_keys = (SIGNED_PRE_KEY_COUNT
            ..SIGNED_PRE_KEY_COUNT + ONE_TIME_PRE_KEY_COUNT)
            .map(|i| PreKey::new(i, KeyPair::generate(), &signing_keys))
            .collect();

        Self {
            id: random_array(),
            identity_keys: KeyPair::generate(),
            signing_keys,
            signed_pre_keys,
            one_time_pre_keys,
            next_pre_key_id: SIGNED_PRE_KEY_COUNT + ONE_TIME_PRE_KEY_COUNT,
            created_at: chrono::Utc::now().timestamp_millis(),
            active: true,
        }
    }

    /// Deterministic identity. The same username+password MUST reproduce
    /// byte-identical key material, so every derivation below is fixed:
    /// PBKDF2 master seed, then HKDF sub-seeds with a 32-zero-byte salt and
    /// the literal info strings.
    pub fn generate_from_credentials(
        username: &str,
        password: &str,
    ) -> Result<Self, CryptoError> {
        if username.is_empty() || password.is_empty() {
            return Err(CryptoError::BadCredentials);
        }

        let salt = format!("phantom-identity-{username}");
        let mut master =
            kdf::pbkdf2_sha256(password.as_bytes(), salt.as_bytes(), CREDENTIAL_ITERATIONS);
        let zero_salt = [0u8; 32];

        let id = kdf::hkdf_32(&master, Some(&zero_salt), b"phantom-id")?;
        let mut identity_seed = kdf::hkdf_32(&master, Some(&zero_salt), b"phantom-identity-key")?;
        let mut signing_seed = kdf::hkdf_32(&master, Some(&zero_salt), b"phantom-signing-key")?;
        let mut pre_key_seed = kdf::hkdf_32(&master, Some(&zero_salt), b"phantom-prekeys")?;
        master.zeroize();

        let identity_keys = KeyPair::from_seed(&identity_seed);
        let signing_keys = SigningKeyPair::from_seed(&signing_seed);
        identity_seed.zeroize();
        signing_seed.zeroize();

        let derive_pre_key = |id: u32, info: String| -> Result<PreKey, CryptoError> {
            let mut seed = kdf::hkdf_32(&pre_key_seed, Some(&zero_salt), info.as_bytes())?;
            let keypair = KeyPair::from_seed(&seed);
            seed.zeroize();
            Ok(PreKey::new(id, keypair, &signing_keys))
        };

        let mut signed_pre_keys = Vec::with_capacity(SIGNED_PRE_KEY_COUNT as usize);
        for i in 0..SIGNED_PRE_KEY_COUNT {
            signed_pre_keys.push(derive_pre_key(i, format!("prekey-{i}"))?);
        }
        let mut one_time_pre_keys = Vec::with_capacity(ONE_TIME_PRE_KEY_COUNT as usize);
        for i in SIGNED_PRE_KEY_COUNT..SIGNED_PRE_KEY_COUNT + ONE_TIME_PRE_KEY_COUNT {
            one_time_pre_keys.push(derive_pre_key(i, format!("otk-{i}"))?);
        }
        pre_key_seed.zeroize();

        Ok(Self {
            id,
            identity_keys,
            signing_keys,
            signed_pre_keys,
            one_time_pre_keys,
            next_pre_key_id: SIGNED_PRE_KEY_COUNT + ONE_TIME_PRE_KEY_COUNT,
            created_at: chrono::Utc::now().timestamp_millis(),
            active: true,
        })
    }

    fn ensure_active(&self) -> Result<(), CryptoError> {
        if self.active {
            Ok(())
        } else {
            Err(CryptoError::IdentityDestroyed)
        }
    }

    pub fn id(&self) -> Result<&[u8; 32], CryptoError> {
        self.ensure_active()?;
        Ok(&self.id)
    }

    pub fn identity_keys(&self) -> Result<&KeyPair, CryptoError> {
        self.ensure_active()?;
        Ok(&self.identity_keys)
    }

    pub fn signing_keys(&self) -> Result<&SigningKeyPair, CryptoError> {
        self.ensure_active()?;
        Ok(&self.signing_keys)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current signed pre-key (front of the rotation list).
    pub fn current_signed_pre_key(&self) -> Result<&PreKey, CryptoError> {
        self.ensure_active()?;
        self.signed_pre_keys
            .first()
            .ok_or(CryptoError::KeyExchangeFailed)
    }

    /// Look up a still-retained signed pre-key by id (in-flight handshakes
    /// may reference a rotated-out key).
    pub fn signed_pre_key_by_id(&self, id: u32) -> Result<Option<&PreKey>, CryptoError> {
        self.ensure_active()?;
        Ok(self.signed_pre_keys.iter().find(|k| k.id == id))
    }

    pub fn one_time_pre_key_by_id(&self, id: u32) -> Result<Option<&PreKey>, CryptoError> {
        self.ensure_active()?;
        Ok(self.one_time_pre_keys.iter().find(|k| k.id == id))
    }

    /// Remove a one-time pre-key by id. Used by the X3DH responder: these
    /// keys are single-use, so answering a handshake consumes the key.
    pub fn take_one_time_pre_key(&mut self, id: u32) -> Result<Option<PreKey>, CryptoError> {
        self.ensure_active()?;
        let pos = self.one_time_pre_keys.iter().position(|k| k.id == id);
        Ok(pos.map(|p| self.one_time_pre_keys.remove(p)))
    }

    /// Front signed pre-key plus the first 10 one-time pre-keys.
    pub fn public_bundle(&self) -> Result<PublicBundle, CryptoError> {
        self.ensure_active()?;
        let spk = self.current_signed_pre_key()?;
        Ok(PublicBundle {
            id: b64e(&self.id),
            identity_key: b64e(&self.identity_keys.public),
            signing_key: b64e(&self.signing_keys.public),
            signed_pre_key: SignedPreKeyPublic {
                id: spk.id,
                public_key: b64e(&spk.keypair.public),
                signature: b64e(&spk.signature),
            },
            one_time_pre_keys: self
                .one_time_pre_keys
                .iter()
                .take(BUNDLE_ONE_TIME_KEYS)
                .map(|k| OneTimePreKeyPublic {
                    id: k.id,
                    public_key: b64e(&k.keypair.public),
                })
                .collect(),
        })
    }

    /// Pop the front one-time pre-key. `None` once the pool is dry.
    pub fn consume_one_time_pre_key(&mut self) -> Result<Option<PreKey>, CryptoError> {
        self.ensure_active()?;
        if self.one_time_pre_keys.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.one_time_pre_keys.remove(0)))
    }

    /// Mint a fresh signed pre-key and make it current. Rotated-out keys are
    /// retained up to `SIGNED_PRE_KEY_RETENTION`, then dropped (their secrets
    /// zeroize on drop).
    pub fn rotate_signed_pre_key(&mut self) -> Result<&PreKey, CryptoError> {
        self.ensure_active()?;
        let id = self.take_pre_key_id();
        let fresh = PreKey::new(id, KeyPair::generate(), &self.signing_keys);
        self.signed_pre_keys.insert(0, fresh);
        self.signed_pre_keys.truncate(SIGNED_PRE_KEY_RETENTION);
        Ok(&self.signed_pre_keys[0])
    }

    /// Append `n` fresh one-time pre-keys with strictly increasing ids.
    pub fn replenish_one_time_pre_keys(&mut self, n: u32) -> Result<(), CryptoError> {
        self.ensure_active()?;
        for _ in 0..n {
            let id = self.take_pre_key_id();
            let pre_key = PreKey::new(id, KeyPair::generate(), &self.signing_keys);
            self.one_time_pre_keys.push(pre_key);
        }
        Ok(())
    }

    fn take_pre_key_id(&mut self) -> u32 {
        let id = self.next_pre_key_id;
        self.next_pre_key_id += 1;
        id
    }

    /// Zeroize every secret in place and deactivate. The struct stays
    /// allocated so later calls can answer `IdentityDestroyed` instead of
    /// panicking on a moved-out value.
    pub fn destroy(&mut self) {
        self.identity_keys.wipe();
        self.signing_keys.wipe();
        for key in &mut self.signed_pre_keys {
            key.keypair.wipe();
        }
        for key in &mut self.one_time_pre_keys {
            key.keypair.wipe();
        }
        self.signed_pre_keys.clear();
        self.one_time_pre_keys.clear();
        self.id.zeroize();
        self.active = false;
    }

    /// Sizes are enforced by the fixed-length array types, so this checks
    /// what can still go wrong at runtime: the active flag, a non-empty
    /// signed pre-key list, and that every retained pre-key signature still
    /// verifies under our signing key.
    pub fn verify_integrity(&self) -> bool {
        if !self.active || self.signed_pre_keys.is_empty() {
            return false;
        }
        self.signed_pre_keys
            .iter()
            .chain(self.one_time_pre_keys.iter())
            .all(|k| crate::keys::verify(&self.signing_keys.public, &k.keypair.public, &k.signature))
    }

    /// Human-checkable fingerprint of the identity public key: SHA-256,
    /// first 20 bytes, hex in groups of 4.
    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        self.ensure_active()?;
        let hash = Sha256::digest(self.identity_keys.public);
        let hex = hex::encode(&hash[..20]);
        Ok(hex
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).expect("hex is ascii").to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }

    // ── Export / import ──────────────────────────────────────────────────

    /// Serialise to a JSON string. One-time pre-keys are deliberately not
    /// exported in full: only the next-id counter travels, and `import`
    /// regenerates the pool deterministically from the signing seed.
    pub fn export(&self) -> Result<String, CryptoError> {
        self.ensure_active()?;
        let doc = ExportedIdentity {
            version: EXPORT_VERSION,
            id: b64e(&self.id),
            identity_public_key: b64e(&self.identity_keys.public),
            identity_secret_key: b64e(self.identity_keys.secret_bytes()),
            signing_public_key: b64e(&self.signing_keys.public),
            signing_secret_key: b64e(&self.signing_keys.secret_bytes()),
            created_at: self.created_at,
            signed_pre_keys: self
                .signed_pre_keys
                .iter()
                .map(|k| ExportedPreKey {
                    id: k.id,
                    public_key: b64e(&k.keypair.public),
                    secret_key: b64e(k.keypair.secret_bytes()),
                    signature: b64e(&k.signature),
                })
                .collect(),
            one_time_pre_key_start_id: self.next_pre_key_id,
        };
        Ok(serde_json::to_string(&doc)?)
    }

    pub fn import(data: &str) -> Result<Self, CryptoError> {
        let doc: ExportedIdentity = serde_json::from_str(data)?;
        if doc.version != EXPORT_VERSION {
            return Err(CryptoError::VersionUnsupported(doc.version));
        }

        let id = decode_fixed::<32>("identity id", &doc.id)?;
        let identity_secret = decode_fixed::<32>("identity secret", &doc.identity_secret_key)?;
        let identity_keys = KeyPair::from_seed(&identity_secret);
        if b64e(&identity_keys.public) != doc.identity_public_key {
            return Err(CryptoError::BadFormat(
                "identity public key does not match secret".into(),
            ));
        }
        let signing_secret = b64d(&doc.signing_secret_key)?;
        let signing_keys = SigningKeyPair::from_secret_bytes(&signing_secret)?;

        let mut signed_pre_keys = Vec::with_capacity(doc.signed_pre_keys.len());
        for entry in &doc.signed_pre_keys {
            let secret = decode_fixed::<32>("pre-key secret", &entry.secret_key)?;
            let signature = decode_fixed::<64>("pre-key signature", &entry.signature)?;
            signed_pre_keys.push(PreKey {
                id: entry.id,
                keypair: KeyPair::from_seed(&secret),
                signature,
            });
        }
        if signed_pre_keys.is_empty() {
            return Err(CryptoError::BadFormat("no signed pre-keys in export".into()));
        }

        // Regenerate the one-time pool from the signing seed + start id.
        let zero_salt = [0u8; 32];
        let start = doc.one_time_pre_key_start_id;
        let mut one_time_pre_keys = Vec::with_capacity(ONE_TIME_PRE_KEY_COUNT as usize);
        for i in start..start + ONE_TIME_PRE_KEY_COUNT {
            let info = format!("otk-{i}");
            let mut seed =
                kdf::hkdf_32(signing_keys.seed_bytes(), Some(&zero_salt), info.as_bytes())?;
            let keypair = KeyPair::from_seed(&seed);
            seed.zeroize();
            one_time_pre_keys.push(PreKey::new(i, keypair, &signing_keys));
        }

        Ok(Self {
            id,
            identity_keys,
            signing_keys,
            signed_pre_keys,
            one_time_pre_keys,
            next_pre_key_id: start + ONE_TIME_PRE_KEY_COUNT,
            created_at: doc.created_at,
            active: true,
        })
    }
}

fn decode_fixed<const N: usize>(field: &'static str, b64: &str) -> Result<[u8; N], CryptoError> {
    let bytes = b64d(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadSize { field, expected: N, got: len })
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedIdentity {
    version: u8,
    id: String,
    identity_public_key: String,
    identity_secret_key: String,
    signing_public_key: String,
    signing_secret_key: String,
    created_at: i64,
    signed_pre_keys: Vec<ExportedPreKey>,
    one_time_pre_key_start_id: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedPreKey {
    id: u32,
    public_key: String,
    secret_key: String,
    signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_has_full_key_complement() {
        let identity = Identity::generate();
        assert!(identity.verify_integrity());
        assert_eq!(identity.signed_pre_keys.len(), 10);
        assert_eq!(identity.one_time_pre_keys.len(), 100);
        assert_eq!(identity.signed_pre_keys[0].id, 0);
        assert_eq!(identity.one_time_pre_keys[0].id, 10);
        assert_eq!(identity.one_time_pre_keys[99].id, 109);
    }

    #[test]
    fn credentials_are_byte_deterministic() {
        let a = Identity::generate_from_credentials("alice", "correct-horse-battery-staple")
            .unwrap();
        let b = Identity::generate_from_credentials("alice", "correct-horse-battery-staple")
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.identity_keys.public, b.identity_keys.public);
        assert_eq!(a.identity_keys.secret_bytes(), b.identity_keys.secret_bytes());
        assert_eq!(a.signing_keys.public, b.signing_keys.public);
        for (x, y) in a.signed_pre_keys.iter().zip(&b.signed_pre_keys) {
            assert_eq!(x.keypair.public, y.keypair.public);
            assert_eq!(x.signature, y.signature);
        }

        let c = Identity::generate_from_credentials("alice", "other-password").unwrap();
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn empty_credentials_rejected() {
        assert!(matches!(
            Identity::generate_from_credentials("", "pw"),
            Err(CryptoError::BadCredentials)
        ));
        assert!(matches!(
            Identity::generate_from_credentials("alice", ""),
            Err(CryptoError::BadCredentials)
        ));
    }

    #[test]
    fn bundle_exposes_front_keys_only() {
        let identity = Identity::generate();
        let bundle = identity.public_bundle().unwrap();
        assert_eq!(bundle.signed_pre_key.id, 0);
        assert_eq!(bundle.one_time_pre_keys.len(), 10);
        assert_eq!(bundle.one_time_pre_keys[0].id, 10);
    }

    #[test]
    fn one_time_pre_keys_pop_from_front() {
        let mut identity = Identity::generate();
        let first = identity.consume_one_time_pre_key().unwrap().unwrap();
        assert_eq!(first.id, 10);
        let second = identity.consume_one_time_pre_key().unwrap().unwrap();
        assert_eq!(second.id, 11);
        assert_eq!(identity.one_time_pre_keys.len(), 98);
    }

    #[test]
    fn rotation_prepends_and_caps_retention() {
        let mut identity = Identity::generate();
        let new_id = identity.rotate_signed_pre_key().unwrap().id;
        assert_eq!(identity.signed_pre_keys[0].id, new_id);
        assert!(new_id >= 110);

        for _ in 0..30 {
            identity.rotate_signed_pre_key().unwrap();
        }
        assert_eq!(identity.signed_pre_keys.len(), SIGNED_PRE_KEY_RETENTION);
    }

    #[test]
    fn replenish_keeps_ids_strictly_increasing() {
        let mut identity = Identity::generate();
        identity.replenish_one_time_pre_keys(5).unwrap();
        let ids: Vec<u32> = identity.one_time_pre_keys.iter().map(|k| k.id).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert_eq!(identity.one_time_pre_keys.len(), 105);
    }

    #[test]
    fn export_import_preserves_long_term_keys() {
        let identity = Identity::generate();
        let exported = identity.export().unwrap();
        let restored = Identity::import(&exported).unwrap();

        assert_eq!(identity.id, restored.id);
        assert_eq!(identity.identity_keys.public, restored.identity_keys.public);
        assert_eq!(
            identity.identity_keys.secret_bytes(),
            restored.identity_keys.secret_bytes()
        );
        assert_eq!(identity.signing_keys.public, restored.signing_keys.public);
        assert_eq!(identity.signed_pre_keys.len(), restored.signed_pre_keys.len());
        for (a, b) in identity.signed_pre_keys.iter().zip(&restored.signed_pre_keys) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.keypair.public, b.keypair.public);
            assert_eq!(a.signature, b.signature);
        }
        // The regenerated one-time pool is a fresh deterministic set.
        assert_eq!(restored.one_time_pre_keys.len(), 100);
        assert_eq!(restored.one_time_pre_keys[0].id, 110);
        assert!(restored.verify_integrity());
    }

    #[test]
    fn import_regeneration_is_deterministic() {
        let identity = Identity::generate();
        let exported = identity.export().unwrap();
        let r1 = Identity::import(&exported).unwrap();
        let r2 = Identity::import(&exported).unwrap();
        for (a, b) in r1.one_time_pre_keys.iter().zip(&r2.one_time_pre_keys) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.keypair.public, b.keypair.public);
            assert_eq!(a.keypair.secret_bytes(), b.keypair.secret_bytes());
        }
    }

    #[test]
    fn import_rejects_unknown_version() {
        let identity = Identity::generate();
        let exported = identity.export().unwrap();
        let tampered = exported.replace("\"version\":1", "\"version\":9");
        assert!(matches!(
            Identity::import(&tampered),
            Err(CryptoError::VersionUnsupported(9))
        ));
    }

    #[test]
    fn destroy_zeroizes_and_blocks_public_ops() {
        let mut identity = Identity::generate();
        identity.destroy();

        assert!(!identity.is_active());
        assert_eq!(identity.identity_keys.secret_bytes(), &[0u8; 32]);
        assert_eq!(identity.signing_keys.seed_bytes(), &[0u8; 32]);
        assert_eq!(identity.id, [0u8; 32]);
        assert!(identity.signed_pre_keys.is_empty());

        assert!(matches!(identity.public_bundle(), Err(CryptoError::IdentityDestroyed)));
        assert!(matches!(identity.export(), Err(CryptoError::IdentityDestroyed)));
        assert!(matches!(
            identity.consume_one_time_pre_key(),
            Err(CryptoError::IdentityDestroyed)
        ));
        assert!(!identity.verify_integrity());
    }

    #[test]
    fn fingerprint_is_grouped_hex() {
        let identity = Identity::generate();
        let fp = identity.fingerprint().unwrap();
        let groups: Vec<&str> = fp.split(' ').collect();
        assert_eq!(groups.len(), 10);
        assert!(groups.iter().all(|g| g.len() == 4));
    }
}
