//! X3DH-style asynchronous key agreement.
//!
//! Reference: Signal X3DH spec <https://signal.org/docs/specifications/x3dh/>
//!
//! Alice (initiator) holds Bob's published `PublicBundle`:
//!   IK_B  (X25519 identity key)
//!   SPK_B (signed pre-key) + Ed25519 signature by Bob's signing key
//!   OTPK_B (one-time pre-key, optional)
//!
//! Alice generates one ephemeral keypair EK_A and computes, in this fixed
//! order:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OTPK_B)   [if present]
//!
//! master = HKDF(DH1 || DH2 || DH3 [|| DH4], salt = 0*32, "PhantomX3DH")
//!
//! The SPK signature MUST be verified before any DH is computed. All DH
//! intermediates are zeroized as soon as the master secret exists.

use zeroize::{Zeroize, Zeroizing};

use crate::{
    b64d,
    error::CryptoError,
    identity::{Identity, PublicBundle},
    kdf,
    keys::{dh, KeyPair},
};

const X3DH_INFO: &[u8] = b"PhantomX3DH";

/// What the initiator walks away with: the master secret plus the public
/// material the responder needs to mirror the computation.
pub struct Initiation {
    pub shared_secret: Zeroizing<[u8; 32]>,
    pub ephemeral_public: [u8; 32],
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

fn decode_key(field: &'static str, b64: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = b64d(b64)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::BadSize { field, expected: 32, got: len })
}

fn derive_master(parts: &mut Vec<u8>) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut master = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(parts, Some(&[0u8; 32]), X3DH_INFO, master.as_mut())?;
    parts.zeroize();
    Ok(master)
}

/// Initiate against a recipient bundle. Consumes the first advertised
/// one-time pre-key if the bundle carries any.
pub fn initiate(our: &Identity, bundle: &PublicBundle) -> Result<Initiation, CryptoError> {
    let ik_b = decode_key("identity key", &bundle.identity_key)?;
    let signing_b = decode_key("signing key", &bundle.signing_key)?;
    let spk_b = decode_key("signed pre-key", &bundle.signed_pre_key.public_key)?;
    let spk_sig = b64d(&bundle.signed_pre_key.signature)?;

    if !crate::keys::verify(&signing_b, &spk_b, &spk_sig) {
        return Err(CryptoError::BadSignedPreKey);
    }

    let ephemeral = KeyPair::generate();

    let mut dh1 = dh(our.identity_keys()?.secret_bytes(), &spk_b)?;
    let mut dh2 = dh(ephemeral.secret_bytes(), &ik_b)?;
    let mut dh3 = dh(ephemeral.secret_bytes(), &spk_b)?;

    let mut parts = Vec::with_capacity(4 * 32);
    parts.extend_from_slice(&dh1);
    parts.extend_from_slice(&dh2);
    parts.extend_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    let mut one_time_pre_key_id = None;
    if let Some(otpk) = bundle.one_time_pre_keys.first() {
        let otpk_b = decode_key("one-time pre-key", &otpk.public_key)?;
        let mut dh4 = dh(ephemeral.secret_bytes(), &otpk_b)?;
        parts.extend_from_slice(&dh4);
        dh4.zeroize();
        one_time_pre_key_id = Some(otpk.id);
    }

    let shared_secret = derive_master(&mut parts)?;

    Ok(Initiation {
        shared_secret,
        ephemeral_public: ephemeral.public,
        signed_pre_key_id: bundle.signed_pre_key.id,
        one_time_pre_key_id,
    })
}

/// Responder side: mirror the initiator's DH set with our secrets and the
/// initiator-supplied publics. Consumes the referenced one-time pre-key.
pub fn respond(
    our: &mut Identity,
    initiator_identity_key: &[u8; 32],
    initiator_ephemeral: &[u8; 32],
    signed_pre_key_id: u32,
    one_time_pre_key_id: Option<u32>,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let spk = our
        .signed_pre_key_by_id(signed_pre_key_id)?
        .ok_or(CryptoError::KeyExchangeFailed)?;
    let spk_secret = Zeroizing::new(*spk.keypair.secret_bytes());

    let mut dh1 = dh(&spk_secret, initiator_identity_key)?;
    let mut dh2 = dh(our.identity_keys()?.secret_bytes(), initiator_ephemeral)?;
    let mut dh3 = dh(&spk_secret, initiator_ephemeral)?;

    let mut parts = Vec::with_capacity(4 * 32);
    parts.extend_from_slice(&dh1);
    parts.extend_from_slice(&dh2);
    parts.extend_from_slice(&dh3);
    dh1.zeroize();
    dh2.zeroize();
    dh3.zeroize();

    if let Some(id) = one_time_pre_key_id {
        let otpk = our
            .take_one_time_pre_key(id)?
            .ok_or(CryptoError::KeyExchangeFailed)?;
        let mut dh4 = dh(otpk.keypair.secret_bytes(), initiator_ephemeral)?;
        parts.extend_from_slice(&dh4);
        dh4.zeroize();
    }

    derive_master(&mut parts)
}
