use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// A fixed-length field had the wrong size.
    #[error("Bad size for {field}: expected {expected}, got {got}")]
    BadSize {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Malformed input: {0}")]
    BadFormat(String),

    /// Deliberately opaque: tag mismatch, MAC mismatch and signature failure
    /// all surface as the same kind so callers cannot build an oracle.
    #[error("Authentication failed")]
    AuthFail,

    #[error("Operation on a destroyed identity")]
    IdentityDestroyed,

    #[error("Key exchange failed")]
    KeyExchangeFailed,

    #[error("Signed pre-key signature rejected")]
    BadSignedPreKey,

    #[error("Empty username or password")]
    BadCredentials,

    #[error("Unsupported format version {0}")]
    VersionUnsupported(u8),

    #[error("Invitation has expired")]
    Expired,

    #[error("Invitation has no uses remaining")]
    Exhausted,

    #[error("Invitation was revoked")]
    Revoked,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
