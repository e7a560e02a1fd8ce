use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("Unexpected response shape: {0}")]
    Protocol(String),

    #[error(transparent)]
    Crypto(#[from] pm_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
