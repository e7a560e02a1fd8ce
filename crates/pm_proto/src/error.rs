use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// Bad JSON, missing required keys, or an unknown frame type.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}
