//! pm_client — Phantom Messenger client transport
//!
//! Wraps a WebSocket connection with request/response correlation (10 s
//! timeouts), typed operations for the protocol surface, and the plain
//! owned conversation state the UI layer renders from.
//!
//! # Modules
//! - `transport`     — connection, correlation table, typed requests
//! - `conversations` — peer → ordered message lists
//! - `error`         — unified error type

pub mod conversations;
pub mod error;
pub mod transport;

pub use conversations::ConversationLog;
pub use error::ClientError;
pub use transport::Transport;
