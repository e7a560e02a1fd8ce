//! pm_proto — Phantom Messenger wire protocol
//!
//! All on-wire traffic is JSON frames over a WebSocket text channel; this
//! crate owns the framing, the closed message-type registry, the error-code
//! strings and every payload shape, so client and server agree by
//! construction.
//!
//! # Modules
//! - `frame` — frame envelope, `FrameType` registry, `ErrorCode`
//! - `api`   — typed payload shapes for each frame type
//! - `error` — parse errors

pub mod api;
pub mod error;
pub mod frame;

pub use error::ProtoError;
pub use frame::{ErrorCode, Frame, FrameType};
