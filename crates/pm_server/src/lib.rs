//! pm_server — Phantom Messenger zero-knowledge routing core
//!
//! The server never sees plaintext: it routes and buffers opaque ciphertext
//! blobs keyed only by recipient public identity.
//!
//! # Modules
//! - `config`     — environment-driven configuration
//! - `sink`       — outbound frame delivery (channel-backed, test-fakeable)
//! - `connection` — client state machine, challenge auth, multi-device
//!                  fan-out, key-exchange rendezvous
//! - `rate_limit` — per-hashed-IP fixed-window counters
//! - `store`      — in-memory message buffering and sync queries
//! - `media`      — optional in-memory media backend
//! - `dispatch`   — frame routing and authorization
//! - `server`     — WebSocket accept loop and housekeeping timers

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod media;
pub mod rate_limit;
pub mod server;
pub mod sink;
pub mod store;

pub use config::ServerConfig;
pub use server::Server;
