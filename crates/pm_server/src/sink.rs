//! Outbound frame delivery
//!
//! The connection manager never touches a socket directly: it hands frames
//! to a `FrameSink`. In production that is an mpsc channel drained by the
//! per-connection writer task (so per-socket FIFO holds); tests substitute
//! a capturing sink. A sink that is not open drops the frame for that
//! device only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Normal closure, used when dropping an unresponsive socket.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent on server shutdown ("going away").
pub const CLOSE_GOING_AWAY: u16 = 1001;

pub trait FrameSink: Send + Sync {
    /// Queue one serialized frame. Returns false if the device cannot
    /// currently receive (closed socket or full writer).
    fn send_text(&self, text: String) -> bool;

    fn is_open(&self) -> bool;

    /// Begin closing with the given WebSocket close code.
    fn close(&self, code: u16);
}

/// What the writer task drains.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close(u16),
}

/// Production sink: unbounded channel into the socket writer task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx, open: AtomicBool::new(true) }
    }

    /// Called by the writer task when the socket goes away.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl FrameSink for ChannelSink {
    fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn close(&self, code: u16) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(code));
        }
    }
}

/// Test sink: records everything, can be flipped closed to simulate a dead
/// device mid-fan-out.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    pub close_code: Mutex<Option<u16>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl FrameSink for RecordingSink {
    fn send_text(&self, text: String) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(text);
        true
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, code: u16) {
        self.closed.store(true, Ordering::SeqCst);
        *self.close_code.lock() = Some(code);
    }
}
