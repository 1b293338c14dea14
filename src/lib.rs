//! Live-broadcast comment overlay client.
//!
//! Receives subtitle/chat events over a WebSocket, batches them per speaker,
//! generates short reactive comments through a persistent interactive AI CLI
//! session driven over a PTY, and publishes the comments back to the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod buffer;
pub mod client;
pub mod config;
pub mod detector;
pub mod errors;
pub mod extract;
pub mod logging;
pub mod prompt;
pub mod sanitize;
pub mod session;
pub mod wire;
pub mod worker;

pub use config::AppConfig;
pub use logging::init_logging;

/// Cooperative shutdown signal shared across threads.
///
/// Two stages: `stop` asks loops to wind down and drain; `abort` additionally
/// cancels any in-flight session exchange (set by a repeated signal or the
/// forced-exit watchdog). An aborted exchange surfaces as
/// [`errors::SessionError::Cancelled`] and is never swallowed.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative shutdown. Returns true if this call set the flag.
    pub fn request_stop(&self) -> bool {
        !self.stop.swap(true, Ordering::SeqCst)
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Cancel in-flight session exchanges as well.
    pub fn request_abort(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}
