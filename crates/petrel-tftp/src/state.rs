//! The server control surface.
//!
//! `ServerState` is the only object shared between the engine and its
//! observers (a UI, a signal handler, a test harness). Observers read the
//! status text and the serving flag, may toggle `serving`, and may call
//! [`ServerState::shutdown`]. The engine writes the status text and the
//! connection snapshot. Nothing else crosses the boundary, so plain atomics
//! and a pair of mutex-guarded buffers are enough.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::ServerConfig;

/// Status text keeps at most this many lines.
pub const MAX_TEXT_LINES: usize = 12;
/// Each status line is clipped to this many characters.
pub const MAX_LINE_CHARS: usize = 100;

/// Which way file bytes move for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// RRQ: server reads a file and sends it.
    Sending,
    /// WRQ: server receives a file and writes it.
    Receiving,
}

/// Observer-facing snapshot of one live session.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub filename: String,
    pub direction: Direction,
    /// Total blocks transferred so far (monotone, never wraps).
    pub blocks: u64,
}

pub struct ServerState {
    config: ServerConfig,
    serving: AtomicBool,
    engine_available: AtomicBool,
    text: Mutex<Vec<String>>,
    connections: Mutex<Vec<ConnectionInfo>>,
}

impl ServerState {
    pub fn new(config: ServerConfig, serving: bool) -> Self {
        let mut banner = vec![
            "Petrel TFTP server".to_string(),
            format!("Version : {}", env!("CARGO_PKG_VERSION")),
            String::new(),
        ];
        banner.push(if serving {
            "The tftp service is starting".to_string()
        } else {
            "The tftp service is stopped".to_string()
        });
        Self {
            config,
            serving: AtomicBool::new(serving),
            engine_available: AtomicBool::new(true),
            text: Mutex::new(banner),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    /// Turn listening on or off. The engine reacts on its next tick.
    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }

    pub fn engine_available(&self) -> bool {
        self.engine_available.load(Ordering::SeqCst)
    }

    /// Append a status line, clipped to 100 printable characters, and emit
    /// it to the log sink. With `clear` the line replaces the whole buffer.
    pub fn add_text(&self, line: &str, clear: bool) {
        let mut clipped: String = line.chars().take(MAX_LINE_CHARS).collect();
        clipped.retain(|c| c.is_ascii_graphic() || c == ' ');

        tracing::info!("{clipped}");

        let mut text = self.text.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if clear {
            text.clear();
            text.push(clipped);
            return;
        }
        while text.len() >= MAX_TEXT_LINES {
            text.remove(0);
        }
        text.push(clipped);
    }

    /// The current status text, newest line last.
    pub fn text(&self) -> String {
        self.text.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).join("\n")
    }

    /// Snapshot of live sessions, as last published by the engine.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Engine-side: replace the observer snapshot after a tick.
    pub fn publish_connections(&self, connections: Vec<ConnectionInfo>) {
        *self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = connections;
    }

    /// Stop serving and ask the engine loop to exit. The engine terminates
    /// every session (closing file handles) and clears its table on the way
    /// out; the binary detaches the log sink when it drops the log guard.
    pub fn shutdown(&self) {
        self.serving.store(false, Ordering::SeqCst);
        self.engine_available.store(false, Ordering::SeqCst);
        self.add_text("petrel-tftpd stopped", false);
    }
}
