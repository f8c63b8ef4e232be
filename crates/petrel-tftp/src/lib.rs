pub mod acl;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod netascii;
pub mod protocol;
pub mod rtt;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use state::ServerState;

// RFC 1350 - The TFTP Protocol (Revision 2)
pub const DEFAULT_BLOCK_SIZE: usize = 512; // RFC 1350 standard for compatibility
pub const MIN_BLOCK_SIZE: usize = 8; // RFC 2348 lower bound
pub const MAX_BLOCK_SIZE: usize = 4096; // this server caps negotiated blocks at 4096

/// An opening RRQ/WRQ must fit in a single default-size datagram.
pub const MAX_REQUEST_SIZE: usize = 512;

/// Largest datagram accepted on the listening socket: the 4096-byte block
/// cap plus the 4-byte DATA header. Anything longer is dropped.
pub const MAX_DATAGRAM_SIZE: usize = 4100;

/// Consecutive unanswered retransmissions tolerated before the session is
/// torn down with an ERROR packet.
pub const MAX_RETRANSMITS: u32 = 3;

/// A session with no packet sent or received for this long is terminated.
pub const SESSION_STALL_SECS: u64 = 30;
