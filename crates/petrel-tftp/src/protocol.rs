//! TFTP wire format: opcodes, error codes, packet builders, and the parser
//! for the opening RRQ/WRQ datagram.
//!
//! RFC 1350 packet layouts, with the RFC 2348 `blksize` option as the only
//! negotiated extension. Every malformed request is answered by silence; a
//! TFTP listener that replies to garbage invites amplification.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MAX_REQUEST_SIZE, MIN_BLOCK_SIZE};

// TFTP Opcodes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request
    Wrq = 2,   // Write request
    Data = 3,  // Data
    Ack = 4,   // Acknowledgment
    Error = 5, // Error
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Oack),
            _ => None,
        }
    }
}

// TFTP Error Codes (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

// Transfer Mode (RFC 1350)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// NETASCII mode - 8-bit ASCII with CR+LF line ending conversion
    Netascii,
    /// OCTET mode - binary transfer without conversion
    Octet,
}

impl TransferMode {
    /// Parse the mode field of a request, case-insensitively. Anything other
    /// than `netascii` or `octet` (including the obsolete `mail`) is not
    /// served.
    fn from_wire(raw: &[u8]) -> Option<Self> {
        match raw.to_ascii_lowercase().as_slice() {
            b"netascii" => Some(TransferMode::Netascii),
            b"octet" => Some(TransferMode::Octet),
            _ => None,
        }
    }
}

/// Build a DATA packet: `[0x00, 0x03, block_hi, block_lo, payload...]`.
pub fn data_packet(block: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(4 + payload.len());
    pkt.put_u16(Opcode::Data as u16);
    pkt.put_slice(&block);
    pkt.put_slice(payload);
    pkt.to_vec()
}

/// Build an ACK packet: `[0x00, 0x04, block_hi, block_lo]`.
pub fn ack_packet(block: [u8; 2]) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(4);
    pkt.put_u16(Opcode::Ack as u16);
    pkt.put_slice(&block);
    pkt.to_vec()
}

/// Build an ERROR packet: `[0x00, 0x05, 0x00, code, message..., 0x00]`.
pub fn error_packet(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut pkt = BytesMut::with_capacity(5 + message.len());
    pkt.put_u16(Opcode::Error as u16);
    pkt.put_u16(code as u16);
    pkt.put_slice(message.as_bytes());
    pkt.put_u8(0);
    pkt.to_vec()
}

/// A validated opening request, ready for session construction.
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    /// Sanitized filename, relative to the TFTP root.
    pub filename: String,
    pub mode: TransferMode,
    /// Negotiated payload size; 512 unless a `blksize` option was accepted.
    pub block_size: usize,
    /// Accepted options and the values echoed back for them.
    pub options: HashMap<String, String>,
    /// Pre-built OACK payload when at least one option was accepted.
    pub oack: Option<Vec<u8>>,
}

/// Outcome of validating an opening datagram. `Drop` carries no reason:
/// rejected requests are never answered.
#[derive(Debug)]
pub enum ParseOutcome {
    Accepted(Request),
    Drop,
}

/// Validate the first datagram from an unknown peer.
///
/// `write_in_progress` reports whether some live session is already writing
/// the given filename; a second request for a file mid-write is refused to
/// avoid interleaved writes.
pub fn parse_request<F>(data: &[u8], write_in_progress: F) -> ParseOutcome
where
    F: Fn(&str) -> bool,
{
    if data.len() > MAX_REQUEST_SIZE || data.len() < 2 {
        return ParseOutcome::Drop;
    }
    if data[0] != 0 {
        return ParseOutcome::Drop;
    }
    let opcode = match data[1] {
        1 => Opcode::Rrq,
        2 => Opcode::Wrq,
        _ => return ParseOutcome::Drop,
    };

    let mut parts: Vec<&[u8]> = data[2..].split(|&b| b == 0).collect();
    if parts.len() < 2 {
        return ParseOutcome::Drop;
    }

    let Some(mode) = TransferMode::from_wire(parts[1]) else {
        return ParseOutcome::Drop;
    };

    let Some(filename) = sanitize_filename(parts[0]) else {
        return ParseOutcome::Drop;
    };

    if write_in_progress(&filename) {
        return ParseOutcome::Drop;
    }

    // A correctly formed request ends in NUL, leaving one empty trailing
    // part after the split.
    if parts.last().is_some_and(|p| p.is_empty()) {
        parts.pop();
    }
    let (block_size, options, oack) = negotiate_options(&parts);

    ParseOutcome::Accepted(Request {
        opcode,
        filename,
        mode,
        block_size,
        options,
        oack,
    })
}

/// Apply the filename rules: 1-256 characters, no leading dot (a single
/// leading slash or backslash is stripped first), and nothing outside
/// ASCII alphanumerics plus `.`, `-`, `_`. Returns the sanitized name.
fn sanitize_filename(raw: &[u8]) -> Option<String> {
    if raw.is_empty() || raw.len() > 256 {
        return None;
    }
    let mut name = raw;
    if name[0] == b'.' {
        return None;
    }
    if name[0] == b'\\' || name[0] == b'/' {
        if name.len() == 1 {
            return None;
        }
        name = &name[1..];
        if name[0] == b'.' {
            return None;
        }
    }
    let acceptable = name
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));
    if !acceptable {
        return None;
    }
    // All-ASCII by construction.
    String::from_utf8(name.to_vec()).ok()
}

/// Negotiate RFC 2347 options from the NUL-separated parts after
/// filename and mode. Only `blksize` is recognized; its value is clamped to
/// 4096 and refused below 8. Any anomaly in the option list voids the whole
/// negotiation and the transfer proceeds with defaults.
fn negotiate_options(parts: &[&[u8]]) -> (usize, HashMap<String, String>, Option<Vec<u8>>) {
    let defaults = (DEFAULT_BLOCK_SIZE, HashMap::new(), None);

    if parts.len() < 4 || parts.len() % 2 != 0 {
        return defaults;
    }

    let mut requested = HashMap::new();
    for pair in parts[2..].chunks(2) {
        let (Ok(key), Ok(value)) = (
            std::str::from_utf8(pair[0]),
            std::str::from_utf8(pair[1]),
        ) else {
            return defaults;
        };
        requested.insert(key.to_ascii_lowercase(), value.to_ascii_lowercase());
    }

    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut accepted = HashMap::new();
    let mut oack = BytesMut::new();
    oack.put_u16(Opcode::Oack as u16);

    if let Some(value) = requested.get("blksize") {
        let Ok(requested_size) = value.parse::<i64>() else {
            return defaults;
        };
        let clamped = requested_size.min(MAX_BLOCK_SIZE as i64);
        if clamped >= MIN_BLOCK_SIZE as i64 {
            block_size = clamped as usize;
            let echoed = clamped.to_string();
            oack.put_slice(b"blksize\x00");
            oack.put_slice(echoed.as_bytes());
            oack.put_u8(0);
            accepted.insert("blksize".to_string(), echoed);
        }
    }

    if accepted.is_empty() {
        return defaults;
    }
    (block_size, accepted, Some(oack.to_vec()))
}
