//! Per-peer transfer sessions.
//!
//! One `Session` holds everything for a single in-progress transfer: the
//! peer endpoint that keys it, the open file, the lock-step block counter,
//! the packet waiting to go out, the copy kept for retransmission, and the
//! RTT estimator that decides when to retransmit. The dispatcher owns all
//! sessions and drives them through `incoming`, `send_one`, and `poll`;
//! nothing here touches the socket directly.

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::netascii::{NetasciiReader, NetasciiWriter};
use crate::protocol::{ErrorCode, Opcode, Request, TransferMode, ack_packet, data_packet, error_packet};
use crate::rtt::RttEstimator;
use crate::state::{ConnectionInfo, Direction, ServerState};
use crate::{MAX_RETRANSMITS, SESSION_STALL_SECS};

/// The lock-step block counter: the 16-bit wire value wraps at 65535, the
/// total never does and feeds byte-count reporting.
#[derive(Debug, Clone, Copy)]
struct BlockCounter {
    value: u16,
    wire: [u8; 2],
    total: u64,
}

impl BlockCounter {
    fn new() -> Self {
        Self {
            value: 0,
            wire: [0, 0],
            total: 0,
        }
    }

    fn increment(&mut self) {
        self.total += 1;
        self.value = self.value.wrapping_add(1);
        self.wire = self.value.to_be_bytes();
    }
}

enum BlockReader {
    Octet(File),
    Netascii(NetasciiReader<File>),
}

impl BlockReader {
    fn open(path: &Path, mode: TransferMode) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(match mode {
            TransferMode::Octet => BlockReader::Octet(file),
            TransferMode::Netascii => BlockReader::Netascii(NetasciiReader::new(file)),
        })
    }

    /// Read the next block of up to `len` payload bytes. Short only at end
    /// of file.
    fn read_block(&mut self, len: usize) -> io::Result<Vec<u8>> {
        match self {
            BlockReader::Octet(file) => {
                let mut buf = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    let n = file.read(&mut buf[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            BlockReader::Netascii(reader) => {
                let mut buf = Vec::with_capacity(len);
                reader.read_block(len, &mut buf)?;
                Ok(buf)
            }
        }
    }
}

enum BlockWriter {
    Octet(File),
    Netascii(NetasciiWriter<File>),
}

impl BlockWriter {
    fn create(path: &Path, mode: TransferMode) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(match mode {
            TransferMode::Octet => BlockWriter::Octet(file),
            TransferMode::Netascii => BlockWriter::Netascii(NetasciiWriter::new(file)),
        })
    }

    fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            BlockWriter::Octet(file) => file.write_all(payload),
            BlockWriter::Netascii(writer) => writer.write_payload(payload),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            BlockWriter::Octet(file) => file.flush(),
            BlockWriter::Netascii(writer) => writer.finish(),
        }
    }
}

enum Transfer {
    /// RRQ: the server reads the file and sends DATA.
    Read {
        reader: Option<BlockReader>,
        /// Set once the short final block has been produced; the next
        /// matching ACK ends the session.
        last_receive: bool,
    },
    /// WRQ: the server receives DATA and writes the file.
    Write { writer: Option<BlockWriter> },
}

pub struct Session {
    peer: SocketAddr,
    filename: String,
    block_size: usize,
    blocks: BlockCounter,
    /// Bytes still to hand to the socket for the current outbound packet.
    pending_tx: Vec<u8>,
    /// The last full outbound packet, kept for retransmission.
    retx_tx: Vec<u8>,
    last_activity: Instant,
    rtt: RttEstimator,
    /// Consecutive retransmissions without progress.
    timeouts: u32,
    expired: bool,
    /// The next fully sent packet (or the ACK answering it) concludes the
    /// transfer.
    last_packet: bool,
    transfer: Transfer,
}

impl Session {
    fn base(request: &Request, peer: SocketAddr, now: Instant, transfer: Transfer) -> Self {
        let pending_tx = request.oack.clone().unwrap_or_default();
        Self {
            peer,
            filename: request.filename.clone(),
            block_size: request.block_size,
            blocks: BlockCounter::new(),
            retx_tx: pending_tx.clone(),
            pending_tx,
            last_activity: now,
            rtt: RttEstimator::new(),
            timeouts: 0,
            expired: false,
            last_packet: false,
            transfer,
        }
    }

    /// Build a session for a validated RRQ. Construction never fails: a
    /// missing or unopenable file leaves an ERROR packet queued and the
    /// session flagged to terminate after sending it.
    pub fn new_read(request: &Request, peer: SocketAddr, state: &ServerState, now: Instant) -> Self {
        let mut session = Self::base(
            request,
            peer,
            now,
            Transfer::Read {
                reader: None,
                last_receive: false,
            },
        );
        let path = state.config().root_dir.join(&request.filename);
        if !path.exists() || path.is_dir() {
            state.add_text(
                &format!("{} requested {}: file not found", peer.ip(), session.filename),
                false,
            );
            session.final_error(ErrorCode::FileNotFound, "File not found");
            return session;
        }
        let reader = match BlockReader::open(&path, request.mode) {
            Ok(reader) => reader,
            Err(_) => {
                state.add_text(
                    &format!("{} requested {}: unable to open file", peer.ip(), session.filename),
                    false,
                );
                session.final_error(ErrorCode::AccessViolation, "Unable to open file");
                return session;
            }
        };
        state.add_text(
            &format!("Sending {} to {}", session.filename, peer.ip()),
            false,
        );
        if let Transfer::Read { reader: slot, .. } = &mut session.transfer {
            *slot = Some(reader);
        }
        // With an OACK queued the first DATA waits for the client's ACK of
        // block 0; otherwise it goes out immediately.
        if session.pending_tx.is_empty() {
            session.produce_data(state);
        }
        session
    }

    /// Build a session for a validated WRQ. As with reads, failures queue an
    /// ERROR packet instead of failing construction.
    pub fn new_write(request: &Request, peer: SocketAddr, state: &ServerState, now: Instant) -> Self {
        let mut session = Self::base(request, peer, now, Transfer::Write { writer: None });
        let path = state.config().root_dir.join(&request.filename);
        if path.exists() {
            state.add_text(
                &format!(
                    "{} trying to send {}: file already exists",
                    peer.ip(),
                    session.filename
                ),
                false,
            );
            session.final_error(ErrorCode::FileAlreadyExists, "File already exists");
            return session;
        }
        let writer = match BlockWriter::create(&path, request.mode) {
            Ok(writer) => writer,
            Err(_) => {
                state.add_text(
                    &format!(
                        "{} trying to send {}: unable to open file",
                        peer.ip(),
                        session.filename
                    ),
                    false,
                );
                session.final_error(ErrorCode::AccessViolation, "Unable to open file");
                return session;
            }
        };
        state.add_text(
            &format!("Receiving {} from {}", session.filename, peer.ip()),
            false,
        );
        if let Transfer::Write { writer: slot } = &mut session.transfer {
            *slot = Some(writer);
        }
        if session.pending_tx.is_empty() {
            // No options accepted: acknowledge the request with block 0.
            session.retx_tx = ack_packet(session.blocks.wire);
            session.pending_tx = session.retx_tx.clone();
        }
        session
    }

    /// Queue an ERROR packet as the session's final frame.
    fn final_error(&mut self, code: ErrorCode, message: &str) {
        self.retx_tx = error_packet(code, message);
        self.pending_tx = self.retx_tx.clone();
        self.last_packet = true;
    }

    /// Read the next block from the file and queue it as DATA. A block
    /// shorter than `block_size` is the final one: the file is released and
    /// the next matching ACK ends the session.
    fn produce_data(&mut self, state: &ServerState) {
        let read_result = match &mut self.transfer {
            Transfer::Read {
                reader: Some(reader),
                ..
            } => reader.read_block(self.block_size),
            _ => return,
        };
        let payload = match read_result {
            Ok(payload) => payload,
            Err(e) => {
                state.add_text(
                    &format!("error reading {}: {}", self.filename, e),
                    false,
                );
                self.final_error(ErrorCode::AccessViolation, "Unable to read file");
                return;
            }
        };
        if payload.len() < self.block_size {
            let bytes_sent = self.block_size as u64 * self.blocks.total + payload.len() as u64;
            state.add_text(
                &format!(
                    "{} bytes of {} sent to {}",
                    bytes_sent,
                    self.filename,
                    self.peer.ip()
                ),
                false,
            );
            if let Transfer::Read {
                reader,
                last_receive,
            } = &mut self.transfer
            {
                *reader = None;
                *last_receive = true;
            }
        }
        self.blocks.increment();
        self.retx_tx = data_packet(self.blocks.wire, &payload);
        self.pending_tx = self.retx_tx.clone();
    }

    /// Handle an inbound datagram from this session's peer. Ignored while a
    /// send is in progress or no reply is awaited; a peer ERROR terminates
    /// the session; anything unexpected for the transfer type is dropped.
    pub fn incoming(&mut self, data: &[u8], state: &ServerState, now: Instant) {
        if self.expired {
            return;
        }
        if !self.pending_tx.is_empty() || !self.rtt.is_running() {
            return;
        }
        if data.len() < 2 || data[0] != 0 {
            return;
        }
        if data[1] == Opcode::Error as u8 {
            self.log_peer_error(data, state);
            self.terminate();
            return;
        }
        if self.is_write() {
            self.handle_data(data, state, now);
        } else {
            self.handle_ack(data, state, now);
        }
    }

    fn log_peer_error(&self, data: &[u8], state: &ServerState) {
        if data.len() < 4 {
            return;
        }
        let code = data[3];
        let tail = &data[4..];
        if tail.len() > 1 && tail.len() < 255 {
            let message = String::from_utf8_lossy(&tail[..tail.len() - 1]);
            state.add_text(
                &format!(
                    "Error from {}:{} code {} : {}",
                    self.peer.ip(),
                    self.peer.port(),
                    code,
                    message
                ),
                false,
            );
        } else {
            state.add_text(
                &format!(
                    "Error from {}:{} code {}",
                    self.peer.ip(),
                    self.peer.port(),
                    code
                ),
                false,
            );
        }
    }

    /// RRQ: the peer acknowledges DATA. Only an ACK matching the current
    /// block counts; duplicates and strays are ignored.
    fn handle_ack(&mut self, data: &[u8], state: &ServerState, now: Instant) {
        if data[1] != Opcode::Ack as u8 {
            return;
        }
        if data.len() < 4 || data[2..4] != self.blocks.wire {
            return;
        }
        self.last_activity = now;
        self.timeouts = 0;
        self.rtt.stop_at(now);
        if matches!(
            self.transfer,
            Transfer::Read {
                last_receive: true,
                ..
            }
        ) {
            self.terminate();
            return;
        }
        self.produce_data(state);
    }

    /// WRQ: the peer sends the next DATA block. The block counter is
    /// advanced tentatively and rolled back on a mismatch so duplicates and
    /// out-of-order packets leave the session untouched.
    fn handle_data(&mut self, data: &[u8], state: &ServerState, now: Instant) {
        if data[1] != Opcode::Data as u8 {
            return;
        }
        let previous = self.blocks;
        self.blocks.increment();
        if data.len() < 4 || data[2..4] != self.blocks.wire {
            self.blocks = previous;
            return;
        }
        self.timeouts = 0;
        self.rtt.stop_at(now);
        self.last_activity = now;

        let payload = &data[4..];
        if payload.len() > self.block_size {
            state.add_text(
                &format!(
                    "Block size too long from {}:{}",
                    self.peer.ip(),
                    self.peer.port()
                ),
                false,
            );
            self.final_error(ErrorCode::IllegalOperation, "Block size too long");
            return;
        }

        if !payload.is_empty() {
            let mut write_error = None;
            if let Transfer::Write {
                writer: Some(writer),
            } = &mut self.transfer
            {
                if let Err(e) = writer.write_payload(payload) {
                    write_error = Some(e);
                }
            }
            if let Some(e) = write_error {
                state.add_text(&format!("error writing {}: {}", self.filename, e), false);
                self.final_error(ErrorCode::AccessViolation, "Unable to write file");
                return;
            }
        }

        self.retx_tx = ack_packet(self.blocks.wire);
        self.pending_tx = self.retx_tx.clone();

        if payload.len() < self.block_size {
            // Final block: the queued ACK is the last frame this session
            // sends.
            let mut finish_error = None;
            if let Transfer::Write { writer } = &mut self.transfer {
                if let Some(w) = writer.as_mut() {
                    if let Err(e) = w.finish() {
                        finish_error = Some(e);
                    }
                }
                *writer = None;
            }
            if let Some(e) = finish_error {
                state.add_text(&format!("error writing {}: {}", self.filename, e), false);
                self.final_error(ErrorCode::AccessViolation, "Unable to write file");
                return;
            }
            let bytes_received = self.block_size as u64 * previous.total + payload.len() as u64;
            state.add_text(
                &format!(
                    "{} bytes of {} received from {}",
                    bytes_received,
                    self.filename,
                    self.peer.ip()
                ),
                false,
            );
            self.last_packet = true;
        }
    }

    /// Hand the pending packet to the socket once. `send` reports how many
    /// bytes it accepted; a partial send leaves the rest queued. After a
    /// full drain the session either terminates (`last_packet`) or starts
    /// the RTT timer for the expected reply.
    pub fn send_one<F>(&mut self, now: Instant, send: F)
    where
        F: FnOnce(&[u8], SocketAddr) -> io::Result<usize>,
    {
        if self.expired || self.pending_tx.is_empty() {
            return;
        }
        self.last_activity = now;
        match send(&self.pending_tx, self.peer) {
            Ok(sent) => {
                let sent = sent.min(self.pending_tx.len());
                self.pending_tx.drain(..sent);
                if self.pending_tx.is_empty() {
                    if self.last_packet {
                        self.terminate();
                    } else {
                        self.rtt.start_at(now);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => self.terminate(),
        }
    }

    /// Advance the session's timers. Terminates a session stalled for over
    /// 30 seconds; otherwise, when the awaited reply has outlived its TTL,
    /// queues a retransmission, or after the fourth consecutive timeout an
    /// ERROR that ends the session.
    pub fn poll(&mut self, state: &ServerState, now: Instant) {
        if self.expired {
            return;
        }
        if now.saturating_duration_since(self.last_activity)
            > Duration::from_secs(SESSION_STALL_SECS)
        {
            state.add_text(
                &format!(
                    "Connection from {}:{} timed out",
                    self.peer.ip(),
                    self.peer.port()
                ),
                false,
            );
            self.terminate();
            return;
        }
        if !self.pending_tx.is_empty() || !self.rtt.is_running() {
            return;
        }
        match self.rtt.within_ttl_at(now) {
            Ok(true) | Err(_) => return,
            Ok(false) => {}
        }
        self.timeouts += 1;
        if self.timeouts <= MAX_RETRANSMITS {
            self.pending_tx = self.retx_tx.clone();
            return;
        }
        state.add_text(
            &format!(
                "Connection to {}:{} terminated due to timeout",
                self.peer.ip(),
                self.peer.port()
            ),
            false,
        );
        self.pending_tx = error_packet(ErrorCode::NotDefined, "Terminated due to timeout");
        self.last_packet = true;
    }

    /// Close the file handle, clear the outbound buffer, and mark the
    /// session for reaping. Idempotent.
    pub fn terminate(&mut self) {
        match &mut self.transfer {
            Transfer::Read { reader, .. } => {
                *reader = None;
            }
            Transfer::Write { writer } => {
                if let Some(w) = writer.as_mut() {
                    let _ = w.finish();
                }
                *writer = None;
            }
        }
        self.expired = true;
        self.pending_tx.clear();
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn expired(&self) -> bool {
        self.expired
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_tx.is_empty()
    }

    pub fn is_write(&self) -> bool {
        matches!(self.transfer, Transfer::Write { .. })
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer: self.peer,
            filename: self.filename.clone(),
            direction: if self.is_write() {
                Direction::Receiving
            } else {
                Direction::Sending
            },
            blocks: self.blocks.total,
        }
    }
}
