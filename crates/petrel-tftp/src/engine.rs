//! The request dispatcher and the engine loop.
//!
//! One current-thread executor owns the listening socket and every session.
//! All transfers are multiplexed over the listening port and keyed by peer
//! endpoint. Strict RFC 1350 would answer each request from a fresh
//! ephemeral port (section 4, transfer identifiers); this server keeps the
//! single-socket arrangement for compatibility with clients of its
//! predecessor.
//!
//! The loop alternates between receiving datagrams, driving one session's
//! send at a time through a round-robin cursor, and a periodic tick that
//! advances session timers and reaps expired sessions.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error};

use crate::MAX_DATAGRAM_SIZE;
use crate::acl::SubnetFilter;
use crate::config::ServerConfig;
use crate::error::{Result, TftpError};
use crate::protocol::{Opcode, ParseOutcome, parse_request};
use crate::session::Session;
use crate::state::ServerState;

/// Timer granularity. Must stay well under the sub-second retransmit TTLs.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Poll cadence while parked waiting for `serving` to come back on.
const IDLE_SLEEP: Duration = Duration::from_millis(250);

pub struct Dispatcher {
    socket: UdpSocket,
    acl: Option<SubnetFilter>,
    sessions: HashMap<SocketAddr, Session>,
    /// Snapshot of session keys still owed a turn in the current
    /// round-robin cycle.
    send_queue: VecDeque<SocketAddr>,
    /// The session currently being drained, if any.
    current: Option<SocketAddr>,
}

impl Dispatcher {
    /// Bind the listening socket for a serving period. Every failure comes
    /// back as `NoService` carrying the operator-facing diagnostic.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let acl = config.subnet_filter()?;
        let addr = config.socket_addr()?;
        let socket = Self::bind_socket(config, addr)?;
        Ok(Self {
            socket,
            acl,
            sessions: HashMap::new(),
            send_queue: VecDeque::new(),
            current: None,
        })
    }

    fn bind_socket(config: &ServerConfig, addr: SocketAddr) -> Result<UdpSocket> {
        let no_service =
            |e: &io::Error| TftpError::NoService(bind_failure_text(config, e));
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| no_service(&e))?;
        let _ = socket.set_reuse_address(true);
        socket.bind(&addr.into()).map_err(|e| no_service(&e))?;
        socket.set_nonblocking(true).map_err(|e| no_service(&e))?;
        UdpSocket::from_std(socket.into()).map_err(|e| no_service(&e))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Route one inbound datagram: to its session if the peer is known,
    /// otherwise through the request parser. Every rejection is silent.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        peer: SocketAddr,
        state: &ServerState,
        now: Instant,
    ) {
        if data.len() > MAX_DATAGRAM_SIZE {
            return;
        }
        if let Some(session) = self.sessions.get_mut(&peer) {
            session.incoming(data, state, now);
            return;
        }
        if let Some(filter) = &self.acl {
            let allowed = match peer.ip() {
                IpAddr::V4(v4) => filter.contains(v4),
                IpAddr::V6(_) => false,
            };
            if !allowed {
                debug!(%peer, "request from outside the allowed subnet dropped");
                return;
            }
        }
        let outcome = parse_request(data, |name| {
            self.sessions
                .values()
                .any(|s| s.is_write() && s.filename() == name)
        });
        let request = match outcome {
            ParseOutcome::Accepted(request) => request,
            ParseOutcome::Drop => {
                debug!(%peer, "malformed request dropped");
                return;
            }
        };
        let session = match request.opcode {
            Opcode::Rrq => Session::new_read(&request, peer, state, now),
            Opcode::Wrq => Session::new_write(&request, peer, state, now),
            _ => return,
        };
        self.sessions.entry(peer).or_insert(session);
    }

    /// Round-robin send scheduling: keep draining the current session, then
    /// move to the next one with data queued. The key snapshot is rebuilt
    /// only once it runs dry, so sessions admitted mid-cycle wait for the
    /// next cycle.
    pub fn drive_sends(&mut self, now: Instant) {
        let mut rebuilt = false;
        loop {
            let peer = match self.current {
                Some(peer) => peer,
                None => {
                    if self.send_queue.is_empty() {
                        if rebuilt {
                            return;
                        }
                        self.send_queue.extend(self.sessions.keys().copied());
                        rebuilt = true;
                    }
                    let Some(peer) = self.send_queue.pop_front() else {
                        return;
                    };
                    self.current = Some(peer);
                    peer
                }
            };
            let Some(session) = self.sessions.get_mut(&peer) else {
                self.current = None;
                continue;
            };
            if session.expired() || !session.has_pending() {
                self.current = None;
                continue;
            }
            let socket = &self.socket;
            let mut socket_full = false;
            session.send_one(now, |buf, addr| match socket.try_send_to(buf, addr) {
                Ok(n) => Ok(n),
                Err(e) => {
                    if e.kind() == io::ErrorKind::WouldBlock {
                        socket_full = true;
                    }
                    Err(e)
                }
            });
            if socket_full {
                // Nothing more fits right now; the pending bytes stay
                // queued and this session keeps its turn.
                return;
            }
            if session.expired() || !session.has_pending() {
                self.current = None;
                continue;
            }
            // Partial send: keep the turn, retry on the next pass.
            return;
        }
    }

    /// One scheduler tick: advance every session's timers, reap expired
    /// sessions, refresh the observer snapshot.
    pub fn tick(&mut self, state: &ServerState, now: Instant) {
        for session in self.sessions.values_mut() {
            session.poll(state, now);
        }
        self.sessions.retain(|_, session| !session.expired());
        state.publish_connections(self.sessions.values().map(Session::info).collect());
    }

    /// Terminate every session and clear the table (serving stopped or the
    /// engine is shutting down).
    pub fn shutdown_sessions(&mut self, state: &ServerState) {
        for session in self.sessions.values_mut() {
            session.terminate();
        }
        self.sessions.clear();
        self.send_queue.clear();
        self.current = None;
        state.publish_connections(Vec::new());
    }

    /// Serve until `serving` is switched off or the engine becomes
    /// unavailable. Each iteration waits at most one tick for a datagram,
    /// then advances every session's timers and drives sends.
    async fn serve(&mut self, state: &ServerState) {
        // One byte of headroom so an oversized datagram is detected rather
        // than silently truncated at the limit.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        while state.engine_available() && state.serving() {
            let received =
                tokio::time::timeout(TICK_INTERVAL, self.socket.recv_from(&mut buf)).await;
            match received {
                Ok(Ok((len, peer))) => {
                    self.handle_datagram(&buf[..len], peer, state, Instant::now());
                }
                Ok(Err(e)) => {
                    // Transient receive errors (e.g. ICMP port unreachable
                    // surfaced on some platforms) do not stop the server.
                    debug!("receive error: {e}");
                }
                // No traffic within the tick.
                Err(_) => {}
            }
            let now = Instant::now();
            self.tick(state, now);
            self.drive_sends(now);
        }
        self.shutdown_sessions(state);
    }
}

/// The operator-facing diagnostic for a failed bind.
fn bind_failure_text(config: &ServerConfig, err: &io::Error) -> String {
    let mut text = if config.listen_addr.is_empty() {
        format!("Failed to bind to port {}.", config.listen_port)
    } else {
        format!(
            "Failed to bind to {}:{}\n\
             Check this IP address exists on this server.\n\
             (An empty listen_addr binds every interface.)",
            config.listen_addr, config.listen_port
        )
    };
    text.push_str(
        "\nCheck you do not have another service listening on this port\n\
         (you may have a tftp daemon already running), and that your user\n\
         may open a socket on this port.",
    );
    if config.listen_port < 1024 {
        text.push_str("\n(Ports below 1024 may need root or administrator privileges.)");
    }
    text.push_str(&format!("\nError detail: {err}"));
    text
}

/// Run the engine until `engine_available` is cleared.
///
/// While `serving` is on, the listening socket is bound and transfers are
/// dispatched; switching `serving` off closes the socket, terminates all
/// sessions, and parks the loop in the idle state. A bind failure surfaces
/// its diagnostic through the status text and, with `nogui`, on standard
/// error before the loop gives up.
pub fn engine_loop(state: Arc<ServerState>, nogui: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(state, nogui))
}

async fn run(state: Arc<ServerState>, nogui: bool) -> Result<()> {
    while state.engine_available() {
        if state.serving() {
            match Dispatcher::bind(state.config()) {
                Ok(mut dispatcher) => {
                    let listening = match dispatcher.local_addr() {
                        Ok(addr) if !state.config().listen_addr.is_empty() => {
                            format!("Listening on {addr}")
                        }
                        Ok(addr) => format!("Listening on port {}", addr.port()),
                        Err(_) => format!("Listening on port {}", state.config().listen_port),
                    };
                    state.add_text(&listening, true);
                    dispatcher.serve(&state).await;
                    state.add_text("Server stopped", false);
                }
                Err(TftpError::NoService(text)) => {
                    error!("bind failure: {text}");
                    for (index, line) in text.lines().enumerate() {
                        state.add_text(line, index == 0);
                    }
                    state.set_serving(false);
                    if nogui {
                        eprintln!("{text}");
                        return Err(TftpError::NoService(text));
                    }
                }
                Err(other) => return Err(other),
            }
        }
        while state.engine_available() && !state.serving() {
            tokio::time::sleep(IDLE_SLEEP).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::net::UdpSocket as StdUdpSocket;
    use tempfile::TempDir;

    fn test_state(root: &TempDir) -> ServerState {
        let config = ServerConfig {
            root_dir: root.path().to_path_buf(),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            ..ServerConfig::default()
        };
        ServerState::new(config, true)
    }

    fn rrq(filename: &str) -> Vec<u8> {
        let mut pkt = vec![0, 1];
        pkt.extend_from_slice(filename.as_bytes());
        pkt.push(0);
        pkt.extend_from_slice(b"octet");
        pkt.push(0);
        pkt
    }

    #[tokio::test]
    async fn valid_request_creates_a_session_and_sends_data() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("file.bin"), vec![1u8; 100]).unwrap();
        let state = test_state(&root);
        let mut dispatcher = Dispatcher::bind(state.config()).unwrap();
        let server_addr = dispatcher.local_addr().unwrap();
        // Let the IO driver register the freshly bound socket before the
        // first non-blocking send is attempted.
        tokio::task::yield_now().await;

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let peer = client.local_addr().unwrap();

        let now = Instant::now();
        dispatcher.handle_datagram(&rrq("file.bin"), peer, &state, now);
        assert_eq!(dispatcher.sessions.len(), 1);

        dispatcher.drive_sends(now);
        let mut buf = [0u8; 600];
        let (len, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(&buf[..4], &[0, 3, 0, 1]);
        assert_eq!(len, 104);
    }

    #[tokio::test]
    async fn traversal_request_is_dropped_silently() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let mut dispatcher = Dispatcher::bind(state.config()).unwrap();

        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        dispatcher.handle_datagram(&rrq("/../etc/passwd"), peer, &state, Instant::now());
        assert!(dispatcher.sessions.is_empty());
    }

    #[tokio::test]
    async fn disallowed_subnet_is_dropped_before_parsing() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("file.bin"), b"data").unwrap();
        let config = ServerConfig {
            root_dir: root.path().to_path_buf(),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 0,
            any_client: false,
            client_ip: "192.168.0.0".to_string(),
            client_mask: "24".to_string(),
            ..ServerConfig::default()
        };
        let state = ServerState::new(config, true);
        let mut dispatcher = Dispatcher::bind(state.config()).unwrap();

        let outsider: SocketAddr = "10.0.0.5:40002".parse().unwrap();
        dispatcher.handle_datagram(&rrq("file.bin"), outsider, &state, Instant::now());
        assert!(dispatcher.sessions.is_empty());
    }

    #[tokio::test]
    async fn expired_sessions_are_reaped_on_tick() {
        let root = TempDir::new().unwrap();
        let state = test_state(&root);
        let mut dispatcher = Dispatcher::bind(state.config()).unwrap();
        // Let the IO driver register the freshly bound socket before the
        // first non-blocking send is attempted.
        tokio::task::yield_now().await;

        let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        // Missing file: the session queues ERROR and expires once sent.
        dispatcher.handle_datagram(&rrq("absent"), peer, &state, Instant::now());
        assert_eq!(dispatcher.sessions.len(), 1);
        dispatcher.drive_sends(Instant::now());
        dispatcher.tick(&state, Instant::now());
        assert!(dispatcher.sessions.is_empty());
        assert!(state.get_connections().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_a_no_service_diagnostic() {
        let root = TempDir::new().unwrap();
        let taken = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig {
            root_dir: root.path().to_path_buf(),
            listen_addr: "127.0.0.1".to_string(),
            listen_port: port,
            ..ServerConfig::default()
        };
        match Dispatcher::bind(&config) {
            Err(TftpError::NoService(text)) => {
                assert!(text.contains(&format!("{port}")));
            }
            other => panic!("expected NoService, got {:?}", other.map(|_| ())),
        }
    }
}
