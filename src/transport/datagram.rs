//! Datagram transport (WiFi-Direct style)
//!
//! A single UDP socket carries discovery probes, the connection handshake
//! and audio. One dispatcher thread owns the receive side and routes every
//! datagram:
//!
//! ```text
//!                 ┌──────────────┐
//!   UDP socket ──►│  dispatcher  │──► DISCOVERY      → discovery feed + probe reply
//!                 │   (thread)   │──► NAME:<name>    → peer name table
//!                 └──────────────┘──► CONNECT        → inbound feed
//!                                 ──► ACCEPT/REJECT/BUSY → waiting connect()
//!                                 ──► HANGUP         → link marked closed
//!                                 ──► anything else  → link's inbound queue
//! ```
//!
//! Datagrams from our own address and port are dropped, so broadcast
//! loopback never shows up as a peer. Each audio datagram is one
//! self-contained chunk; loss and reordering are tolerated.
//!
//! When two peers call each other at once, the side whose address (as
//! the other side sees it) sorts lower keeps its call; the other side
//! abandons its own attempt with [`ConnectError::Crossed`] and surfaces
//! the peer's request on its inbound feed.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{DiscoveryFeed, Feed, InboundFeed, InboundRequest, Link, ScanEvent, Transport};
use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::device::{Device, PeerStatus, TransportKind};
use crate::error::{ConnectError, TransportError};
use crate::protocol::{encode_name_announcement, parse_name_announcement, ControlMessage, Decision};

/// Network peer-to-peer transport over UDP
pub struct DatagramTransport {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    socket: UdpSocket,
    config: NetworkConfig,
    /// Our name announcement datagram
    announcement: Vec<u8>,
    bound_ip: IpAddr,
    local_port: u16,
    local_ips: Vec<IpAddr>,
    probe_targets: Vec<SocketAddr>,
    running: AtomicBool,
    enabled: AtomicBool,
    discovery: Mutex<Option<Sender<ScanEvent>>>,
    last_probe: Mutex<Option<Instant>>,
    /// When each peer last got a probe reply from us
    answered: Mutex<HashMap<SocketAddr, Instant>>,
    /// Display names peers announced
    names: Mutex<HashMap<SocketAddr, String>>,
    inbound: Mutex<Option<Sender<InboundRequest>>>,
    /// Outbound attempts waiting for an answer. Lock before `routes`.
    awaiting: Mutex<HashMap<SocketAddr, Sender<Result<(), ConnectError>>>>,
    routes: Mutex<HashMap<SocketAddr, Route>>,
}

/// Where the dispatcher delivers one link's audio
struct Route {
    tx: Sender<Bytes>,
    state: Arc<LinkState>,
}

#[derive(Default)]
struct LinkState {
    closed: AtomicBool,
    remote_closed: AtomicBool,
}

impl DatagramTransport {
    /// Bind the shared socket and start the dispatcher. `local_name` is
    /// announced to every peer we probe, answer or call.
    pub fn bind(config: NetworkConfig, local_name: &str) -> io::Result<Self> {
        let bind_addr = resolve(&config.bind_address, config.udp_port)?;

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&bind_addr.into())?;
        socket.set_read_timeout(Some(config.poll_interval()))?;
        let socket: UdpSocket = socket.into();

        let local = socket.local_addr()?;
        let mut local_ips = vec![local.ip()];
        if let Some(ip) = outbound_ip() {
            local_ips.push(ip);
        }

        let probe_targets = config
            .probe_targets
            .iter()
            .filter_map(|target| match resolve(target, config.udp_port) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("Ignoring probe target {}: {}", target, e);
                    None
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            socket,
            announcement: encode_name_announcement(local_name),
            bound_ip: local.ip(),
            local_port: local.port(),
            local_ips,
            probe_targets,
            config,
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            discovery: Mutex::new(None),
            last_probe: Mutex::new(None),
            answered: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
            awaiting: Mutex::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
        });

        let dispatch = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("datagram-dispatch".to_string())
            .spawn(move || dispatch.run())?;

        info!("Datagram transport bound on {}", local);
        Ok(Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.socket.local_addr()
    }

    /// Toggle the network radio. Disabling it mid-discovery ends the cycle
    /// with [`ScanEvent::RadioDisabled`].
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            if let Some(tx) = self.shared.discovery.lock().take() {
                let _ = tx.send(ScanEvent::RadioDisabled);
            }
        }
    }

    fn unavailable(reason: impl Into<String>) -> TransportError {
        TransportError::Unavailable {
            kind: TransportKind::NetworkP2P,
            reason: reason.into(),
        }
    }
}

impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::NetworkP2P
    }

    fn discover(&self) -> Result<DiscoveryFeed, TransportError> {
        if !self.shared.enabled.load(Ordering::SeqCst) {
            return Err(Self::unavailable("network is disabled"));
        }

        let (tx, feed) = Feed::channel();
        *self.shared.discovery.lock() = Some(tx);
        self.shared.answered.lock().clear();

        if let Err(e) = self.shared.probe() {
            self.shared.discovery.lock().take();
            return Err(Self::unavailable(format!("probe failed: {}", e)));
        }

        info!("Network discovery started");
        Ok(feed)
    }

    fn stop_discover(&self) {
        if self.shared.discovery.lock().take().is_some() {
            info!("Network discovery stopped");
        }
    }

    fn connect(&self, address: &str) -> Result<Box<dyn Link>, ConnectError> {
        let shared = &self.shared;
        let remote = resolve(address, shared.config.udp_port)
            .map_err(|_| ConnectError::InvalidAddress(address.to_string()))?;

        if !shared.enabled.load(Ordering::SeqCst) {
            return Err(ConnectError::DeviceUnreachable("network is disabled".into()));
        }

        let peer = shared.peer_device(remote);
        let (tx, rx) = bounded(1);
        let link = {
            let mut awaiting = shared.awaiting.lock();
            if shared.routes.lock().contains_key(&remote) {
                debug!("{} is already calling us", remote);
                return Err(ConnectError::Crossed);
            }
            awaiting.insert(remote, tx);
            // Route before asking so early audio after ACCEPT is not lost
            shared.open_link(peer, remote, false)
        };

        info!("Connecting to {}", remote);
        let asked = shared
            .announce(remote)
            .and_then(|()| shared.send_control(ControlMessage::Connect, remote));
        let outcome = match asked {
            Ok(()) => match rx.recv_timeout(shared.config.connect_timeout()) {
                Ok(outcome) => outcome,
                Err(_) => Err(ConnectError::Timeout),
            },
            Err(e) => Err(ConnectError::DeviceUnreachable(e.to_string())),
        };
        shared.awaiting.lock().remove(&remote);

        match outcome {
            Ok(()) => {
                info!("Connected to {}", remote);
                Ok(Box::new(link))
            }
            Err(e) => {
                shared.drop_route(remote, &link.state);
                link.state.closed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn listen(&self) -> Result<InboundFeed, TransportError> {
        let (tx, feed) = Feed::channel();
        *self.shared.inbound.lock() = Some(tx);
        info!("Listening for network connections on port {}", self.shared.local_port);
        Ok(feed)
    }

    fn stop_listening(&self) {
        if self.shared.inbound.lock().take().is_some() {
            info!("Stopped listening for network connections");
        }
    }
}

impl Drop for DatagramTransport {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("Datagram dispatcher thread panicked");
            }
        }
    }
}

impl Shared {
    fn run(self: Arc<Self>) {
        debug!("Datagram dispatcher started");
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while self.running.load(Ordering::SeqCst) {
            self.maybe_probe();

            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.dispatch(&buf[..len], from),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    // ICMP unreachable from an earlier send surfaces here
                    debug!("recv_from failed: {}", e);
                    thread::sleep(self.config.poll_interval());
                }
            }
        }

        debug!("Datagram dispatcher stopped");
    }

    fn is_self(&self, from: SocketAddr) -> bool {
        from.port() == self.local_port
            && (from.ip().is_loopback() || self.local_ips.contains(&from.ip()))
    }

    fn dispatch(self: &Arc<Self>, datagram: &[u8], from: SocketAddr) {
        if self.is_self(from) {
            return;
        }

        match ControlMessage::parse(datagram) {
            Some(ControlMessage::Discovery) => self.on_probe(from),
            Some(ControlMessage::Connect) => self.on_connect_request(from),
            Some(ControlMessage::Hangup) => {
                if let Some(route) = self.routes.lock().remove(&from) {
                    route.state.remote_closed.store(true, Ordering::SeqCst);
                    info!("{} hung up", from);
                }
            }
            Some(reply) => {
                if let Some(decision) = reply.decision() {
                    match self.awaiting.lock().get(&from) {
                        Some(tx) => {
                            let _ = tx.try_send(decision.into_result());
                        }
                        None => trace!("Unsolicited {:?} from {}", decision, from),
                    }
                }
            }
            None => match parse_name_announcement(datagram) {
                Some(name) => self.on_name(from, name),
                None => self.deliver(datagram, from),
            },
        }
    }

    fn deliver(&self, datagram: &[u8], from: SocketAddr) {
        let routes = self.routes.lock();
        let Some(route) = routes.get(&from) else {
            trace!("Dropping {} bytes from unknown peer {}", datagram.len(), from);
            return;
        };
        match route.tx.try_send(Bytes::copy_from_slice(datagram)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Inbound queue full for {}, dropping chunk", from),
            Err(TrySendError::Disconnected(_)) => trace!("Link to {} already dropped", from),
        }
    }

    /// How `addr` is presented: its announced name, else its IP
    fn peer_device(&self, addr: SocketAddr) -> Device {
        let names = self.names.lock();
        let name = names.get(&addr).cloned().unwrap_or_else(|| addr.ip().to_string());
        Device::network(Some(&name), addr.to_string())
    }

    fn report_found(&self, from: SocketAddr) {
        if let Some(tx) = self.discovery.lock().as_ref() {
            let device = self.peer_device(from).with_status(PeerStatus::Available);
            let _ = tx.send(ScanEvent::Found(device));
        }
    }

    fn on_name(&self, from: SocketAddr, name: &str) {
        let changed = self.names.lock().insert(from, name.to_string()).as_deref() != Some(name);
        if changed {
            debug!("{} is {}", from, name);
            self.report_found(from);
        }
    }

    fn on_probe(&self, from: SocketAddr) {
        self.report_found(from);

        // Answer each peer at most once per probe interval so two
        // discovering peers do not ping-pong forever
        let now = Instant::now();
        let mut answered = self.answered.lock();
        let due = answered
            .get(&from)
            .map_or(true, |last| now.duration_since(*last) >= self.config.probe_interval());
        if due {
            answered.insert(from, now);
            drop(answered);
            let replied = self
                .send_control(ControlMessage::Discovery, from)
                .and_then(|()| self.announce(from));
            if let Err(e) = replied {
                debug!("Probe reply to {} failed: {}", from, e);
            }
        }
    }

    fn on_connect_request(self: &Arc<Self>, from: SocketAddr) {
        let mut awaiting = self.awaiting.lock();
        let crossed = awaiting.contains_key(&from);
        if crossed {
            if self.seen_by(from) < from {
                debug!("Crossed call with {}, keeping ours", from);
                return;
            }
        } else if self.routes.lock().contains_key(&from) {
            trace!("Duplicate connect request from {}", from);
            return;
        }

        let inbound = self.inbound.lock();
        let Some(tx) = inbound.as_ref() else {
            debug!("Connect request from {} while not listening", from);
            drop(inbound);
            drop(awaiting);
            let _ = self.send_control(ControlMessage::Reject, from);
            return;
        };

        if crossed {
            if let Some(attempt) = awaiting.remove(&from) {
                let _ = attempt.try_send(Err(ConnectError::Crossed));
            }
            info!("Crossed call with {}, answering theirs", from);
        }
        let link = self.open_link(self.peer_device(from), from, true);
        drop(awaiting);
        info!("Incoming connection from {}", from);

        if let Err(rejected) = tx.send(InboundRequest::new(Box::new(link))) {
            drop(inbound);
            rejected.into_inner().reject(Decision::Reject);
        }
    }

    /// Register a route for `remote` and build the link reading from it
    fn open_link(self: &Arc<Self>, peer: Device, remote: SocketAddr, inbound: bool) -> DatagramLink {
        let (tx, rx) = bounded(self.config.inbound_queue.max(1));
        let state = Arc::new(LinkState::default());
        self.routes.lock().insert(
            remote,
            Route {
                tx,
                state: Arc::clone(&state),
            },
        );

        DatagramLink {
            peer,
            remote,
            shared: Arc::clone(self),
            inbound: rx,
            state,
            answers: inbound,
        }
    }

    /// Remove `remote`'s route if it still belongs to the link owning `state`
    fn drop_route(&self, remote: SocketAddr, state: &Arc<LinkState>) {
        let mut routes = self.routes.lock();
        if routes
            .get(&remote)
            .is_some_and(|route| Arc::ptr_eq(&route.state, state))
        {
            routes.remove(&remote);
        }
    }

    fn maybe_probe(&self) {
        if self.discovery.lock().is_none() {
            return;
        }
        let due = self
            .last_probe
            .lock()
            .map_or(true, |last| last.elapsed() >= self.config.probe_interval());
        if due {
            if let Err(e) = self.probe() {
                warn!("Discovery probe failed: {}", e);
            }
        }
    }

    fn probe(&self) -> io::Result<()> {
        *self.last_probe.lock() = Some(Instant::now());
        let mut last_err = None;
        let mut sent = 0;

        for target in &self.probe_targets {
            let probed = self
                .send_control(ControlMessage::Discovery, *target)
                .and_then(|()| self.announce(*target));
            match probed {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!("Probe to {} failed: {}", target, e);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn send_control(&self, msg: ControlMessage, to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(msg.as_bytes(), to).map(|_| ())
    }

    fn announce(&self, to: SocketAddr) -> io::Result<()> {
        self.socket.send_to(&self.announcement, to).map(|_| ())
    }

    /// Our address as `remote` sees it
    fn seen_by(&self, remote: SocketAddr) -> SocketAddr {
        let ip = if self.bound_ip.is_unspecified() {
            route_ip(remote).unwrap_or(self.bound_ip)
        } else {
            self.bound_ip
        };
        SocketAddr::new(ip, self.local_port)
    }
}

/// One established (or pending inbound) datagram connection
pub struct DatagramLink {
    peer: Device,
    remote: SocketAddr,
    shared: Arc<Shared>,
    inbound: Receiver<Bytes>,
    state: Arc<LinkState>,
    answers: bool,
}

impl DatagramLink {
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else if self.state.remote_closed.load(Ordering::SeqCst) {
            Err(TransportError::PeerClosed)
        } else {
            Ok(())
        }
    }

    fn release(&self) -> bool {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.drop_route(self.remote, &self.state);
        true
    }
}

impl Link for DatagramLink {
    fn peer(&self) -> &Device {
        &self.peer
    }

    fn answer(&self, decision: Decision) -> Result<(), TransportError> {
        if !self.answers {
            return Ok(());
        }
        self.check_open()?;

        let result = self
            .shared
            .send_control(decision.control(), self.remote)
            .map_err(|e| TransportError::SendFailed(e.to_string()));
        if decision != Decision::Accept {
            // No hangup: the peer never had a session
            self.release();
        }
        result
    }

    fn send(&self, chunk: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        self.shared
            .socket
            .send_to(chunk, self.remote)
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.inbound.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                if self.state.closed.load(Ordering::SeqCst) {
                    Err(TransportError::Closed)
                } else {
                    Err(TransportError::PeerClosed)
                }
            }
        }
    }

    fn close(&self) {
        let remote_gone = self.state.remote_closed.load(Ordering::SeqCst);
        if self.release() {
            if !remote_gone {
                if let Err(e) = self.shared.send_control(ControlMessage::Hangup, self.remote) {
                    debug!("Hangup to {} failed: {}", self.remote, e);
                }
            }
            debug!("Closed datagram link to {}", self.peer);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Drop for DatagramLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse `host[:port]`, defaulting the port
fn resolve(address: &str, default_port: u16) -> io::Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no address for {}", address)))
}

/// Local address the OS would send from to reach `remote`
fn route_ip(remote: SocketAddr) -> Option<IpAddr> {
    let any = match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(any).ok()?;
    socket.connect(remote).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Best-effort address of the interface broadcasts leave from
fn outbound_ip() -> Option<IpAddr> {
    route_ip(SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 9)))
}
