//! Stream transport (Bluetooth RFCOMM style)
//!
//! Reliable, ordered bytes over a connected socket. Radio specifics
//! (scanning, advertising, opening and binding sockets) live behind
//! [`StreamRadio`] so a platform backend can be dropped in; [`TcpRadio`]
//! is the desktop backend.
//!
//! ## Handshake
//!
//! ```text
//! connector                      acceptor
//!     |--- hello [len][name] ------->|   listener surfaces InboundRequest
//!     |<-- decision byte ------------|   after accept/reject/busy
//!     |=== raw PCM both ways ========|
//! ```

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use super::{DiscoveryFeed, Feed, InboundFeed, InboundRequest, Link, ScanEvent, Transport};
use crate::config::StreamConfig;
use crate::device::{Device, TransportKind};
use crate::error::{ConnectError, TransportError};
use crate::protocol::{encode_hello, Decision, SERVICE_NAME, SPP_UUID};

/// Write timeout on established stream links
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Platform radio operations the stream transport is built on
pub trait StreamRadio: Send + Sync + 'static {
    /// Whether the radio is powered and usable
    fn is_enabled(&self) -> bool;

    /// Begin scanning. Found peers are pushed into `events` until
    /// [`cancel_scan`](StreamRadio::cancel_scan); the radio must drop its
    /// sender on cancel so the feed ends.
    fn start_scan(&self, events: Sender<ScanEvent>) -> io::Result<()>;

    fn cancel_scan(&self);

    /// Make the local device discoverable for `duration`
    fn advertise(&self, duration: Duration) -> io::Result<()>;

    /// Open a connected socket to `address`
    fn open(&self, address: &str, timeout: Duration) -> io::Result<Socket>;

    /// Bind the listening socket for the service
    fn bind(&self) -> io::Result<Socket>;

    /// Address string a peer connected from `addr` is reported under
    fn describe(&self, addr: &SockAddr) -> String;
}

/// Stream transport over a [`StreamRadio`]
pub struct StreamTransport<R: StreamRadio> {
    radio: Arc<R>,
    config: StreamConfig,
    /// Bytes per frame handed out by `receive`
    frame_size: usize,
    scanning: AtomicBool,
    listener: Mutex<Option<ListenerThread>>,
}

struct ListenerThread {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl<R: StreamRadio> StreamTransport<R> {
    pub fn new(radio: R, config: StreamConfig, frame_size: usize) -> Self {
        Self {
            radio: Arc::new(radio),
            config,
            frame_size: frame_size.max(1),
            scanning: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub fn radio(&self) -> &Arc<R> {
        &self.radio
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn unavailable(&self, reason: impl Into<String>) -> TransportError {
        TransportError::Unavailable {
            kind: TransportKind::Bluetooth,
            reason: reason.into(),
        }
    }

    /// Wait for the acceptor's decision byte
    fn await_decision(&self, socket: &Socket) -> Result<Decision, ConnectError> {
        socket
            .set_read_timeout(Some(self.config.connect_timeout()))
            .map_err(|e| ConnectError::DeviceUnreachable(e.to_string()))?;

        let mut byte = [0u8; 1];
        loop {
            return match (&*socket).read(&mut byte) {
                Ok(0) => Err(ConnectError::DeviceUnreachable(
                    "connection closed during handshake".into(),
                )),
                Ok(_) => Decision::from_byte(byte[0]).ok_or_else(|| {
                    ConnectError::DeviceUnreachable(format!(
                        "unexpected handshake byte 0x{:02x}",
                        byte[0]
                    ))
                }),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => Err(ConnectError::Timeout),
                Err(e) => Err(ConnectError::DeviceUnreachable(e.to_string())),
            };
        }
    }
}

impl<R: StreamRadio> Transport for StreamTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    fn discover(&self) -> Result<DiscoveryFeed, TransportError> {
        if !self.radio.is_enabled() {
            return Err(self.unavailable("radio is disabled"));
        }
        if self.scanning.swap(true, Ordering::SeqCst) {
            // Restart: end the previous cycle's feed first
            self.radio.cancel_scan();
        }

        if let Err(e) = self.radio.advertise(self.config.advertise_duration()) {
            warn!("Failed to make device discoverable: {}", e);
        }

        let (tx, feed) = Feed::channel();
        if let Err(e) = self.radio.start_scan(tx) {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(self.unavailable(format!("scan failed: {}", e)));
        }

        info!("Stream discovery started");
        Ok(feed)
    }

    fn stop_discover(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.radio.cancel_scan();
            info!("Stream discovery stopped");
        }
    }

    fn connect(&self, address: &str) -> Result<Box<dyn Link>, ConnectError> {
        // Scanning and connecting cannot overlap on the radio
        self.stop_discover();

        if !self.radio.is_enabled() {
            return Err(ConnectError::DeviceUnreachable("radio is disabled".into()));
        }

        info!("Connecting to {} (service {})", address, SPP_UUID);
        let socket = self
            .radio
            .open(address, self.config.connect_timeout())
            .map_err(|e| {
                if is_timeout(&e) {
                    ConnectError::Timeout
                } else if e.kind() == ErrorKind::InvalidInput {
                    ConnectError::InvalidAddress(address.to_string())
                } else {
                    ConnectError::DeviceUnreachable(e.to_string())
                }
            })?;

        (&socket)
            .write_all(&encode_hello(&self.config.local_name))
            .map_err(|e| ConnectError::DeviceUnreachable(e.to_string()))?;

        let decision = self.await_decision(&socket)?;
        debug!("{} answered {:?}", address, decision);
        decision.into_result()?;

        let peer = Device::bluetooth(None, address);
        let link = StreamLink::new(socket, peer, self.frame_size, false)
            .map_err(|e| ConnectError::DeviceUnreachable(e.to_string()))?;
        info!("Connected to {}", address);
        Ok(Box::new(link))
    }

    fn listen(&self) -> Result<InboundFeed, TransportError> {
        self.stop_listening();

        let socket = self
            .radio
            .bind()
            .map_err(|e| self.unavailable(format!("failed to bind {}: {}", SERVICE_NAME, e)))?;
        socket.set_nonblocking(true)?;

        let (tx, feed) = Feed::channel();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = AcceptContext {
            radio: Arc::clone(&self.radio),
            socket,
            running: Arc::clone(&running),
            poll_interval: self.config.poll_interval(),
            handshake_timeout: self.config.handshake_timeout(),
            frame_size: self.frame_size,
        };

        let handle = thread::Builder::new()
            .name("stream-listener".to_string())
            .spawn(move || ctx.run(tx))
            .map_err(|e| TransportError::Io(e.to_string()))?;

        *self.listener.lock() = Some(ListenerThread { running, handle });
        info!("Listening for {} connections", SERVICE_NAME);
        Ok(feed)
    }

    fn stop_listening(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.running.store(false, Ordering::SeqCst);
            if listener.handle.join().is_err() {
                error!("Stream listener thread panicked");
            }
            info!("Stopped listening for {} connections", SERVICE_NAME);
        }
    }
}

impl<R: StreamRadio> Drop for StreamTransport<R> {
    fn drop(&mut self) {
        self.stop_listening();
        self.stop_discover();
    }
}

/// Everything the accept loop owns
struct AcceptContext<R: StreamRadio> {
    radio: Arc<R>,
    socket: Socket,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    handshake_timeout: Duration,
    frame_size: usize,
}

impl<R: StreamRadio> AcceptContext<R> {
    fn run(self, requests: Sender<InboundRequest>) {
        debug!("Stream listener started");

        while self.running.load(Ordering::SeqCst) {
            match self.socket.accept() {
                Ok((conn, addr)) => {
                    let address = self.radio.describe(&addr);
                    self.spawn_handshake(conn, address, requests.clone());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    thread::sleep(self.poll_interval);
                }
            }
        }

        debug!("Stream listener stopped");
    }

    /// A connector that never sends its hello must not hold up the next one
    fn spawn_handshake(&self, conn: Socket, address: String, requests: Sender<InboundRequest>) {
        let timeout = self.handshake_timeout;
        let frame_size = self.frame_size;
        let spawned = thread::Builder::new()
            .name("stream-handshake".into())
            .spawn(move || match handshake(conn, &address, timeout, frame_size) {
                Ok(link) => {
                    info!("Incoming connection from {}", link.peer());
                    if requests.send(InboundRequest::new(Box::new(link))).is_err() {
                        debug!("Inbound feed dropped, closing connection from {}", address);
                    }
                }
                Err(e) => warn!("Handshake with {} failed: {}", address, e),
            });
        if let Err(e) = spawned {
            error!("Cannot start handshake thread: {}", e);
        }
    }
}

/// Read the connector's hello
fn handshake(
    conn: Socket,
    address: &str,
    timeout: Duration,
    frame_size: usize,
) -> io::Result<StreamLink> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(timeout))?;

    let mut len = [0u8; 1];
    (&conn).read_exact(&mut len)?;
    let mut name = vec![0u8; len[0] as usize];
    (&conn).read_exact(&mut name)?;
    let name = String::from_utf8_lossy(&name);

    let peer = Device::bluetooth(Some(&name), address);
    StreamLink::new(conn, peer, frame_size, true)
}

/// One established stream connection.
///
/// Incoming bytes are re-framed into `frame_size` chunks so the receiver
/// sees the same chunk boundaries the sender produced.
pub struct StreamLink {
    peer: Device,
    socket: Socket,
    frame_size: usize,
    pending: Mutex<BytesMut>,
    write_lock: Mutex<()>,
    inbound: bool,
    closed: AtomicBool,
}

impl StreamLink {
    fn new(socket: Socket, peer: Device, frame_size: usize, inbound: bool) -> io::Result<Self> {
        socket.set_write_timeout(Some(SEND_TIMEOUT))?;
        let _ = socket.set_nodelay(true);

        Ok(Self {
            peer,
            socket,
            frame_size,
            pending: Mutex::new(BytesMut::with_capacity(frame_size * 2)),
            write_lock: Mutex::new(()),
            inbound,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Link for StreamLink {
    fn peer(&self) -> &Device {
        &self.peer
    }

    fn answer(&self, decision: Decision) -> Result<(), TransportError> {
        if !self.inbound {
            return Ok(());
        }
        self.check_open()?;

        let result = {
            let _guard = self.write_lock.lock();
            (&self.socket).write_all(&[decision.to_byte()])
        };
        if decision != Decision::Accept {
            self.close();
        }
        result.map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn send(&self, chunk: &[u8]) -> Result<(), TransportError> {
        self.check_open()?;
        let _guard = self.write_lock.lock();
        (&self.socket)
            .write_all(chunk)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        self.check_open()?;

        let mut pending = self.pending.lock();
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];

        while pending.len() < self.frame_size {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(deadline - now))?;

            let want = (self.frame_size - pending.len()).min(buf.len());
            match (&self.socket).read(&mut buf[..want]) {
                Ok(0) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(TransportError::Closed);
                    }
                    if !pending.is_empty() {
                        // Short tail before EOF
                        return Ok(Some(pending.split().freeze()));
                    }
                    return Err(TransportError::PeerClosed);
                }
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, self.peer.address);
                    pending.extend_from_slice(&buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(TransportError::Closed);
                    }
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }

        Ok(Some(pending.split_to(self.frame_size).freeze()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.socket.shutdown(Shutdown::Both) {
                trace!("Shutdown of link to {}: {}", self.peer.address, e);
            }
            debug!("Closed stream link to {}", self.peer);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Desktop radio backend: RFCOMM sockets stand in as TCP.
///
/// There is no radio to scan with, so a scan reports the configured
/// `known_peers` (the bonded-device list) plus anything injected through
/// [`report_found`](TcpRadio::report_found).
pub struct TcpRadio {
    listen_address: String,
    known_peers: Vec<Device>,
    enabled: AtomicBool,
    scan: Mutex<Option<Sender<ScanEvent>>>,
}

impl TcpRadio {
    pub fn new(config: &StreamConfig) -> Self {
        let known_peers = config
            .known_peers
            .iter()
            .map(|peer| Device::bluetooth(Some(&peer.name), peer.address.as_str()))
            .collect();

        Self {
            listen_address: config.listen_address.clone(),
            known_peers,
            enabled: AtomicBool::new(true),
            scan: Mutex::new(None),
        }
    }

    /// Power the radio on or off. Turning it off mid-scan ends discovery
    /// with [`ScanEvent::RadioDisabled`].
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            if let Some(tx) = self.scan.lock().take() {
                let _ = tx.send(ScanEvent::RadioDisabled);
            }
        }
    }

    /// Feed a scan result into the running scan. Returns false when no
    /// scan is active.
    pub fn report_found(&self, device: Device) -> bool {
        match self.scan.lock().as_ref() {
            Some(tx) => tx.send(ScanEvent::Found(device)).is_ok(),
            None => false,
        }
    }
}

impl StreamRadio for TcpRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn start_scan(&self, events: Sender<ScanEvent>) -> io::Result<()> {
        for peer in &self.known_peers {
            let mut device = peer.clone();
            device.last_seen = chrono::Utc::now();
            let _ = events.send(ScanEvent::Found(device));
        }
        *self.scan.lock() = Some(events);
        Ok(())
    }

    fn cancel_scan(&self) {
        self.scan.lock().take();
    }

    fn advertise(&self, duration: Duration) -> io::Result<()> {
        debug!(
            "Discoverable as {} on {} for {}s",
            SERVICE_NAME,
            self.listen_address,
            duration.as_secs()
        );
        Ok(())
    }

    fn open(&self, address: &str, timeout: Duration) -> io::Result<Socket> {
        let addr = resolve(address)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&addr.into(), timeout)?;
        Ok(socket)
    }

    fn bind(&self) -> io::Result<Socket> {
        let addr = resolve(&self.listen_address)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(8)?;
        Ok(socket)
    }

    fn describe(&self, addr: &SockAddr) -> String {
        addr.as_socket()
            .map(|a| a.to_string())
            .unwrap_or_else(|| format!("{:?}", addr))
    }
}

fn resolve(address: &str) -> io::Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no address for {}", address)))
}
