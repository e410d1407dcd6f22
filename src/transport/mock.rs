//! In-memory transports for tests

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{DiscoveryFeed, Feed, InboundFeed, InboundRequest, Link, ScanEvent, Transport};
use crate::device::{Device, TransportKind};
use crate::error::{ConnectError, TransportError};
use crate::protocol::Decision;

/// How a link pair delivers chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Reliable,
    /// Every `n`th chunk is silently lost
    Lossy(usize),
}

/// One end of an in-memory link pair
pub(crate) struct MemoryLink {
    peer: Device,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    delivery: Delivery,
    inbound: bool,
    mine: Arc<AtomicBool>,
    theirs: Arc<AtomicBool>,
    decision: Arc<Mutex<Option<Decision>>>,
    pub(crate) sent: AtomicUsize,
    pub(crate) fail_sends: AtomicBool,
}

/// Build two connected ends. `a` sees `b_device` as its peer and vice versa.
pub(crate) fn link_pair(
    a_device: Device,
    b_device: Device,
    delivery: Delivery,
) -> (MemoryLink, MemoryLink) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();
    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));
    let decision = Arc::new(Mutex::new(None));

    let a = MemoryLink {
        peer: b_device,
        tx: a_tx,
        rx: a_rx,
        delivery,
        inbound: false,
        mine: Arc::clone(&a_closed),
        theirs: Arc::clone(&b_closed),
        decision: Arc::clone(&decision),
        sent: AtomicUsize::new(0),
        fail_sends: AtomicBool::new(false),
    };
    let b = MemoryLink {
        peer: a_device,
        tx: b_tx,
        rx: b_rx,
        delivery,
        inbound: true,
        mine: b_closed,
        theirs: a_closed,
        decision,
        sent: AtomicUsize::new(0),
        fail_sends: AtomicBool::new(false),
    };
    (a, b)
}

impl MemoryLink {
    /// Decision recorded by the inbound end of this pair
    pub(crate) fn decision(&self) -> Option<Decision> {
        *self.decision.lock()
    }

    pub(crate) fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl Link for MemoryLink {
    fn peer(&self) -> &Device {
        &self.peer
    }

    fn answer(&self, decision: Decision) -> Result<(), TransportError> {
        if !self.inbound {
            return Ok(());
        }
        *self.decision.lock() = Some(decision);
        if decision != Decision::Accept {
            self.close();
        }
        Ok(())
    }

    fn send(&self, chunk: &[u8]) -> Result<(), TransportError> {
        if self.mine.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected".into()));
        }
        if self.theirs.load(Ordering::SeqCst) {
            return Err(TransportError::PeerClosed);
        }

        let index = self.sent.fetch_add(1, Ordering::SeqCst);
        if let Delivery::Lossy(n) = self.delivery {
            if n > 0 && index % n == n - 1 {
                return Ok(());
            }
        }
        let _ = self.tx.send(Bytes::copy_from_slice(chunk));
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        if self.mine.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(RecvTimeoutError::Timeout) if self.theirs.load(Ordering::SeqCst) => {
                Err(TransportError::PeerClosed)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::PeerClosed),
        }
    }

    fn close(&self) {
        self.mine.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.mine.load(Ordering::SeqCst)
    }
}

/// Shared view of a link handed out by the mock
pub(crate) struct SharedLink(pub(crate) Arc<MemoryLink>);

impl Link for SharedLink {
    fn peer(&self) -> &Device {
        self.0.peer()
    }

    fn answer(&self, decision: Decision) -> Result<(), TransportError> {
        self.0.answer(decision)
    }

    fn send(&self, chunk: &[u8]) -> Result<(), TransportError> {
        self.0.send(chunk)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        self.0.receive(timeout)
    }

    fn close(&self) {
        self.0.close()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Transport calls, counted
#[derive(Debug, Default)]
pub(crate) struct Calls {
    pub(crate) discover: AtomicUsize,
    pub(crate) stop_discover: AtomicUsize,
    pub(crate) connect: AtomicUsize,
    pub(crate) listen: AtomicUsize,
}

impl Calls {
    /// Calls that touch the radio on behalf of a caller
    pub(crate) fn radio_calls(&self) -> usize {
        self.discover.load(Ordering::SeqCst)
            + self.connect.load(Ordering::SeqCst)
            + self.listen.load(Ordering::SeqCst)
    }
}

/// What the next `connect` call does
pub(crate) enum ConnectScript {
    /// Succeed; the remote end is kept in `remotes`
    Accept,
    Fail(ConnectError),
    /// Block until released, then succeed
    Hold(Receiver<()>),
}

/// Scriptable transport that records every call
pub(crate) struct MockTransport {
    kind: TransportKind,
    delivery: Delivery,
    pub(crate) calls: Calls,
    pub(crate) unavailable: AtomicBool,
    scan: Mutex<Option<Sender<ScanEvent>>>,
    inbound: Mutex<Option<Sender<InboundRequest>>>,
    script: Mutex<VecDeque<ConnectScript>>,
    /// Far ends of links handed out by `connect`, in order
    pub(crate) remotes: Mutex<Vec<Arc<MemoryLink>>>,
    /// Near ends handed out by `connect`, in order
    pub(crate) locals: Mutex<Vec<Arc<MemoryLink>>>,
    /// Order in which `connect` saw discovery state
    pub(crate) scanning_at_connect: Mutex<Vec<bool>>,
    /// Runs at the start of every `connect`
    pub(crate) on_connect: Mutex<Option<Box<dyn Fn() + Send>>>,
    /// When set, `discover` blocks until released
    pub(crate) discover_hold: Mutex<Option<Receiver<()>>>,
}

impl MockTransport {
    pub(crate) fn new(kind: TransportKind) -> Self {
        let delivery = if kind.is_reliable() {
            Delivery::Reliable
        } else {
            Delivery::Lossy(5)
        };
        Self::with_delivery(kind, delivery)
    }

    pub(crate) fn with_delivery(kind: TransportKind, delivery: Delivery) -> Self {
        Self {
            kind,
            delivery,
            calls: Calls::default(),
            unavailable: AtomicBool::new(false),
            scan: Mutex::new(None),
            inbound: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            remotes: Mutex::new(Vec::new()),
            locals: Mutex::new(Vec::new()),
            scanning_at_connect: Mutex::new(Vec::new()),
            on_connect: Mutex::new(None),
            discover_hold: Mutex::new(None),
        }
    }

    pub(crate) fn script(&self, step: ConnectScript) {
        self.script.lock().push_back(step);
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.scan.lock().is_some()
    }

    /// Report a discovered device; false if no scan is running
    pub(crate) fn found(&self, device: Device) -> bool {
        match self.scan.lock().as_ref() {
            Some(tx) => tx.send(ScanEvent::Found(device)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn radio_disabled(&self) {
        if let Some(tx) = self.scan.lock().as_ref() {
            let _ = tx.send(ScanEvent::RadioDisabled);
        }
    }

    /// Deliver an inbound request from `peer`; returns the remote end
    pub(crate) fn inbound_from(&self, peer: Device) -> Option<Arc<MemoryLink>> {
        let local = Device::new(Some("local"), "local", self.kind);
        let (remote, ours) = link_pair(peer, local, self.delivery);
        let remote = Arc::new(remote);

        let inbound = self.inbound.lock();
        let tx = inbound.as_ref()?;
        tx.send(InboundRequest::new(Box::new(ours))).ok()?;
        Some(remote)
    }

    pub(crate) fn last_local(&self) -> Option<Arc<MemoryLink>> {
        self.locals.lock().last().cloned()
    }

    pub(crate) fn last_remote(&self) -> Option<Arc<MemoryLink>> {
        self.remotes.lock().last().cloned()
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn discover(&self) -> Result<DiscoveryFeed, TransportError> {
        self.calls.discover.fetch_add(1, Ordering::SeqCst);
        let hold = self.discover_hold.lock().take();
        if let Some(release) = hold {
            let _ = release.recv_timeout(Duration::from_secs(5));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable {
                kind: self.kind,
                reason: "mock radio off".into(),
            });
        }
        let (tx, feed) = Feed::channel();
        *self.scan.lock() = Some(tx);
        Ok(feed)
    }

    fn stop_discover(&self) {
        self.calls.stop_discover.fetch_add(1, Ordering::SeqCst);
        self.scan.lock().take();
    }

    fn connect(&self, address: &str) -> Result<Box<dyn Link>, ConnectError> {
        self.calls.connect.fetch_add(1, Ordering::SeqCst);
        self.scanning_at_connect.lock().push(self.is_scanning());
        if let Some(hook) = self.on_connect.lock().as_ref() {
            hook();
        }

        let step = self.script.lock().pop_front().unwrap_or(ConnectScript::Accept);
        match step {
            ConnectScript::Fail(e) => return Err(e),
            ConnectScript::Hold(release) => {
                let _ = release.recv_timeout(Duration::from_secs(5));
            }
            ConnectScript::Accept => {}
        }

        let local = Device::new(Some("local"), "local", self.kind);
        let peer = Device::new(None, address, self.kind);
        let (ours, remote) = link_pair(local, peer, self.delivery);
        let ours = Arc::new(ours);
        self.remotes.lock().push(Arc::new(remote));
        self.locals.lock().push(Arc::clone(&ours));
        Ok(Box::new(SharedLink(ours)))
    }

    fn listen(&self) -> Result<InboundFeed, TransportError> {
        self.calls.listen.fetch_add(1, Ordering::SeqCst);
        let (tx, feed) = Feed::channel();
        *self.inbound.lock() = Some(tx);
        Ok(feed)
    }

    fn stop_listening(&self) {
        self.inbound.lock().take();
    }
}
