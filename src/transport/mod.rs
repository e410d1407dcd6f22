//! Transport abstraction
//!
//! Two concrete substrates sit behind one contract:
//!
//! - [`StreamTransport`]: reliable, ordered byte stream (Bluetooth RFCOMM
//!   style). The radio backend is pluggable through [`StreamRadio`];
//!   [`TcpRadio`] drives it over TCP on desktop hosts.
//! - [`DatagramTransport`]: one UDP socket shared by discovery probes, the
//!   connection handshake and audio. Datagrams may be lost or reordered.
//!
//! Every call here may block and must run off any UI-facing thread.
//!
//! **Hard rule:** discovery and an active connection attempt are mutually
//! exclusive on the stream transport. [`Transport::connect`] cancels any
//! in-progress scan before opening the link; this is a platform constraint
//! of Bluetooth radios, not an optimization.

pub mod datagram;
pub mod stream;

#[cfg(test)]
pub(crate) mod mock;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::device::{Device, TransportKind};
use crate::error::{ConnectError, TransportError};
use crate::protocol::Decision;

pub use datagram::{DatagramLink, DatagramTransport};
pub use stream::{StreamLink, StreamRadio, StreamTransport, TcpRadio};

/// Raw discovery output of one transport
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Found(Device),
    /// The underlying radio was switched off mid-discovery
    RadioDisabled,
}

/// Result of waiting on a [`Feed`]
#[derive(Debug)]
pub enum Next<T> {
    Item(T),
    /// Nothing arrived within the timeout
    Pending,
    /// The producer is gone; the sequence is over
    Finished,
}

/// A lazy sequence produced by a transport.
///
/// Iterating blocks until the next item; [`next_timeout`](Feed::next_timeout)
/// lets loops observe cancellation between items.
pub struct Feed<T> {
    rx: Receiver<T>,
}

impl<T> Feed<T> {
    pub fn new(rx: Receiver<T>) -> Self {
        Self { rx }
    }

    /// Unbounded producer/feed pair
    pub fn channel() -> (Sender<T>, Feed<T>) {
        let (tx, rx) = unbounded();
        (tx, Feed::new(rx))
    }

    /// Bounded producer/feed pair
    pub fn bounded(capacity: usize) -> (Sender<T>, Feed<T>) {
        let (tx, rx) = bounded(capacity);
        (tx, Feed::new(rx))
    }

    pub fn next_timeout(&self, timeout: Duration) -> Next<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Next::Item(item),
            Err(RecvTimeoutError::Timeout) => Next::Pending,
            Err(RecvTimeoutError::Disconnected) => Next::Finished,
        }
    }

    pub fn try_next(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Iterator for Feed<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}

pub type DiscoveryFeed = Feed<ScanEvent>;
pub type InboundFeed = Feed<InboundRequest>;

/// One end of an established (or half-open, inbound) connection.
///
/// Implementations must be safe to use from several threads at once: the
/// capture loop sends while the receive loop blocks in `receive`, and
/// `close` may come from a third thread.
pub trait Link: Send + Sync {
    /// The remote device as this transport sees it
    fn peer(&self) -> &Device;

    fn kind(&self) -> TransportKind {
        self.peer().transport
    }

    /// Answer an inbound request. Anything but [`Decision::Accept`] also
    /// closes the link. No-op on outbound links.
    fn answer(&self, decision: Decision) -> Result<(), TransportError>;

    /// Push one chunk to the peer
    fn send(&self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Wait up to `timeout` for the next chunk. `Ok(None)` means nothing
    /// arrived yet and is never an error.
    fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError>;

    /// Release the underlying resources. Idempotent, never fails.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An inbound connection surfaced for an accept/reject decision
pub struct InboundRequest {
    link: Box<dyn Link>,
}

impl InboundRequest {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self { link }
    }

    pub fn peer(&self) -> &Device {
        self.link.peer()
    }

    pub fn kind(&self) -> TransportKind {
        self.link.kind()
    }

    /// Tell the peer yes and hand over the link
    pub fn accept(self) -> Result<Box<dyn Link>, TransportError> {
        match self.link.answer(Decision::Accept) {
            Ok(()) => Ok(self.link),
            Err(e) => {
                self.link.close();
                Err(TransportError::AcceptFailed(e.to_string()))
            }
        }
    }

    /// Tell the peer no and close the half-open link
    pub fn reject(self, decision: Decision) {
        if let Err(e) = self.link.answer(decision) {
            tracing::debug!("Failed to deliver {:?} to {}: {}", decision, self.peer(), e);
        }
        self.link.close();
    }
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("peer", self.peer())
            .finish()
    }
}

/// Uniform operations over one transport kind
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin a discovery cycle. Restartable after `stop_discover`; starting
    /// again replaces the previous cycle's feed.
    fn discover(&self) -> Result<DiscoveryFeed, TransportError>;

    /// End the current discovery cycle. Idempotent.
    fn stop_discover(&self);

    /// Open a link to `address` and wait for the peer's decision
    fn connect(&self, address: &str) -> Result<Box<dyn Link>, ConnectError>;

    /// Start accepting inbound connections. The feed runs until
    /// `stop_listening`.
    fn listen(&self) -> Result<InboundFeed, TransportError>;

    /// Stop accepting inbound connections. Idempotent.
    fn stop_listening(&self);
}

/// The pair of transports a session manager drives
#[derive(Clone)]
pub struct Transports {
    bluetooth: Arc<dyn Transport>,
    network: Arc<dyn Transport>,
}

impl Transports {
    pub fn new(bluetooth: Arc<dyn Transport>, network: Arc<dyn Transport>) -> Self {
        debug_assert_eq!(bluetooth.kind(), TransportKind::Bluetooth);
        debug_assert_eq!(network.kind(), TransportKind::NetworkP2P);
        Self { bluetooth, network }
    }

    pub fn get(&self, kind: TransportKind) -> &Arc<dyn Transport> {
        match kind {
            TransportKind::Bluetooth => &self.bluetooth,
            TransportKind::NetworkP2P => &self.network,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        [&self.bluetooth, &self.network].into_iter()
    }
}
