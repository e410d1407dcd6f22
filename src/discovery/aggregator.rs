//! Discovery aggregation
//!
//! Runs discovery on both transports at once and merges what they find
//! into one [`Roster`]. Each transport's feed is drained by its own pump
//! thread; every change publishes a full roster snapshot.
//!
//! ```text
//!  Bluetooth feed ──► [pump-bluetooth] ─┐
//!                                       ├──► Roster ──► DiscoveryEvent::Roster(snapshot)
//!  Network feed ────► [pump-network] ───┘
//! ```
//!
//! A transport that cannot start is reported as disabled and discovery
//! carries on with the other one.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::roster::Roster;
use crate::capability::{CapabilityGate, OperationFamily};
use crate::device::{Device, TransportKind};
use crate::error::TransportError;
use crate::events::{SubscriptionId, Subscribers};
use crate::transport::{DiscoveryFeed, Next, ScanEvent, Transports};

/// What subscribers of the aggregator see
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// Full roster after a change, in discovery order
    Roster(Arc<[Device]>),
    /// A transport could not start or its radio went away
    TransportDisabled(TransportKind),
    Stopped,
}

/// Merges both transports' discovery into one roster
pub struct DiscoveryAggregator {
    inner: Arc<Inner>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    transports: Transports,
    gate: Arc<CapabilityGate>,
    roster: RwLock<Roster>,
    published: RwLock<Arc<[Device]>>,
    events: Subscribers<DiscoveryEvent>,
    active: AtomicBool,
    cycle: AtomicU64,
    poll_interval: Duration,
}

impl DiscoveryAggregator {
    pub fn new(transports: Transports, gate: Arc<CapabilityGate>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transports,
                gate,
                roster: RwLock::new(Roster::new()),
                published: RwLock::new(Arc::from(Vec::new())),
                events: Subscribers::new(),
                active: AtomicBool::new(false),
                cycle: AtomicU64::new(0),
                poll_interval,
            }),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Start discovery on both transports
    pub fn start(&self) -> Result<(), TransportError> {
        self.start_on(&TransportKind::ALL)
    }

    /// Start discovery on `kinds`. A no-op while already active.
    ///
    /// Every requested transport is checked against the capability gate
    /// before any of them is touched. Succeeds if at least one transport
    /// started.
    pub fn start_on(&self, kinds: &[TransportKind]) -> Result<(), TransportError> {
        let mut pumps = self.pumps.lock();
        if self.inner.active.load(Ordering::SeqCst) {
            debug!("Discovery already active");
            return Ok(());
        }

        for &kind in kinds {
            if let Err(denied) = self.inner.gate.check(OperationFamily::Discover, kind) {
                warn!("Discovery denied: {}", denied);
                return Err(TransportError::PermissionDenied(denied));
            }
        }

        // Leftover pumps from a cycle that ended on its own
        for handle in pumps.drain(..) {
            let _ = handle.join();
        }

        self.inner.roster.write().clear();
        self.inner.publish_roster();

        let cycle = self.inner.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.active.store(true, Ordering::SeqCst);

        // Each pump starts its own transport so a slow radio does not hold
        // up the other one; wait until every transport has answered
        let (started_tx, started_rx) = bounded(kinds.len());
        for &kind in kinds {
            let inner = Arc::clone(&self.inner);
            let started = started_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("discovery-{}", kind))
                .spawn(move || inner.run(kind, cycle, started));
            match spawned {
                Ok(handle) => pumps.push(handle),
                Err(e) => {
                    error!("Failed to spawn {} discovery pump: {}", kind, e);
                    let _ = started_tx.send((kind, Err(TransportError::Io(e.to_string()))));
                }
            }
        }
        drop(started_tx);

        let mut running = 0;
        let mut last_err = None;
        for _ in kinds {
            let (kind, outcome) = match started_rx.recv() {
                Ok(started) => started,
                Err(_) => break,
            };
            match outcome {
                Ok(()) => running += 1,
                Err(e) => {
                    warn!("{} discovery unavailable, continuing without it: {}", kind, e);
                    self.inner.events.publish(DiscoveryEvent::TransportDisabled(kind));
                    last_err = Some(e);
                }
            }
        }

        if running == 0 {
            self.inner.active.store(false, Ordering::SeqCst);
            for handle in pumps.drain(..) {
                let _ = handle.join();
            }
            return Err(last_err.unwrap_or_else(|| TransportError::Unavailable {
                kind: TransportKind::Bluetooth,
                reason: "no transport requested".into(),
            }));
        }

        info!("Discovery started on {} transport(s)", running);
        Ok(())
    }

    /// Cancel discovery on both transports and wait for the pumps.
    /// Idempotent.
    pub fn stop(&self) {
        let mut pumps = self.pumps.lock();
        let was_active = self.inner.active.swap(false, Ordering::SeqCst);

        if was_active {
            for transport in self.inner.transports.iter() {
                transport.stop_discover();
            }
        }
        for handle in pumps.drain(..) {
            if handle.join().is_err() {
                error!("Discovery pump panicked");
            }
        }

        if was_active {
            info!("Discovery stopped");
            self.inner.events.publish(DiscoveryEvent::Stopped);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Latest published roster
    pub fn roster(&self) -> Arc<[Device]> {
        Arc::clone(&self.inner.published.read())
    }

    /// Strongest-signal device currently known
    pub fn strongest(&self) -> Option<Device> {
        self.inner.roster.read().strongest().cloned()
    }

    pub fn find_by_name(&self, kind: TransportKind, name: &str) -> Option<Device> {
        self.inner.roster.read().find_by_name(kind, name).cloned()
    }

    pub fn subscribe(&self) -> (SubscriptionId, Receiver<DiscoveryEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl Drop for DiscoveryAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn is_current(&self, cycle: u64) -> bool {
        self.active.load(Ordering::SeqCst) && self.cycle.load(Ordering::SeqCst) == cycle
    }

    /// Start `kind`'s discovery, report the outcome, then drain its feed
    fn run(
        &self,
        kind: TransportKind,
        cycle: u64,
        started: Sender<(TransportKind, Result<(), TransportError>)>,
    ) {
        let feed = match self.transports.get(kind).discover() {
            Ok(feed) => feed,
            Err(e) => {
                let _ = started.send((kind, Err(e)));
                return;
            }
        };
        let _ = started.send((kind, Ok(())));
        drop(started);
        self.pump(kind, feed, cycle);
    }

    fn pump(&self, kind: TransportKind, feed: DiscoveryFeed, cycle: u64) {
        debug!("{} discovery pump started", kind);

        while self.is_current(cycle) {
            match feed.next_timeout(self.poll_interval) {
                Next::Item(ScanEvent::Found(device)) => {
                    if device.transport != kind {
                        warn!("{} feed reported a {} device, ignoring", kind, device.transport);
                        continue;
                    }
                    if let Err(denied) = self.gate.check(OperationFamily::Discover, kind) {
                        debug!("Dropping discovery result: {}", denied);
                        continue;
                    }
                    if !self.is_current(cycle) {
                        break;
                    }
                    debug!("Found {}", device);
                    self.roster.write().upsert(device);
                    self.publish_roster();
                }
                Next::Item(ScanEvent::RadioDisabled) => {
                    warn!("{} radio disabled, clearing roster", kind);
                    self.roster.write().clear();
                    self.publish_roster();
                    self.events.publish(DiscoveryEvent::TransportDisabled(kind));
                }
                Next::Pending => {}
                Next::Finished => {
                    debug!("{} discovery feed finished", kind);
                    break;
                }
            }
        }

        debug!("{} discovery pump stopped", kind);
    }

    fn publish_roster(&self) {
        let snapshot = {
            let roster = self.roster.read();
            let snapshot = roster.snapshot();
            *self.published.write() = Arc::clone(&snapshot);
            snapshot
        };
        self.events.publish(DiscoveryEvent::Roster(snapshot));
    }
}
