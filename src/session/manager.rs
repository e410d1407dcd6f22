//! Session manager
//!
//! Owns the session state machine and everything hanging off it: the
//! discovery aggregator, one listener thread per transport, the fault
//! supervisor and the audio pipeline of the active session.
//!
//! ```text
//!  [listener-bluetooth] ─┐                      ┌─► SessionEvent subscribers
//!  [listener-network] ───┼──► Machine (Mutex) ──┤
//!  [session-supervisor] ─┘         │            └─► AudioPipeline (active session)
//!         ▲                        ▼
//!         └──── SessionFault ◄── Session
//! ```
//!
//! Transitions are made under the machine lock; transport I/O (connect,
//! accept, close) always happens with the lock released, and the result is
//! committed by re-taking it. At most one session is active. Outbound
//! attempts carry an attempt number so a result that lands after the
//! attempt was cancelled or beaten is discarded and its link closed.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handle::{Session, SessionFault};
use super::state::{
    AutoRejectReason, ConnectionState, SessionEvent, SessionSnapshot, SessionState,
};
use crate::audio::{AudioEndpoints, AudioPipeline, TalkSwitch};
use crate::capability::{CapabilityGate, OperationFamily};
use crate::config::{AppConfig, AudioConfig, SessionConfig};
use crate::device::{Device, TransportKind, UNKNOWN_DEVICE_NAME};
use crate::discovery::{DiscoveryAggregator, DiscoveryEvent};
use crate::error::{ConnectError, SessionError};
use crate::events::{SubscriptionId, Subscribers};
use crate::protocol::Decision;
use crate::transport::{InboundFeed, InboundRequest, Link, Next, Transports};

/// Discovery, connection and switchover for one local device
pub struct SessionManager {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: SessionConfig,
    audio: AudioConfig,
    gate: Arc<CapabilityGate>,
    transports: Transports,
    discovery: DiscoveryAggregator,
    endpoints: AudioEndpoints,
    talk: Arc<TalkSwitch>,
    machine: Mutex<Machine>,
    snapshot: RwLock<Arc<SessionSnapshot>>,
    events: Subscribers<SessionEvent>,
    faults_tx: Sender<SessionFault>,
    faults_rx: Receiver<SessionFault>,
    running: AtomicBool,
}

struct Machine {
    state: SessionState,
    connection: [ConnectionState; 2],
    outbound: Option<Outbound>,
    pending: Option<InboundRequest>,
    /// An accepted request is completing its handshake
    accepting: bool,
    active: Option<Active>,
    next_attempt: u64,
}

struct Outbound {
    attempt: u64,
    peer: Device,
    session_id: Uuid,
    switching: bool,
}

struct Active {
    session: Session,
    pipeline: AudioPipeline,
}

impl Active {
    /// Stop audio first so nothing is sent on a closing link
    fn teardown(mut self) {
        self.pipeline.stop();
        self.session.close();
    }
}

impl SessionManager {
    pub fn new(
        config: &AppConfig,
        transports: Transports,
        gate: Arc<CapabilityGate>,
        endpoints: AudioEndpoints,
    ) -> Self {
        let poll = config.session.poll_interval();
        let discovery = DiscoveryAggregator::new(transports.clone(), Arc::clone(&gate), poll);
        let (faults_tx, faults_rx) = unbounded();
        let talk = Arc::new(TalkSwitch::new(config.audio.push_to_talk));

        let initial = SessionSnapshot::new(
            SessionState::Idle,
            [ConnectionState::Disconnected; 2],
            false,
            talk.is_talking(),
        );

        Self {
            inner: Arc::new(Inner {
                config: config.session.clone(),
                audio: config.audio.clone(),
                gate,
                transports,
                discovery,
                endpoints,
                talk,
                machine: Mutex::new(Machine {
                    state: SessionState::Idle,
                    connection: [ConnectionState::Disconnected; 2],
                    outbound: None,
                    pending: None,
                    accepting: false,
                    active: None,
                    next_attempt: 0,
                }),
                snapshot: RwLock::new(Arc::new(initial)),
                events: Subscribers::new(),
                faults_tx,
                faults_rx,
                running: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start the fault supervisor and listen for inbound requests on every
    /// transport the gate allows. Idempotent.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut threads = self.threads.lock();

        let inner = Arc::clone(&self.inner);
        let supervisor = thread::Builder::new()
            .name("session-supervisor".into())
            .spawn(move || inner.supervise())
            .map_err(|e| {
                self.inner.running.store(false, Ordering::SeqCst);
                SessionError::Transport(e.into())
            })?;
        threads.push(supervisor);

        for transport in self.inner.transports.iter() {
            let kind = transport.kind();
            if let Err(denied) = self.inner.gate.check(OperationFamily::Accept, kind) {
                warn!("Not listening on {}: {}", kind, denied);
                continue;
            }
            let feed = match transport.listen() {
                Ok(feed) => feed,
                Err(e) => {
                    warn!("Not listening on {}: {}", kind, e);
                    continue;
                }
            };

            let inner = Arc::clone(&self.inner);
            match thread::Builder::new()
                .name(format!("listener-{}", kind))
                .spawn(move || inner.listen_loop(kind, feed))
            {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    error!("Failed to spawn {} listener: {}", kind, e);
                    transport.stop_listening();
                }
            }
        }

        info!("Session manager started");
        Ok(())
    }

    /// Tear everything down: discovery, the active session, any pending
    /// request, listeners and the supervisor. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.discovery.stop();
        self.inner.disconnect();
        let pending = self.inner.machine.lock().pending.take();
        if let Some(request) = pending {
            request.reject(Decision::Reject);
        }
        for transport in self.inner.transports.iter() {
            transport.stop_listening();
        }

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("Session thread panicked");
            }
        }
        info!("Session manager stopped");
    }

    /// Start discovery on both transports
    pub fn start_discovery(&self) -> Result<(), SessionError> {
        self.inner.start_discovery()
    }

    pub fn stop_discovery(&self) {
        self.inner.stop_discovery()
    }

    /// Connect to a discovered device. Cancels discovery before the
    /// transport is asked to connect.
    pub fn connect(&self, device: &Device) -> Result<Session, SessionError> {
        self.inner.connect(device)
    }

    /// Discover for `settle`, then connect to the strongest device found
    pub fn connect_strongest(&self, settle: Duration) -> Result<Session, SessionError> {
        self.inner.connect_strongest(settle)
    }

    pub fn accept_pending(&self) -> Result<Session, SessionError> {
        self.inner.accept_pending()
    }

    pub fn reject_pending(&self) -> Result<(), SessionError> {
        self.inner.reject_pending()
    }

    /// Close the active session and cancel any outbound attempt. A no-op
    /// when there is nothing to close.
    pub fn disconnect(&self) {
        self.inner.disconnect()
    }

    /// Move the active session to the other transport, keeping its id
    pub fn switch_transport(&self) -> Result<Session, SessionError> {
        self.inner.switch_transport()
    }

    /// Leave the error state
    pub fn acknowledge_error(&self) {
        self.inner.acknowledge_error()
    }

    /// Push-to-talk key state
    pub fn set_talking(&self, talking: bool) {
        self.inner.talk.set_talking(talking);
        let machine = self.inner.machine.lock();
        self.inner.publish(&machine);
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.inner.snapshot.read())
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state.clone()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.inner
            .machine
            .lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    /// Requester of the request awaiting a decision, if any
    pub fn pending_request(&self) -> Option<Device> {
        self.inner
            .machine
            .lock()
            .pending
            .as_ref()
            .map(|request| request.peer().clone())
    }

    pub fn roster(&self) -> Arc<[Device]> {
        self.inner.discovery.roster()
    }

    pub fn discovery(&self) -> &DiscoveryAggregator {
        &self.inner.discovery
    }

    pub fn subscribe(&self) -> (SubscriptionId, Receiver<SessionEvent>) {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn poll(&self) -> Duration {
        self.config.poll_interval()
    }

    fn publish(&self, machine: &Machine) {
        let snapshot = Arc::new(SessionSnapshot::new(
            machine.state.clone(),
            machine.connection,
            self.discovery.is_active(),
            self.talk.is_talking(),
        ));
        *self.snapshot.write() = Arc::clone(&snapshot);
        self.events.publish(SessionEvent::StateChanged(snapshot));
    }

    fn set_state(&self, machine: &mut Machine, state: SessionState) {
        if machine.state != state {
            info!("Session: {} -> {}", machine.state.name(), state.name());
        }
        machine.state = state;
    }

    /// Park in the error state and tell subscribers why
    fn fail_locked(&self, machine: &mut Machine, err: SessionError) -> SessionError {
        warn!("Session error: {}", err);
        self.set_state(machine, SessionState::Error { reason: err.clone() });
        self.publish(machine);
        self.events.publish(SessionEvent::Failed(err.clone()));
        err
    }

    /// Where the machine goes when a decision or attempt ends without a
    /// session
    fn resume_state(&self, machine: &Machine) -> SessionState {
        if let Some(outbound) = &machine.outbound {
            SessionState::AwaitingPeerResponse {
                peer: outbound.peer.clone(),
            }
        } else if self.discovery.is_active() {
            SessionState::Discovering
        } else {
            SessionState::Idle
        }
    }

    fn check_gate(&self, families: &[OperationFamily], kind: TransportKind) -> Result<(), SessionError> {
        for &family in families {
            self.gate
                .check(family, kind)
                .map_err(SessionError::PermissionDenied)?;
        }
        Ok(())
    }

    fn begin_outbound(&self, machine: &mut Machine, peer: Device, session_id: Uuid, switching: bool) -> u64 {
        machine.next_attempt += 1;
        let attempt = machine.next_attempt;
        machine.connection[peer.transport.index()] = ConnectionState::Connecting;
        machine.outbound = Some(Outbound {
            attempt,
            peer: peer.clone(),
            session_id,
            switching,
        });
        self.set_state(machine, SessionState::AwaitingPeerResponse { peer });
        attempt
    }

    fn supervise(&self) {
        debug!("Session supervisor started");
        while self.running.load(Ordering::Relaxed) {
            match self.faults_rx.recv_timeout(self.poll()) {
                Ok(fault) => self.on_fault(fault),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Session supervisor stopped");
    }

    fn on_fault(&self, fault: SessionFault) {
        let active = {
            let mut machine = self.machine.lock();
            let current = machine
                .active
                .as_ref()
                .is_some_and(|active| active.session.same(&fault.session));
            if !current {
                debug!("Ignoring fault from retired session {}", fault.session.id());
                return;
            }

            let active = machine.active.take();
            machine.connection[fault.session.transport().index()] = ConnectionState::Error;
            self.set_state(&mut machine, SessionState::Idle);
            self.publish(&machine);
            self.events
                .publish(SessionEvent::Failed(SessionError::Transport(fault.error)));
            active
        };

        if let Some(active) = active {
            active.teardown();
        }
    }

    fn listen_loop(&self, kind: TransportKind, feed: InboundFeed) {
        debug!("Listening for {} requests", kind);
        while self.running.load(Ordering::Relaxed) {
            match feed.next_timeout(self.poll()) {
                Next::Item(request) => self.on_inbound(request),
                Next::Pending => {}
                Next::Finished => {
                    debug!("{} listener closed", kind);
                    break;
                }
            }
        }
    }

    fn on_inbound(&self, request: InboundRequest) {
        let requester = request.peer().clone();
        let mut machine = self.machine.lock();

        let busy = machine.active.is_some()
            || matches!(machine.state, SessionState::SwitchingTransport { .. })
            || machine.outbound.as_ref().is_some_and(|o| o.switching);
        let reason = if busy {
            Some(AutoRejectReason::SessionActive)
        } else if machine.pending.is_some() || machine.accepting {
            Some(AutoRejectReason::RequestPending)
        } else {
            None
        };

        if let Some(reason) = reason {
            drop(machine);
            self.auto_reject(request, reason);
            return;
        }

        info!("Connection request from {}", requester);
        machine.pending = Some(request);
        self.set_state(
            &mut machine,
            SessionState::PendingInboundDecision {
                requester: requester.clone(),
            },
        );
        self.publish(&machine);
        self.events.publish(SessionEvent::IncomingRequest(requester));
    }

    fn auto_reject(&self, request: InboundRequest, reason: AutoRejectReason) {
        let requester = request.peer().clone();
        info!("Turning away {} ({:?})", requester, reason);
        request.reject(Decision::Busy);
        self.events
            .publish(SessionEvent::AutoRejected { requester, reason });
    }

    fn start_discovery(&self) -> Result<(), SessionError> {
        {
            let mut machine = self.machine.lock();
            if !machine.state.is_at_rest() {
                return Err(SessionError::InvalidState {
                    operation: "start discovery",
                    state: machine.state.to_string(),
                });
            }
            for kind in TransportKind::ALL {
                if let Err(err) = self.check_gate(&[OperationFamily::Discover], kind) {
                    return Err(self.fail_locked(&mut machine, err));
                }
            }
        }

        let started = self.discovery.start();

        let mut machine = self.machine.lock();
        match started {
            Ok(()) => {
                if machine.state.is_at_rest() {
                    self.set_state(&mut machine, SessionState::Discovering);
                }
                self.publish(&machine);
                Ok(())
            }
            Err(e) => Err(self.fail_locked(&mut machine, SessionError::Transport(e))),
        }
    }

    fn stop_discovery(&self) {
        self.discovery.stop();
        let mut machine = self.machine.lock();
        if machine.state == SessionState::Discovering {
            self.set_state(&mut machine, SessionState::Idle);
        }
        self.publish(&machine);
    }

    fn connect(&self, device: &Device) -> Result<Session, SessionError> {
        let kind = device.transport;
        let attempt = {
            let mut machine = self.machine.lock();
            if !machine.state.is_at_rest() {
                return Err(SessionError::InvalidState {
                    operation: "connect",
                    state: machine.state.to_string(),
                });
            }
            if let Err(err) = self.check_gate(&[OperationFamily::Connect, OperationFamily::Send], kind) {
                return Err(self.fail_locked(&mut machine, err));
            }
            let attempt = self.begin_outbound(&mut machine, device.clone(), Uuid::new_v4(), false);
            self.publish(&machine);
            attempt
        };

        info!("Connecting to {}", device);
        self.discovery.stop();
        let result = self.transports.get(kind).connect(&device.address);
        self.finish_outbound(attempt, result)
    }

    fn finish_outbound(
        &self,
        attempt: u64,
        result: Result<Box<dyn Link>, ConnectError>,
    ) -> Result<Session, SessionError> {
        let mut machine = self.machine.lock();
        let outbound = match machine.outbound.take() {
            Some(outbound) if outbound.attempt == attempt => outbound,
            other => {
                machine.outbound = other;
                drop(machine);
                if let Ok(link) = result {
                    link.close();
                }
                debug!("Outbound attempt {} superseded", attempt);
                return Err(SessionError::Superseded);
            }
        };
        let kind = outbound.peer.transport;

        let link = match result {
            Ok(link) => link,
            Err(ConnectError::Crossed) => {
                // The peer's simultaneous call won; its request arrives through the listener
                info!("{} is calling us, answering that call instead", outbound.peer);
                machine.connection[kind.index()] = ConnectionState::Disconnected;
                if machine.pending.is_none() && !machine.accepting {
                    let state = self.resume_state(&machine);
                    self.set_state(&mut machine, state);
                }
                self.publish(&machine);
                return Err(ConnectError::Crossed.into());
            }
            Err(e) => {
                machine.connection[kind.index()] = ConnectionState::Error;
                let err = SessionError::from(e);
                if machine.pending.is_some() || machine.accepting {
                    // The inbound request keeps the foreground
                    self.publish(&machine);
                    self.events.publish(SessionEvent::Failed(err.clone()));
                    return Err(err);
                }
                if outbound.switching {
                    warn!("Switchover to {} failed: {}", outbound.peer, err);
                    self.set_state(&mut machine, SessionState::Idle);
                    self.publish(&machine);
                    self.events.publish(SessionEvent::Failed(err.clone()));
                    return Err(err);
                }
                return Err(self.fail_locked(&mut machine, err));
            }
        };

        let session = Session::new(
            outbound.session_id,
            outbound.peer,
            Arc::from(link),
            self.faults_tx.clone(),
            self.audio.max_send_failures,
        );
        // An inbound request held meanwhile loses to the finished attempt
        let bumped = machine.pending.take();
        let committed = self.commit_locked(&mut machine, session.clone());
        drop(machine);

        if let Some(request) = bumped {
            self.auto_reject(request, AutoRejectReason::SessionActive);
        }
        if committed.is_err() {
            session.close();
        }
        committed.map(|()| session)
    }

    /// Start audio on a fresh session and make it the active one. On error
    /// the caller closes `session` once the lock is released.
    fn commit_locked(&self, machine: &mut Machine, session: Session) -> Result<(), SessionError> {
        let kind = session.transport();
        let pipeline = AudioPipeline::start(
            session.clone(),
            &self.endpoints,
            Arc::clone(&self.gate),
            Arc::clone(&self.talk),
            &self.audio,
            self.poll(),
        );

        match pipeline {
            Ok(pipeline) => {
                machine.connection[kind.index()] = ConnectionState::Connected;
                if machine.connection[kind.other().index()] == ConnectionState::Connected {
                    machine.connection[kind.other().index()] = ConnectionState::Disconnected;
                }
                machine.active = Some(Active {
                    session: session.clone(),
                    pipeline,
                });
                self.set_state(
                    machine,
                    SessionState::Connected {
                        session_id: session.id(),
                        peer: session.peer().clone(),
                    },
                );
                self.publish(machine);
                info!("Session {} connected to {} over {}", session.id(), session.peer(), kind);
                Ok(())
            }
            Err(e) => {
                machine.connection[kind.index()] = ConnectionState::Error;
                Err(self.fail_locked(machine, SessionError::Audio(e)))
            }
        }
    }

    fn connect_strongest(&self, settle: Duration) -> Result<Session, SessionError> {
        self.start_discovery()?;

        let deadline = Instant::now() + settle;
        loop {
            let now = Instant::now();
            if now >= deadline || !self.running.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(self.poll().min(deadline - now));
        }

        match self.discovery.strongest() {
            Some(device) => self.connect(&device),
            None => {
                self.stop_discovery();
                Err(SessionError::NoPeerFound)
            }
        }
    }

    fn accept_pending(&self) -> Result<Session, SessionError> {
        let request = {
            let mut machine = self.machine.lock();
            let Some(request) = machine.pending.take() else {
                return Err(SessionError::NoPendingRequest);
            };
            let kind = request.kind();
            if let Err(err) = self.check_gate(&[OperationFamily::Accept, OperationFamily::Send], kind) {
                let err = self.fail_locked(&mut machine, err);
                drop(machine);
                request.reject(Decision::Reject);
                return Err(err);
            }
            machine.accepting = true;
            machine.connection[kind.index()] = ConnectionState::Connecting;
            self.publish(&machine);
            request
        };

        let peer = request.peer().clone();
        let kind = request.kind();
        info!("Accepting {}", peer);
        let accepted = request.accept();

        let mut machine = self.machine.lock();
        machine.accepting = false;

        let link = match accepted {
            Ok(link) => link,
            Err(e) => {
                machine.connection[kind.index()] = ConnectionState::Error;
                let err = SessionError::Transport(e);
                if machine.outbound.is_some() {
                    let state = self.resume_state(&machine);
                    self.set_state(&mut machine, state);
                    self.publish(&machine);
                    self.events.publish(SessionEvent::Failed(err.clone()));
                    return Err(err);
                }
                return Err(self.fail_locked(&mut machine, err));
            }
        };

        if machine.active.is_some() {
            // An outbound attempt reached Connected first
            drop(machine);
            link.close();
            return Err(SessionError::Superseded);
        }
        if let Some(outbound) = machine.outbound.take() {
            debug!("Dropping outbound attempt to {} in favour of {}", outbound.peer, peer);
            machine.connection[outbound.peer.transport.index()] = ConnectionState::Disconnected;
        }

        let session = Session::new(
            Uuid::new_v4(),
            peer,
            Arc::from(link),
            self.faults_tx.clone(),
            self.audio.max_send_failures,
        );
        let committed = self.commit_locked(&mut machine, session.clone());
        drop(machine);
        if committed.is_err() {
            session.close();
        }
        committed.map(|()| session)
    }

    fn reject_pending(&self) -> Result<(), SessionError> {
        let request = {
            let mut machine = self.machine.lock();
            let Some(request) = machine.pending.take() else {
                return Err(SessionError::NoPendingRequest);
            };
            let state = self.resume_state(&machine);
            self.set_state(&mut machine, state);
            self.publish(&machine);
            request
        };

        info!("Rejecting {}", request.peer());
        request.reject(Decision::Reject);
        Ok(())
    }

    fn disconnect(&self) {
        let active = {
            let mut machine = self.machine.lock();
            if let Some(outbound) = machine.outbound.take() {
                info!("Cancelled connection attempt to {}", outbound.peer);
                machine.connection[outbound.peer.transport.index()] = ConnectionState::Disconnected;
            }
            let active = machine.active.take();
            if let Some(active) = &active {
                machine.connection[active.session.transport().index()] = ConnectionState::Disconnected;
            }
            if matches!(
                machine.state,
                SessionState::Connected { .. }
                    | SessionState::AwaitingPeerResponse { .. }
                    | SessionState::SwitchingTransport { .. }
            ) {
                self.set_state(&mut machine, SessionState::Idle);
            }
            self.publish(&machine);
            active
        };

        if let Some(active) = active {
            let id = active.session.id();
            active.teardown();
            info!("Session {} disconnected", id);
        }
    }

    fn switch_transport(&self) -> Result<Session, SessionError> {
        let (old, session_id, peer, to) = {
            let mut machine = self.machine.lock();
            if !machine.state.is_connected() {
                return Err(SessionError::InvalidState {
                    operation: "switch transport",
                    state: machine.state.to_string(),
                });
            }
            let Some(active) = machine.active.take() else {
                return Err(SessionError::NoActiveSession);
            };

            let from = active.session.transport();
            let to = from.other();
            let session_id = active.session.id();
            let peer = active.session.peer().clone();
            machine.connection[from.index()] = ConnectionState::Disconnected;

            if let Err(err) = self.check_gate(&[OperationFamily::Connect, OperationFamily::Send], to) {
                let err = self.fail_locked(&mut machine, err);
                drop(machine);
                active.teardown();
                return Err(err);
            }

            self.set_state(&mut machine, SessionState::SwitchingTransport { session_id, from, to });
            self.publish(&machine);
            (active, session_id, peer, to)
        };

        info!("Switching session {} with {} to {}", session_id, peer, to);
        old.teardown();

        let Some(target) = self.find_switch_target(&peer, to) else {
            let err = SessionError::NoSwitchTarget(to);
            let mut machine = self.machine.lock();
            if matches!(machine.state, SessionState::SwitchingTransport { .. }) {
                self.set_state(&mut machine, SessionState::Idle);
            }
            self.publish(&machine);
            self.events.publish(SessionEvent::Failed(err.clone()));
            return Err(err);
        };

        let attempt = {
            let mut machine = self.machine.lock();
            let still_switching = matches!(
                machine.state,
                SessionState::SwitchingTransport { session_id: id, .. } if id == session_id
            );
            if !still_switching {
                return Err(SessionError::Superseded);
            }
            let attempt = self.begin_outbound(&mut machine, target.clone(), session_id, true);
            self.publish(&machine);
            attempt
        };

        self.discovery.stop();
        let result = self.transports.get(to).connect(&target.address);
        self.finish_outbound(attempt, result)
    }

    /// Look for `peer` by name on `kind`: first in the current roster, then
    /// by discovering on that transport alone until the switch timeout
    fn find_switch_target(&self, peer: &Device, kind: TransportKind) -> Option<Device> {
        if peer.name == UNKNOWN_DEVICE_NAME {
            warn!("Cannot find an unnamed peer on {}", kind);
            return None;
        }
        if let Some(found) = self.discovery.find_by_name(kind, &peer.name) {
            return Some(found);
        }

        let (id, events) = self.discovery.subscribe();
        let found = match self.discovery.start_on(&[kind]) {
            Ok(()) => {
                let deadline = Instant::now() + self.config.switch_discovery_timeout();
                let mut found = self.discovery.find_by_name(kind, &peer.name);
                while found.is_none() && self.running.load(Ordering::Relaxed) {
                    match events.recv_deadline(deadline) {
                        Ok(DiscoveryEvent::Roster(devices)) => {
                            found = devices
                                .iter()
                                .find(|d| d.transport == kind && d.name == peer.name)
                                .cloned();
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                found
            }
            Err(e) => {
                warn!("Cannot search {} for {}: {}", kind, peer, e);
                None
            }
        };
        self.discovery.unsubscribe(id);
        self.discovery.stop();
        found
    }

    fn acknowledge_error(&self) {
        let mut machine = self.machine.lock();
        if matches!(machine.state, SessionState::Error { .. }) {
            let state = self.resume_state(&machine);
            self.set_state(&mut machine, state);
            self.publish(&machine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureSource, NullSink};
    use crate::capability::Permission;
    use crate::config::{NetworkConfig, StreamConfig};
    use crate::error::{AudioError, TransportError};
    use crate::transport::mock::{ConnectScript, MockTransport};
    use crate::transport::{DatagramTransport, StreamTransport, TcpRadio, Transport};
    use std::io;

    struct Fixture {
        manager: SessionManager,
        bluetooth: Arc<MockTransport>,
        network: Arc<MockTransport>,
        gate: Arc<CapabilityGate>,
        events: Receiver<SessionEvent>,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.session.poll_interval_ms = 10;
        config.session.switch_discovery_secs = 1;
        config.audio.chunk_size = 8;
        config.audio.max_send_failures = 3;
        config
    }

    fn fixture_with(endpoints: AudioEndpoints) -> Fixture {
        let bluetooth = Arc::new(MockTransport::new(TransportKind::Bluetooth));
        let network = Arc::new(MockTransport::new(TransportKind::NetworkP2P));
        let gate = Arc::new(CapabilityGate::all_granted());
        let manager = SessionManager::new(
            &test_config(),
            Transports::new(bluetooth.clone(), network.clone()),
            Arc::clone(&gate),
            endpoints,
        );
        let (_, events) = manager.subscribe();
        manager.start().unwrap();
        Fixture {
            manager,
            bluetooth,
            network,
            gate,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AudioEndpoints::silent(Duration::from_millis(5)))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Produces a chunk every few milliseconds
    struct TickingSource;

    impl CaptureSource for TickingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(2));
            buf.fill(1);
            Ok(buf.len())
        }
    }

    fn loopback_network(probe_targets: Vec<String>) -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            udp_port: 0,
            probe_targets,
            probe_interval_ms: 100,
            poll_interval_ms: 10,
            connect_timeout_ms: 2000,
            inbound_queue: 16,
        }
    }

    fn loopback_stream(name: &str) -> StreamConfig {
        let reserve = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen_address = reserve.local_addr().unwrap().to_string();
        drop(reserve);
        StreamConfig {
            local_name: name.to_string(),
            listen_address,
            connect_timeout_ms: 2000,
            handshake_timeout_ms: 1000,
            poll_interval_ms: 10,
            ..StreamConfig::default()
        }
    }

    /// Manager on a real loopback datagram transport; Bluetooth is mocked
    fn datagram_manager(name: &str) -> (SessionManager, String) {
        let network = DatagramTransport::bind(loopback_network(Vec::new()), name).unwrap();
        let address = network.local_addr().unwrap().to_string();
        let manager = SessionManager::new(
            &test_config(),
            Transports::new(
                Arc::new(MockTransport::new(TransportKind::Bluetooth)),
                Arc::new(network),
            ),
            Arc::new(CapabilityGate::all_granted()),
            AudioEndpoints::silent(Duration::from_millis(5)),
        );
        manager.start().unwrap();
        (manager, address)
    }

    fn wait_request(feed: &InboundFeed) -> InboundRequest {
        match feed.next_timeout(Duration::from_secs(3)) {
            Next::Item(request) => request,
            _ => panic!("no inbound request"),
        }
    }

    fn caller(name: &str) -> Device {
        Device::bluetooth(Some(name), format!("{}-addr", name))
    }

    #[test]
    fn test_inbound_request_while_idle_waits_for_decision() {
        let fx = fixture();
        let _remote = fx.bluetooth.inbound_from(caller("Alice")).unwrap();

        assert!(wait_until(|| fx.manager.pending_request().is_some()));
        match fx.manager.state() {
            SessionState::PendingInboundDecision { requester } => assert_eq!(requester.name, "Alice"),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(fx
            .events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::IncomingRequest(ref d) if d.name == "Alice")));
    }

    #[test]
    fn test_accept_pending_connects_and_answers() {
        let fx = fixture();
        let remote = fx.bluetooth.inbound_from(caller("Alice")).unwrap();
        assert!(wait_until(|| fx.manager.pending_request().is_some()));

        let session = fx.manager.accept_pending().unwrap();
        assert_eq!(remote.decision(), Some(Decision::Accept));
        assert_eq!(session.peer().name, "Alice");

        let snapshot = fx.manager.snapshot();
        assert!(snapshot.state.is_connected());
        assert_eq!(snapshot.connection(TransportKind::Bluetooth), ConnectionState::Connected);
        assert_eq!(snapshot.connection(TransportKind::NetworkP2P), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reject_pending_closes_request_and_returns_to_idle() {
        let fx = fixture();
        let remote = fx.bluetooth.inbound_from(caller("Alice")).unwrap();
        assert!(wait_until(|| fx.manager.pending_request().is_some()));

        fx.manager.reject_pending().unwrap();
        assert_eq!(remote.decision(), Some(Decision::Reject));
        assert_eq!(fx.manager.state(), SessionState::Idle);
        assert_eq!(fx.manager.reject_pending(), Err(SessionError::NoPendingRequest));
    }

    #[test]
    fn test_inbound_while_connected_is_auto_rejected() {
        let fx = fixture();
        let peer = Device::network(Some("Pixel"), "10.0.0.2:8888");
        let session = fx.manager.connect(&peer).unwrap();

        let intruder = fx.bluetooth.inbound_from(caller("Bob")).unwrap();
        assert!(wait_until(|| intruder.decision().is_some()));
        assert_eq!(intruder.decision(), Some(Decision::Busy));

        match fx.manager.state() {
            SessionState::Connected { session_id, .. } => assert_eq!(session_id, session.id()),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(fx.events.try_iter().any(|e| matches!(
            e,
            SessionEvent::AutoRejected {
                reason: AutoRejectReason::SessionActive,
                ..
            }
        )));
    }

    #[test]
    fn test_second_inbound_while_pending_is_auto_rejected() {
        let fx = fixture();
        let _first = fx.bluetooth.inbound_from(caller("Alice")).unwrap();
        assert!(wait_until(|| fx.manager.pending_request().is_some()));

        let second = fx.network.inbound_from(Device::network(Some("Bob"), "10.0.0.9:8888")).unwrap();
        assert!(wait_until(|| second.decision().is_some()));
        assert_eq!(second.decision(), Some(Decision::Busy));
        assert_eq!(fx.manager.pending_request().unwrap().name, "Alice");
    }

    #[test]
    fn test_connect_cancels_discovery_first() {
        let fx = fixture();
        fx.manager.start_discovery().unwrap();
        assert_eq!(fx.manager.state(), SessionState::Discovering);
        assert!(fx.bluetooth.is_scanning());

        fx.manager.connect(&caller("Pixel")).unwrap();
        assert_eq!(*fx.bluetooth.scanning_at_connect.lock(), vec![false]);
        assert!(!fx.manager.snapshot().discovering);
    }

    #[test]
    fn test_connect_failure_parks_in_error_until_acknowledged() {
        let fx = fixture();
        fx.network.script(ConnectScript::Fail(ConnectError::Timeout));

        let err = fx
            .manager
            .connect(&Device::network(Some("Pixel"), "10.0.0.2:8888"))
            .unwrap_err();
        assert_eq!(err, SessionError::from(ConnectError::Timeout));

        let snapshot = fx.manager.snapshot();
        assert!(matches!(snapshot.state, SessionState::Error { .. }));
        assert_eq!(snapshot.connection(TransportKind::NetworkP2P), ConnectionState::Error);

        fx.manager.acknowledge_error();
        assert_eq!(fx.manager.state(), SessionState::Idle);
    }

    #[test]
    fn test_permission_denied_makes_no_transport_calls() {
        let fx = fixture();
        let listens = fx.bluetooth.calls.radio_calls();

        fx.gate.revoke(Permission::BluetoothConnect);
        let err = fx.manager.connect(&caller("Pixel")).unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(fx.bluetooth.calls.connect.load(Ordering::SeqCst), 0);
        assert!(matches!(fx.manager.state(), SessionState::Error { .. }));

        fx.gate.revoke(Permission::NearbyDevices);
        let err = fx.manager.start_discovery().unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(fx.bluetooth.calls.radio_calls(), listens);
        assert_eq!(fx.network.calls.discover.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_without_record_audio_is_denied() {
        let fx = fixture();
        fx.gate.revoke(Permission::RecordAudio);
        let err = fx.manager.connect(&caller("Pixel")).unwrap_err();
        assert!(err.is_permission_denied());
        assert_eq!(fx.bluetooth.calls.connect.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fault_resets_to_idle_with_failure_event() {
        let fx = fixture();
        fx.manager
            .connect(&Device::network(Some("Pixel"), "10.0.0.2:8888"))
            .unwrap();
        fx.network.last_remote().unwrap().close();

        assert!(wait_until(|| fx.manager.state() == SessionState::Idle));
        assert!(fx.manager.active_session().is_none());
        assert_eq!(
            fx.manager.snapshot().connection(TransportKind::NetworkP2P),
            ConnectionState::Error
        );
        assert!(fx
            .events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::Failed(SessionError::Transport(_)))));
    }

    #[test]
    fn test_disconnect_closes_link() {
        let fx = fixture();
        fx.manager.connect(&caller("Pixel")).unwrap();
        let local = fx.bluetooth.last_local().unwrap();

        fx.manager.disconnect();
        assert!(local.is_closed());
        assert_eq!(fx.manager.state(), SessionState::Idle);
        assert_eq!(
            fx.manager.snapshot().connection(TransportKind::Bluetooth),
            ConnectionState::Disconnected
        );

        // Nothing left to close
        fx.manager.disconnect();
        assert_eq!(fx.manager.state(), SessionState::Idle);
    }

    #[test]
    fn test_switchover_closes_old_link_before_connecting_new() {
        let fx = fixture_with(AudioEndpoints::new(TickingSource, NullSink));

        fx.manager.start_discovery().unwrap();
        assert!(fx.bluetooth.found(Device::bluetooth(Some("Pixel"), "AA:BB")));
        assert!(fx.network.found(Device::network(Some("Pixel"), "10.0.0.2:8888")));
        assert!(wait_until(|| fx.manager.roster().len() == 2));

        let bt_peer = fx
            .manager
            .roster()
            .iter()
            .find(|d| d.transport == TransportKind::Bluetooth)
            .cloned()
            .unwrap();
        let original = fx.manager.connect(&bt_peer).unwrap();
        let old_link = fx.bluetooth.last_local().unwrap();
        assert!(wait_until(|| old_link.sent() > 0));

        let seen = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            let old_link = Arc::clone(&old_link);
            *fx.network.on_connect.lock() = Some(Box::new(move || {
                *seen.lock() = Some((old_link.is_closed(), old_link.sent()));
            }));
        }

        let switched = fx.manager.switch_transport().unwrap();
        assert_eq!(switched.id(), original.id());
        assert_eq!(switched.transport(), TransportKind::NetworkP2P);

        let recorded = *seen.lock();
        let (closed_before_connect, sent_at_connect) = recorded.unwrap();
        assert!(closed_before_connect);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(old_link.sent(), sent_at_connect);

        let snapshot = fx.manager.snapshot();
        assert_eq!(snapshot.connection(TransportKind::NetworkP2P), ConnectionState::Connected);
        assert_eq!(snapshot.connection(TransportKind::Bluetooth), ConnectionState::Disconnected);
        assert!(original.is_closed());
    }

    #[test]
    fn test_switchover_searches_other_transport() {
        let fx = fixture();
        fx.manager.connect(&caller("Pixel")).unwrap();

        let network = Arc::clone(&fx.network);
        let reporter = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !network.is_scanning() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            network.found(Device::network(Some("Pixel"), "10.0.0.2:8888"))
        });

        let switched = fx.manager.switch_transport().unwrap();
        assert!(reporter.join().unwrap());
        assert_eq!(switched.peer().address, "10.0.0.2:8888");
        assert!(!fx.manager.discovery().is_active());
    }

    #[test]
    fn test_switchover_without_target_goes_idle() {
        let fx = fixture();
        fx.manager.connect(&caller("Solo")).unwrap();
        let old_link = fx.bluetooth.last_local().unwrap();

        let err = fx.manager.switch_transport().unwrap_err();
        assert_eq!(err, SessionError::NoSwitchTarget(TransportKind::NetworkP2P));
        assert!(old_link.is_closed());
        assert_eq!(fx.manager.state(), SessionState::Idle);
        assert_eq!(fx.network.calls.connect.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_switch_requires_connection() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.switch_transport(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_finished_outbound_beats_pending_inbound() {
        let fx = fixture();
        let (release, hold) = unbounded();
        fx.network.script(ConnectScript::Hold(hold));

        let manager = Arc::new(fx.manager);
        let connecting = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.connect(&Device::network(Some("Pixel"), "10.0.0.2:8888")))
        };
        assert!(wait_until(|| matches!(
            manager.state(),
            SessionState::AwaitingPeerResponse { .. }
        )));

        let inbound = fx.bluetooth.inbound_from(caller("Alice")).unwrap();
        assert!(wait_until(|| manager.pending_request().is_some()));

        release.send(()).unwrap();
        let session = connecting.join().unwrap().unwrap();
        assert_eq!(session.transport(), TransportKind::NetworkP2P);
        assert_eq!(inbound.decision(), Some(Decision::Busy));
        assert!(manager.state().is_connected());
    }

    #[test]
    fn test_accept_cancels_outbound_attempt() {
        let fx = fixture();
        let (release, hold) = unbounded();
        fx.network.script(ConnectScript::Hold(hold));

        let manager = Arc::new(fx.manager);
        let connecting = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.connect(&Device::network(Some("Pixel"), "10.0.0.2:8888")))
        };
        assert!(wait_until(|| matches!(
            manager.state(),
            SessionState::AwaitingPeerResponse { .. }
        )));

        let _inbound = fx.bluetooth.inbound_from(caller("Alice")).unwrap();
        assert!(wait_until(|| manager.pending_request().is_some()));
        let accepted = manager.accept_pending().unwrap();
        assert_eq!(accepted.transport(), TransportKind::Bluetooth);

        release.send(()).unwrap();
        assert_eq!(connecting.join().unwrap().unwrap_err(), SessionError::Superseded);
        assert!(fx.network.last_local().unwrap().is_closed());
        assert_eq!(manager.active_session().unwrap().id(), accepted.id());
    }

    #[test]
    fn test_failed_commit_closes_link() {
        let fx = fixture();
        {
            let gate = Arc::clone(&fx.gate);
            *fx.network.on_connect.lock() = Some(Box::new(move || {
                gate.revoke(Permission::RecordAudio);
            }));
        }

        let err = fx
            .manager
            .connect(&Device::network(Some("Pixel"), "10.0.0.2:8888"))
            .unwrap_err();
        assert!(matches!(err, SessionError::Audio(AudioError::PermissionDenied(_))));
        assert!(fx.network.last_local().unwrap().is_closed());
        assert!(matches!(fx.manager.state(), SessionState::Error { .. }));
        assert_eq!(
            fx.manager.snapshot().connection(TransportKind::NetworkP2P),
            ConnectionState::Error
        );
    }

    #[test]
    fn test_crossed_calls_end_with_one_session() {
        let (alpha, alpha_addr) = datagram_manager("Alpha");
        let (bravo, bravo_addr) = datagram_manager("Bravo");

        let (from_alpha, from_bravo) = thread::scope(|s| {
            let calling_bravo = s.spawn(|| alpha.connect(&Device::network(Some("Bravo"), bravo_addr.as_str())));
            let calling_alpha = s.spawn(|| bravo.connect(&Device::network(Some("Alpha"), alpha_addr.as_str())));

            assert!(wait_until(|| {
                alpha.pending_request().is_some() || bravo.pending_request().is_some()
            }));
            let answering = if alpha.pending_request().is_some() { &alpha } else { &bravo };
            answering.accept_pending().unwrap();
            (calling_bravo.join().unwrap(), calling_alpha.join().unwrap())
        });

        // Exactly one call went through; the other side answered it
        let gave_way = |result: &Result<Session, SessionError>| {
            matches!(
                result,
                Err(SessionError::Transport(TransportError::Connect(ConnectError::Crossed)))
                    | Err(SessionError::Superseded)
                    | Err(SessionError::InvalidState { .. })
            )
        };
        assert!(
            (from_alpha.is_ok() && gave_way(&from_bravo)) || (from_bravo.is_ok() && gave_way(&from_alpha)),
            "alpha: {:?}, bravo: {:?}",
            from_alpha.as_ref().map(|s| s.id()),
            from_bravo.as_ref().map(|s| s.id())
        );
        assert!(alpha.state().is_connected());
        assert!(bravo.state().is_connected());
        assert_eq!(alpha.active_session().unwrap().peer().name, "Bravo");
        assert_eq!(bravo.active_session().unwrap().peer().name, "Alpha");
    }

    #[test]
    fn test_switchover_finds_peer_by_announced_name() {
        // The far end: plain transports announcing themselves as Bravo
        let peer_network = DatagramTransport::bind(loopback_network(Vec::new()), "Bravo").unwrap();
        let peer_network_addr = peer_network.local_addr().unwrap();
        let peer_network_feed = peer_network.listen().unwrap();
        let peer_stream_config = loopback_stream("Bravo");
        let peer_stream_addr = peer_stream_config.listen_address.clone();
        let peer_stream = StreamTransport::new(
            TcpRadio::new(&peer_stream_config),
            peer_stream_config,
            8,
        );
        let peer_stream_feed = peer_stream.listen().unwrap();

        let mut config = test_config();
        config.network = loopback_network(vec![peer_network_addr.to_string()]);
        config.stream = loopback_stream("Alpha");
        let network = DatagramTransport::bind(config.network.clone(), &config.stream.local_name).unwrap();
        let bluetooth = StreamTransport::new(TcpRadio::new(&config.stream), config.stream.clone(), 8);
        let manager = SessionManager::new(
            &config,
            Transports::new(Arc::new(bluetooth), Arc::new(network)),
            Arc::new(CapabilityGate::all_granted()),
            AudioEndpoints::silent(Duration::from_millis(5)),
        );
        manager.start().unwrap();

        let bravo = Device::bluetooth(Some("Bravo"), peer_stream_addr.as_str());
        let (original, _peer_stream_link) = thread::scope(|s| {
            let calling = s.spawn(|| manager.connect(&bravo));
            let link = wait_request(&peer_stream_feed).accept().unwrap();
            (calling.join().unwrap().unwrap(), link)
        });

        let (switched, _peer_network_link) = thread::scope(|s| {
            let switching = s.spawn(|| manager.switch_transport());
            let request = wait_request(&peer_network_feed);
            assert_eq!(request.peer().name, "Alpha");
            let link = request.accept().unwrap();
            (switching.join().unwrap().unwrap(), link)
        });

        assert_eq!(switched.id(), original.id());
        assert_eq!(switched.transport(), TransportKind::NetworkP2P);
        assert_eq!(switched.peer().name, "Bravo");
        assert_eq!(switched.peer().address, peer_network_addr.to_string());
        assert!(original.is_closed());
        manager.shutdown();
    }

    #[test]
    fn test_connect_strongest_picks_best_signal() {
        let fx = fixture();
        let bluetooth = Arc::clone(&fx.bluetooth);
        let network = Arc::clone(&fx.network);
        let reporter = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !(bluetooth.is_scanning() && network.is_scanning()) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            bluetooth.found(Device::bluetooth(Some("Far"), "AA:01").with_signal(-80));
            network.found(Device::network(Some("Near"), "10.0.0.3:8888").with_signal(-40));
        });

        let session = fx.manager.connect_strongest(Duration::from_millis(200)).unwrap();
        reporter.join().unwrap();
        assert_eq!(session.peer().name, "Near");
    }

    #[test]
    fn test_connect_strongest_with_no_peers() {
        let fx = fixture();
        assert_eq!(
            fx.manager.connect_strongest(Duration::from_millis(30)).unwrap_err(),
            SessionError::NoPeerFound
        );
        assert_eq!(fx.manager.state(), SessionState::Idle);
    }

    #[test]
    fn test_set_talking_publishes_snapshot() {
        let fx = fixture();
        fx.manager.set_talking(true);
        assert!(fx.manager.snapshot().talking);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let fx = fixture();
        fx.manager.connect(&caller("Pixel")).unwrap();
        let local = fx.bluetooth.last_local().unwrap();
        fx.manager.shutdown();
        fx.manager.shutdown();
        assert!(local.is_closed());
    }
}
