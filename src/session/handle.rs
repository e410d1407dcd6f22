//! Active session handle
//!
//! A [`Session`] wraps one live [`Link`] plus the bookkeeping the audio
//! loops need. Clones share the same link. Send failures are tolerated up
//! to a threshold; past it, and on any receive failure, the session raises
//! a [`SessionFault`] on the manager's fault channel exactly once.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::device::{Device, TransportKind};
use crate::error::TransportError;
use crate::transport::Link;

/// A session reporting that its channel is no longer usable
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub session: Session,
    pub error: TransportError,
}

/// Traffic counters for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    /// Captured chunks dropped because the send queue was full
    pub queue_overflows: u64,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: Uuid,
    peer: Device,
    link: Arc<dyn Link>,
    faults: Sender<SessionFault>,
    max_send_failures: u32,
    consecutive_failures: AtomicU32,
    closed: AtomicBool,
    faulted: AtomicBool,
    started_at: DateTime<Utc>,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
    chunks_received: AtomicU64,
    bytes_received: AtomicU64,
    send_failures: AtomicU64,
    queue_overflows: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        id: Uuid,
        peer: Device,
        link: Arc<dyn Link>,
        faults: Sender<SessionFault>,
        max_send_failures: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                peer,
                link,
                faults,
                max_send_failures: max_send_failures.max(1),
                consecutive_failures: AtomicU32::new(0),
                closed: AtomicBool::new(false),
                faulted: AtomicBool::new(false),
                started_at: Utc::now(),
                chunks_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                chunks_received: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                send_failures: AtomicU64::new(0),
                queue_overflows: AtomicU64::new(0),
            }),
        }
    }

    /// Stable identity; survives a transport switchover
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer(&self) -> &Device {
        &self.inner.peer
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.peer.transport
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Whether two handles refer to the same underlying session, as opposed
    /// to a successor that kept the id across a switchover
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fire-and-forget send. Failures are counted; once
    /// `max_send_failures` happen in a row the session faults.
    pub fn send(&self, chunk: &[u8]) {
        if self.is_closed() {
            return;
        }

        match self.inner.link.send(chunk) {
            Ok(()) => {
                self.inner.consecutive_failures.store(0, Ordering::Relaxed);
                self.inner.chunks_sent.fetch_add(1, Ordering::Relaxed);
                self.inner.bytes_sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.inner.send_failures.fetch_add(1, Ordering::Relaxed);
                let failures = self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Send to {} failed ({} in a row): {}", self.inner.peer, failures, e);

                let fatal = matches!(e, TransportError::PeerClosed | TransportError::Closed);
                if fatal || failures >= self.inner.max_send_failures {
                    self.fail(e);
                }
            }
        }
    }

    /// Wait up to `timeout` for the next chunk. An error means the channel
    /// is gone and has already been reported as a fault.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        match self.inner.link.receive(timeout) {
            Ok(Some(chunk)) => {
                self.inner.chunks_received.fetch_add(1, Ordering::Relaxed);
                self.inner.bytes_received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Ok(Some(chunk))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    pub(crate) fn record_overflow(&self) {
        self.inner.queue_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Report the session as broken. Only the first report counts, and a
    /// session closed on purpose never reports.
    pub(crate) fn fail(&self, error: TransportError) {
        if self.is_closed() || self.inner.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("Session {} with {} failed: {}", self.inner.id, self.inner.peer, error);
        let fault = SessionFault {
            session: self.clone(),
            error,
        };
        if self.inner.faults.send(fault).is_err() {
            debug!("No supervisor for session {}", self.inner.id);
        }
    }

    /// Close the underlying link. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.link.close();
            debug!("Session {} with {} closed", self.inner.id, self.inner.peer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            chunks_sent: self.inner.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            chunks_received: self.inner.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            send_failures: self.inner.send_failures.load(Ordering::Relaxed),
            queue_overflows: self.inner.queue_overflows.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{link_pair, Delivery, MemoryLink, SharedLink};
    use crossbeam_channel::{unbounded, Receiver};

    fn session_over(delivery: Delivery, max_failures: u32) -> (Session, Arc<MemoryLink>, MemoryLink, Receiver<SessionFault>) {
        let (ours, theirs) = link_pair(
            Device::network(Some("me"), "10.0.0.1:8888"),
            Device::network(Some("peer"), "10.0.0.2:8888"),
            delivery,
        );
        let ours = Arc::new(ours);
        let (tx, rx) = unbounded();
        let session = Session::new(
            Uuid::new_v4(),
            ours.peer().clone(),
            Arc::new(SharedLink(Arc::clone(&ours))),
            tx,
            max_failures,
        );
        (session, ours, theirs, rx)
    }

    #[test]
    fn test_send_and_receive_update_stats() {
        let (session, _ours, theirs, _faults) = session_over(Delivery::Reliable, 3);
        session.send(&[1u8; 100]);
        assert_eq!(theirs.receive(Duration::from_millis(100)).unwrap().unwrap().len(), 100);

        theirs.send(&[2u8; 50]).unwrap();
        assert!(session.receive(Duration::from_millis(100)).unwrap().is_some());

        let stats = session.stats();
        assert_eq!(stats.chunks_sent, 1);
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.chunks_received, 1);
        assert_eq!(stats.bytes_received, 50);
    }

    #[test]
    fn test_consecutive_send_failures_fault_once() {
        let (session, ours, _theirs, faults) = session_over(Delivery::Reliable, 3);
        ours.fail_sends.store(true, Ordering::SeqCst);

        session.send(b"a");
        session.send(b"b");
        assert!(faults.try_recv().is_err());
        session.send(b"c");
        session.send(b"d");

        let fault = faults.try_recv().unwrap();
        assert!(fault.session.same(&session));
        assert!(matches!(fault.error, TransportError::SendFailed(_)));
        assert!(faults.try_recv().is_err());
        assert_eq!(session.stats().send_failures, 4);
    }

    #[test]
    fn test_success_resets_failure_run() {
        let (session, ours, _theirs, faults) = session_over(Delivery::Reliable, 2);
        ours.fail_sends.store(true, Ordering::SeqCst);
        session.send(b"a");
        ours.fail_sends.store(false, Ordering::SeqCst);
        session.send(b"b");
        ours.fail_sends.store(true, Ordering::SeqCst);
        session.send(b"c");
        assert!(faults.try_recv().is_err());
    }

    #[test]
    fn test_peer_close_faults_on_receive() {
        let (session, _ours, theirs, faults) = session_over(Delivery::Reliable, 3);
        theirs.close();
        assert_eq!(
            session.receive(Duration::from_millis(50)),
            Err(TransportError::PeerClosed)
        );
        assert!(faults.try_recv().is_ok());
    }

    #[test]
    fn test_close_is_idempotent_and_silent() {
        let (session, ours, _theirs, faults) = session_over(Delivery::Reliable, 3);
        session.close();
        session.close();
        assert!(ours.is_closed());

        let before = ours.sent();
        session.send(b"late");
        assert_eq!(ours.sent(), before);
        assert_eq!(session.receive(Duration::from_millis(10)), Err(TransportError::Closed));
        assert!(faults.try_recv().is_err());
    }
}
