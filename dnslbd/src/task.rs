//! The unit of work moving through the pipeline.
//!
//! A task is owned by whichever queue or table currently holds it;
//! hand-offs between stages are moves. Its `FlightGuard` ties the task's
//! lifetime to the owning context's in-flight count.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;

use crate::sockets::{ForwarderSocket, FrontendSocket};

const NO_PEER: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A client query or its reply.
    Regular,
    /// A synthetic liveness probe or its reply.
    Watchdog,
}

/// RAII share of a context's in-flight count.
///
/// Every task holds exactly one, so dropping a task on any path (error,
/// delivery, eviction) gives the count back exactly once.
pub struct FlightGuard {
    counter: Arc<AtomicI64>,
}

impl FlightGuard {
    pub fn new(counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Task {
    /// Wire bytes. For a tracked query this is the packet as sent upstream;
    /// in the reply queue it holds the outbound response with the client's
    /// original transaction id restored.
    pub buf: BytesMut,
    /// Client peer address.
    pub peer: SocketAddr,
    pub kind: TaskKind,
    /// Address of the frontend the query arrived on, kept separately so a
    /// redirected reply can find the matching socket in another context.
    pub orig_fe_addr: SocketAddr,
    pub orig_fe_sk: Weak<FrontendSocket>,
    pub fwd_sk: Option<Arc<ForwarderSocket>>,
    pub fingerprint: u64,
    pub orig_id: u16,
    /// Context epoch at tracking-insert time.
    pub epoch: u64,
    pub redirected: bool,
    flight: FlightGuard,
}

impl Task {
    /// Freshly accepted client query.
    pub fn regular(
        buf: BytesMut,
        peer: SocketAddr,
        origin: &Arc<FrontendSocket>,
        flight: FlightGuard,
    ) -> Self {
        Self {
            buf,
            peer,
            kind: TaskKind::Regular,
            orig_fe_addr: origin.frontend.addr(),
            orig_fe_sk: Arc::downgrade(origin),
            fwd_sk: None,
            fingerprint: 0,
            orig_id: 0,
            epoch: 0,
            redirected: false,
            flight,
        }
    }

    /// Datagram received from a forwarder, not yet correlated.
    pub fn reply(buf: BytesMut, from: &Arc<ForwarderSocket>, flight: FlightGuard) -> Self {
        Self {
            buf,
            peer: NO_PEER,
            kind: TaskKind::Regular,
            orig_fe_addr: NO_PEER,
            orig_fe_sk: Weak::new(),
            fwd_sk: Some(Arc::clone(from)),
            fingerprint: 0,
            orig_id: 0,
            epoch: 0,
            redirected: false,
            flight,
        }
    }

    /// Synthetic watchdog probe aimed at one forwarder.
    pub fn probe(buf: BytesMut, target: &Arc<ForwarderSocket>, flight: FlightGuard) -> Self {
        Self {
            buf,
            peer: NO_PEER,
            kind: TaskKind::Watchdog,
            orig_fe_addr: NO_PEER,
            orig_fe_sk: Weak::new(),
            fwd_sk: Some(Arc::clone(target)),
            fingerprint: 0,
            orig_id: 0,
            epoch: 0,
            redirected: false,
            flight,
        }
    }

    /// Hand the in-flight share to another context (reload hand-off). The
    /// caller constructs the successor's guard first, so the successor is
    /// incremented before the predecessor's share drops here.
    pub fn retarget(&mut self, flight: FlightGuard) {
        self.flight = flight;
    }
}

#[cfg(test)]
impl Task {
    /// Bare task for table and queue tests.
    pub fn synthetic(fingerprint: u64, epoch: u64, counter: Arc<AtomicI64>) -> Self {
        Self {
            buf: BytesMut::new(),
            peer: NO_PEER,
            kind: TaskKind::Regular,
            orig_fe_addr: NO_PEER,
            orig_fe_sk: Weak::new(),
            fwd_sk: None,
            fingerprint,
            orig_id: 0,
            epoch,
            redirected: false,
            flight: FlightGuard::new(counter),
        }
    }
}
