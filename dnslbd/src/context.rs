//! Process-wide runtime state for one generation of the daemon.
//!
//! A context owns its forwarders, frontends and workers. During a hot
//! reload two contexts overlap: the successor serves new traffic while the
//! predecessor drains, routing late replies through the successor's
//! workers so clients still get their answers.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::queue::SharedQueue;
use crate::sockets::{self, Frontend, FrontendSocket};
use crate::task::FlightGuard;
use crate::upstream::{Forwarder, Policy};
use crate::worker::Worker;

/// Public queue handles of one worker, reachable from sibling workers and
/// from a predecessor context during reload.
pub struct WorkerHandle {
    pub rep: Arc<SharedQueue>,
    pub wdt_rep: Arc<SharedQueue>,
}

pub struct Context {
    pub max_pkt_size: usize,
    pub req_ttl_ns: u64,
    pub epoch_size_ns: u64,
    pub gc_interval: Duration,
    pub wdt_interval: Duration,
    pub drain_timeout: Duration,
    pub policy: Policy,
    pub metrics: Arc<Metrics>,
    pub forwarders: Vec<Arc<Forwarder>>,
    pub frontends: Vec<Arc<Frontend>>,
    epoch: AtomicU64,
    in_flight: Arc<AtomicI64>,
    tracked: AtomicI64,
    workers: Vec<WorkerHandle>,
    next: OnceCell<Arc<Context>>,
    route_cursor: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl Context {
    /// Build a context from validated configuration. Sockets are not bound
    /// until `spawn`.
    pub fn new(cfg: &Config, metrics: Arc<Metrics>) -> anyhow::Result<Arc<Self>> {
        cfg.validate()?;

        let forwarders: Vec<Arc<Forwarder>> = cfg
            .forwarders
            .iter()
            .map(|f| {
                Arc::new(Forwarder::new(
                    f.name.clone(),
                    f.address,
                    f.weight,
                    f.watchdog_query.clone(),
                    cfg.watchdog.retries,
                ))
            })
            .collect();

        let mut frontends = Vec::with_capacity(cfg.frontends.len());
        for fe in &cfg.frontends {
            let mut indices = Vec::with_capacity(fe.forwarders.len());
            for name in &fe.forwarders {
                let index = forwarders
                    .iter()
                    .position(|f| &f.name == name)
                    .with_context(|| {
                        format!("frontend {} references unknown forwarder {}", fe.name, name)
                    })?;
                indices.push(index);
            }
            frontends.push(Arc::new(Frontend::new(fe.name.clone(), fe.listen, indices)));
        }

        let workers = (0..cfg.runtime.workers)
            .map(|_| WorkerHandle {
                rep: Arc::new(SharedQueue::new()),
                wdt_rep: Arc::new(SharedQueue::new()),
            })
            .collect();

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            max_pkt_size: cfg.runtime.max_pkt_size,
            req_ttl_ns: cfg.runtime.req_ttl_ms.saturating_mul(1_000_000),
            epoch_size_ns: cfg.runtime.epoch_ms.saturating_mul(1_000_000),
            gc_interval: Duration::from_millis(cfg.runtime.gc_interval_ms),
            wdt_interval: Duration::from_millis(cfg.watchdog.interval_ms),
            drain_timeout: Duration::from_millis(cfg.runtime.drain_timeout_ms),
            policy: cfg.balancing.policy,
            metrics,
            forwarders,
            frontends,
            epoch: AtomicU64::new(0),
            in_flight: Arc::new(AtomicI64::new(0)),
            tracked: AtomicI64::new(0),
            workers,
            next: OnceCell::new(),
            route_cursor: AtomicUsize::new(0),
            shutdown,
        }))
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// A new in-flight share for a task owned by this context.
    pub fn flight(&self) -> FlightGuard {
        FlightGuard::new(Arc::clone(&self.in_flight))
    }

    /// Entries currently sitting in the workers' tracking tables.
    pub fn tracked_entries(&self) -> i64 {
        self.tracked.load(Ordering::Acquire)
    }

    pub(crate) fn tracked_delta(&self, delta: i64) {
        self.tracked.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn handle(&self, index: usize) -> &WorkerHandle {
        &self.workers[index]
    }

    /// Round-robin pick of a worker to receive a redirected reply.
    pub fn route_handle(&self) -> &WorkerHandle {
        let i = self.route_cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }

    /// Successor generation, when a reload is in progress.
    pub fn reload_target(&self) -> Option<&Arc<Context>> {
        self.next.get()
    }

    pub fn set_reload_target(&self, next: Arc<Context>) {
        if self.next.set(next).is_err() {
            log::warn!("reload target already set, keeping the first");
        }
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn frontend_addr(&self, index: usize) -> std::net::SocketAddr {
        self.frontends[index].addr()
    }

    /// Bind all sockets and start the epoch ticker plus one task per
    /// worker. Frontend sockets are reuseport siblings: every worker gets
    /// its own descriptor for every frontend address. A frontend
    /// configured on port zero is resolved by the first bind and the
    /// siblings reuse the kernel-chosen port.
    pub async fn spawn(self: &Arc<Self>) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let n = self.workers.len();
        let mut fe_sets: Vec<Vec<Arc<FrontendSocket>>> = (0..n).map(|_| Vec::new()).collect();
        for fe in &self.frontends {
            let mut addr = fe.addr();
            for set in fe_sets.iter_mut() {
                let sock = sockets::bind_reuseport(addr)
                    .with_context(|| format!("binding frontend {} at {}", fe.name, addr))?;
                if addr.port() == 0 {
                    addr = sock.local_addr()?;
                }
                set.push(Arc::new(FrontendSocket {
                    sock,
                    frontend: Arc::clone(fe),
                }));
            }
            fe.set_bound(addr);
        }

        let mut handles = Vec::with_capacity(n + 1);
        for (index, fe_socks) in fe_sets.into_iter().enumerate() {
            let mut fwd_socks = Vec::with_capacity(self.forwarders.len());
            let mut wdt_socks = Vec::with_capacity(self.forwarders.len());
            for (i, fwd) in self.forwarders.iter().enumerate() {
                fwd_socks.push(Arc::new(sockets::connect_forwarder(fwd, i).await.with_context(
                    || format!("connecting forwarder {} at {}", fwd.name, fwd.addr),
                )?));
                wdt_socks.push(Arc::new(sockets::connect_forwarder(fwd, i).await.with_context(
                    || format!("connecting watchdog socket for {}", fwd.name),
                )?));
            }
            let worker = Worker::new(index, Arc::clone(self), fe_socks, fwd_socks, wdt_socks);
            handles.push(tokio::spawn(worker.run()));
        }
        handles.push(self.spawn_ticker());
        Ok(handles)
    }

    fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let period = Duration::from_nanos(ctx.epoch_size_ns);
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        ctx.epoch.fetch_add(1, Ordering::AcqRel);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
