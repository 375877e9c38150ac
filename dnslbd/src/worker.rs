//! Per-worker request/response pipeline.
//!
//! Each worker is one task running a cooperative loop that multiplexes its
//! sockets, queue wakes and timers, advancing one unit of work per wake:
//!
//! ```text
//! frontend ─ accept ─▶ prep ─ prepare ─▶ fwd ─ forward ─▶ tracking + upstream
//! upstream ─ obtain ─▶ rep ─ reply ─▶ frontend
//!                   └▶ wdt_rep ─ watchdog reply
//! ```
//!
//! Watchdog probes ride the same fwd queue, tagged so their replies are
//! routed to the liveness handler instead of a client. Handlers never
//! block and never propagate errors: each stage is the terminal recovery
//! point for its own failures, and dropping the task settles the
//! in-flight accounting.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::context::Context;
use crate::dns::{self, PktDir};
use crate::queue::SharedQueue;
use crate::sockets::{self, ForwarderSocket, FrontendSocket};
use crate::task::{Task, TaskKind};
use crate::tracking::TrackingTable;
use crate::upstream::Selector;

pub struct Worker {
    index: usize,
    ctx: Arc<Context>,
    fe_socks: Vec<Arc<FrontendSocket>>,
    fwd_socks: Vec<Arc<ForwarderSocket>>,
    wdt_socks: Vec<Arc<ForwarderSocket>>,
    prep_queue: VecDeque<Task>,
    prep_wake: Arc<Semaphore>,
    fwd_queue: VecDeque<Task>,
    fwd_wake: Arc<Semaphore>,
    rep_queue: Arc<SharedQueue>,
    wdt_rep_queue: Arc<SharedQueue>,
    tracking: TrackingTable,
    selector: Selector,
    wdt_armed: bool,
}

impl Worker {
    pub fn new(
        index: usize,
        ctx: Arc<Context>,
        fe_socks: Vec<Arc<FrontendSocket>>,
        fwd_socks: Vec<Arc<ForwarderSocket>>,
        wdt_socks: Vec<Arc<ForwarderSocket>>,
    ) -> Self {
        let handle = ctx.handle(index);
        let rep_queue = Arc::clone(&handle.rep);
        let wdt_rep_queue = Arc::clone(&handle.wdt_rep);
        let selector = Selector::new(ctx.policy);
        Self {
            index,
            ctx,
            fe_socks,
            fwd_socks,
            wdt_socks,
            prep_queue: VecDeque::new(),
            prep_wake: Arc::new(Semaphore::new(0)),
            fwd_queue: VecDeque::new(),
            fwd_wake: Arc::new(Semaphore::new(0)),
            rep_queue,
            wdt_rep_queue,
            tracking: TrackingTable::new(),
            selector,
            wdt_armed: true,
        }
    }

    pub async fn run(mut self) {
        info!(
            "[wrk {}] starting: {} frontend socket(s), {} forwarder(s)",
            self.index,
            self.fe_socks.len(),
            self.fwd_socks.len()
        );

        let mut shutdown = self.ctx.shutdown_signal();
        let start = Instant::now();
        let mut gc_timer = time::interval_at(start + self.ctx.gc_interval, self.ctx.gc_interval);
        gc_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut wdt_timer = time::interval_at(start + self.ctx.wdt_interval, self.ctx.wdt_interval);
        wdt_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let prep_wake = Arc::clone(&self.prep_wake);
        let fwd_wake = Arc::clone(&self.fwd_wake);
        let rep_queue = Arc::clone(&self.rep_queue);
        let wdt_rep_queue = Arc::clone(&self.wdt_rep_queue);
        let mut drain_deadline: Option<Instant> = None;

        loop {
            if let Some(deadline) = drain_deadline {
                if self.ctx.in_flight() == 0 || Instant::now() >= deadline {
                    break;
                }
            }
            let fe_socks = self.fe_socks.clone();
            let upstream_socks: Vec<_> = self
                .fwd_socks
                .iter()
                .chain(self.wdt_socks.iter())
                .cloned()
                .collect();
            let max_pkt = self.ctx.max_pkt_size;

            tokio::select! {
                (sock, res) = sockets::recv_from_any(fe_socks, max_pkt),
                        if !self.fe_socks.is_empty() => {
                    self.accept(sock, res);
                }
                permit = prep_wake.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                        self.prepare();
                    }
                }
                permit = fwd_wake.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                        self.forward().await;
                    }
                }
                (sock, res) = sockets::recv_any(upstream_socks, max_pkt),
                        if !self.fwd_socks.is_empty() || !self.wdt_socks.is_empty() => {
                    self.obtain(sock, res);
                }
                task = rep_queue.pop() => {
                    if let Some(task) = task {
                        self.reply(task).await;
                    }
                }
                task = wdt_rep_queue.pop() => {
                    if let Some(task) = task {
                        self.watchdog_reply(task);
                    }
                }
                _ = wdt_timer.tick(), if self.wdt_armed => {
                    self.watchdog_request();
                }
                _ = gc_timer.tick() => {
                    self.collect_expired();
                }
                res = shutdown.changed(), if drain_deadline.is_none() => {
                    if res.is_ok() && *shutdown.borrow_and_update() {
                        self.begin_drain();
                        drain_deadline = Some(Instant::now() + self.ctx.drain_timeout);
                    }
                }
                _ = time::sleep(Duration::from_millis(10)), if drain_deadline.is_some() => {}
            }
        }

        info!(
            "[wrk {}] exiting: {} tracked, {} in flight",
            self.index,
            self.tracking.len(),
            self.ctx.in_flight()
        );
        // whatever is still tracked dies with this worker
        self.ctx.tracked_delta(-(self.tracking.len() as i64));
    }

    /// Frontend datagram: wrap it into a task and queue it for prepare.
    fn accept(&mut self, origin: Arc<FrontendSocket>, res: io::Result<(BytesMut, SocketAddr)>) {
        let (buf, peer) = match res {
            Ok(v) => v,
            Err(e) => {
                debug!("[wrk {}] frontend receive failed: {e}", self.index);
                self.ctx.metrics.inc_recv_error();
                return;
            }
        };
        self.ctx.metrics.inc_query_accepted();
        let task = Task::regular(buf, peer, &origin, self.ctx.flight());
        self.prep_queue.push_back(task);
        self.prep_wake.add_permits(1);
    }

    /// Pick a forwarder and fill in the correlation fields.
    fn prepare(&mut self) {
        let Some(mut task) = self.prep_queue.pop_front() else {
            return;
        };
        let origin = task.orig_fe_sk.upgrade();
        let candidates: Vec<&Arc<ForwarderSocket>> = self
            .fwd_socks
            .iter()
            .filter(|s| s.forwarder.is_alive())
            .filter(|s| {
                origin
                    .as_ref()
                    .map_or(true, |o| o.frontend.balances(s.index))
            })
            .collect();
        let weights: Vec<u32> = candidates.iter().map(|s| s.forwarder.weight).collect();
        let Some(choice) = self.selector.pick(&weights) else {
            debug!("[wrk {}] no live forwarder for {}", self.index, task.peer);
            self.ctx.metrics.inc_selection_failure();
            return;
        };
        task.fwd_sk = Some(Arc::clone(candidates[choice]));
        if let Err(e) = dns::parse_task(&mut task, PktDir::Request) {
            debug!(
                "[wrk {}] dropping malformed query from {}: {e}",
                self.index, task.peer
            );
            self.ctx.metrics.inc_parse_error();
            return;
        }
        self.fwd_queue.push_back(task);
        self.fwd_wake.add_permits(1);
    }

    /// Send one queued task upstream and start tracking it.
    async fn forward(&mut self) {
        let Some(mut task) = self.fwd_queue.pop_front() else {
            return;
        };
        let Some(fwd_sk) = task.fwd_sk.clone() else {
            return;
        };
        match fwd_sk.sock.send(&task.buf).await {
            Err(e) => {
                debug!(
                    "[wrk {}] send to {} failed: {e}",
                    self.index, fwd_sk.forwarder.name
                );
                self.ctx.metrics.inc_send_error();
            }
            Ok(_) => {
                match task.kind {
                    TaskKind::Regular => self.ctx.metrics.inc_query_forwarded(),
                    TaskKind::Watchdog => self.ctx.metrics.inc_probe_sent(),
                }
                task.epoch = self.ctx.epoch();
                if let Some(evicted) = self.tracking.insert(task) {
                    // replacement, table size unchanged
                    debug!(
                        "[wrk {}] duplicate in-flight query for {} evicted",
                        self.index, evicted.peer
                    );
                    self.ctx.metrics.inc_duplicate_eviction();
                } else {
                    self.ctx.tracked_delta(1);
                }
            }
        }
    }

    /// Upstream datagram: correlate it with a tracked query and queue the
    /// response for delivery, possibly through the successor context.
    fn obtain(&mut self, from: Arc<ForwarderSocket>, res: io::Result<BytesMut>) {
        let buf = match res {
            Ok(b) => b,
            Err(e) => {
                debug!(
                    "[wrk {}] receive from {} failed: {e}",
                    self.index, from.forwarder.name
                );
                self.ctx.metrics.inc_recv_error();
                return;
            }
        };
        let mut task = Task::reply(buf, &from, self.ctx.flight());
        if let Err(e) = dns::parse_task(&mut task, PktDir::Reply) {
            debug!(
                "[wrk {}] dropping malformed reply from {}: {e}",
                self.index, from.forwarder.name
            );
            self.ctx.metrics.inc_parse_error();
            return;
        }
        let Some(found) = self.tracking.remove(task.fingerprint) else {
            // expected after an eviction or a duplicate upstream answer
            self.ctx.metrics.inc_correlation_miss();
            return;
        };
        self.ctx.tracked_delta(-1);
        task.kind = found.kind;
        task.peer = found.peer;
        task.orig_fe_addr = found.orig_fe_addr;
        task.orig_fe_sk = found.orig_fe_sk.clone();
        dns::rewrite_id(&mut task.buf, found.orig_id);
        drop(found);

        let dest = match self.ctx.reload_target() {
            Some(next) => {
                task.redirected = true;
                task.retarget(next.flight());
                next.route_handle()
            }
            None => self.ctx.handle(self.index),
        };
        match task.kind {
            TaskKind::Regular => dest.rep.push(task),
            TaskKind::Watchdog => dest.wdt_rep.push(task),
        }
    }

    /// Send a correlated response back to the client.
    async fn reply(&mut self, task: Task) {
        let sock = if task.redirected {
            // arrived from a draining predecessor; find our own socket for
            // the frontend address the query came in on
            match self
                .fe_socks
                .iter()
                .find(|s| s.frontend.addr() == task.orig_fe_addr)
            {
                Some(s) => Arc::clone(s),
                None => {
                    debug!(
                        "[wrk {}] no frontend at {} for redirected reply",
                        self.index, task.orig_fe_addr
                    );
                    self.ctx.metrics.inc_unroutable_reply();
                    return;
                }
            }
        } else {
            match task.orig_fe_sk.upgrade() {
                Some(s) => s,
                None => {
                    self.ctx.metrics.inc_unroutable_reply();
                    return;
                }
            }
        };
        match sock.sock.send_to(&task.buf, task.peer).await {
            Ok(_) => self.ctx.metrics.inc_reply_sent(),
            Err(e) => {
                debug!("[wrk {}] reply to {} failed: {e}", self.index, task.peer);
                self.ctx.metrics.inc_send_error();
            }
        }
    }

    /// Timer-driven liveness round: account for unanswered probes, then
    /// send a fresh probe to every watchdog socket.
    fn watchdog_request(&mut self) {
        for wdt_sk in &self.wdt_socks {
            let fwd = &wdt_sk.forwarder;
            if fwd.probes_overdue() && fwd.mark_dead() {
                warn!("forwarder {} became unreachable", fwd.name);
                self.ctx.metrics.inc_forwarder_lost();
            }
            let buf = match dns::build_probe(&fwd.watchdog_query) {
                Ok(b) => b,
                Err(e) => {
                    warn!(
                        "forwarder {}: unusable watchdog query {:?}: {e}",
                        fwd.name, fwd.watchdog_query
                    );
                    continue;
                }
            };
            let mut task = Task::probe(buf, wdt_sk, self.ctx.flight());
            if dns::parse_task(&mut task, PktDir::Request).is_err() {
                continue;
            }
            fwd.probe_sent();
            self.fwd_queue.push_back(task);
            self.fwd_wake.add_permits(1);
        }
    }

    /// An answered probe: the forwarder is reachable.
    fn watchdog_reply(&mut self, task: Task) {
        if let Some(wdt_sk) = &task.fwd_sk {
            let fwd = &wdt_sk.forwarder;
            fwd.probe_answered();
            if fwd.mark_alive() {
                info!("forwarder {} became reachable", fwd.name);
                self.ctx.metrics.inc_forwarder_recovered();
            }
        }
    }

    /// Two-pass expiry scan over the tracking table.
    fn collect_expired(&mut self) {
        let now = self.ctx.epoch();
        let expired = self
            .tracking
            .expired_keys(now, self.ctx.epoch_size_ns, self.ctx.req_ttl_ns);
        for key in expired {
            if let Some(task) = self.tracking.remove(key) {
                debug!(
                    "[wrk {}] expiring query for {} after {} epochs",
                    self.index,
                    task.peer,
                    now.saturating_sub(task.epoch)
                );
                self.ctx.tracked_delta(-1);
                self.ctx.metrics.inc_expired_eviction();
            }
        }
    }

    /// Shutdown observed: stop accepting, stop probing, keep the loop
    /// running for the drain interval so in-flight work can finish.
    fn begin_drain(&mut self) {
        info!(
            "[wrk {}] draining: closing {} frontend socket(s)",
            self.index,
            self.fe_socks.len()
        );
        self.fe_socks.clear();
        self.wdt_armed = false;
    }
}
