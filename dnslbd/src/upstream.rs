//! Upstream resolvers and the forwarding selection policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rand::Rng;
use serde::Deserialize;

/// One upstream resolver.
///
/// Liveness is driven entirely by the watchdog handlers: the request
/// handler flips `alive` true→false when probes go unanswered past the
/// retry budget, the reply handler flips it false→true on the next
/// answered probe. Both transitions are observable exactly once.
pub struct Forwarder {
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u32,
    pub watchdog_query: String,
    retries: u64,
    alive: AtomicBool,
    pending: AtomicU64,
}

impl Forwarder {
    pub fn new(
        name: String,
        addr: SocketAddr,
        weight: u32,
        watchdog_query: String,
        retries: u64,
    ) -> Self {
        Self {
            name,
            addr,
            weight,
            watchdog_query,
            retries,
            alive: AtomicBool::new(true),
            pending: AtomicU64::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Flip to dead. Returns true when this call made the transition.
    pub fn mark_dead(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Flip to alive. Returns true when this call made the transition.
    pub fn mark_alive(&self) -> bool {
        !self.alive.swap(true, Ordering::AcqRel)
    }

    pub fn probe_sent(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn probe_answered(&self) {
        self.pending.store(0, Ordering::Release);
    }

    pub fn pending_probes(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Reset the pending-probe count if it has exceeded the retry budget;
    /// returns true when a reset happened. A single CAS loop, so the check
    /// stays linearizable against probe_sent/probe_answered from the reply
    /// path.
    pub fn probes_overdue(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > self.retries).then_some(0)
            })
            .is_ok()
    }
}

/// How prepare picks a forwarder among a frontend's live candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    Random,
    RoundRobin,
    Weighted,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::RoundRobin
    }
}

/// Worker-local selection state; the round-robin cursor is not shared.
pub struct Selector {
    policy: Policy,
    cursor: usize,
}

impl Selector {
    pub fn new(policy: Policy) -> Self {
        Self { policy, cursor: 0 }
    }

    /// Pick an index into a candidate set described by its weights.
    /// `None` when no candidate is left.
    pub fn pick(&mut self, weights: &[u32]) -> Option<usize> {
        if weights.is_empty() {
            return None;
        }
        let choice = match self.policy {
            Policy::Random => rand::thread_rng().gen_range(0..weights.len()),
            Policy::RoundRobin => {
                self.cursor = self.cursor.wrapping_add(1);
                self.cursor % weights.len()
            }
            Policy::Weighted => {
                let total: u64 = weights.iter().map(|w| u64::from((*w).max(1))).sum();
                let mut roll = rand::thread_rng().gen_range(0..total);
                let mut idx = 0;
                for (i, w) in weights.iter().enumerate() {
                    let w = u64::from((*w).max(1));
                    if roll < w {
                        idx = i;
                        break;
                    }
                    roll -= w;
                }
                idx
            }
        };
        Some(choice)
    }
}
