//! Snapshot store — the one piece of state shared between the collector
//! and scrape handlers.
//!
//! The current snapshot and its scrape gate live together in a `Cycle`
//! behind a single `ArcSwap`. Publishing swaps the whole cycle, so the
//! gate can never refer to a different generation than the snapshot it
//! is served with, and readers never wait on a publish. Publishers are
//! serialized by a mutex that readers never touch.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use jobtally_core::Snapshot;

use crate::gate::{GateDecision, ScrapeGate, ScraperIdentity};

/// Broken concurrency invariants. These indicate a bug, never bad input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("refusing to publish generation {attempted}: current generation is {current}")]
    GenerationRegression { current: u64, attempted: u64 },

    #[error("scrape gate is scoped to generation {gate} but was asked about generation {snapshot}")]
    GateMismatch { gate: u64, snapshot: u64 },
}

/// Result of a scrape admission.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Serve this snapshot.
    Admitted(Arc<Snapshot>),
    /// Nothing to serve until the next generation.
    Denied { generation: u64 },
}

impl Admission {
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        match self {
            Admission::Admitted(snapshot) => Some(snapshot),
            Admission::Denied { .. } => None,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            Admission::Admitted(snapshot) => snapshot.generation(),
            Admission::Denied { generation } => *generation,
        }
    }
}

/// Point-in-time view of the store for status reporting.
#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub snapshot: Arc<Snapshot>,
    pub admitted_scrapers: usize,
}

#[derive(Debug)]
struct Cycle {
    snapshot: Arc<Snapshot>,
    gate: ScrapeGate,
}

impl Cycle {
    fn new(snapshot: Snapshot) -> Self {
        let gate = ScrapeGate::new(snapshot.generation());
        Self {
            snapshot: Arc::new(snapshot),
            gate,
        }
    }
}

pub struct SnapshotStore {
    cycle: ArcSwap<Cycle>,
    publish_lock: Mutex<()>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    /// Start with the empty generation-0 snapshot.
    pub fn new() -> Self {
        Self {
            cycle: ArcSwap::from_pointee(Cycle::new(Snapshot::initial())),
            publish_lock: Mutex::new(()),
        }
    }

    /// Replace the current snapshot and reset the scrape gate in one step.
    ///
    /// Returns the published generation.
    pub fn publish(&self, snapshot: Snapshot) -> Result<u64, StoreError> {
        let _guard = self.publish_lock.lock();

        let current = self.cycle.load().snapshot.generation();
        let generation = snapshot.generation();
        if generation <= current {
            return Err(StoreError::GenerationRegression {
                current,
                attempted: generation,
            });
        }

        let keys = snapshot.len();
        self.cycle.store(Arc::new(Cycle::new(snapshot)));
        info!(generation, keys, "snapshot published");
        Ok(generation)
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.cycle.load().snapshot.clone()
    }

    pub fn generation(&self) -> u64 {
        self.cycle.load().snapshot.generation()
    }

    /// Check-and-mark `identity` against the current generation.
    ///
    /// The gate consulted and the snapshot returned always come from the
    /// same cycle, even if a publish lands concurrently.
    pub fn admit(&self, identity: &ScraperIdentity) -> Result<Admission, StoreError> {
        let cycle = self.cycle.load_full();
        let generation = cycle.snapshot.generation();
        match cycle.gate.check_and_mark(identity, generation)? {
            GateDecision::Admitted => {
                debug!(%identity, generation, "scrape admitted");
                Ok(Admission::Admitted(cycle.snapshot.clone()))
            }
            GateDecision::Denied => Ok(Admission::Denied { generation }),
        }
    }

    /// Scrapers admitted for the current generation.
    pub fn admitted_scrapers(&self) -> usize {
        self.cycle.load().gate.admitted()
    }

    /// Current snapshot and its admitted count, read from one cycle.
    pub fn status(&self) -> StoreStatus {
        let cycle = self.cycle.load_full();
        StoreStatus {
            snapshot: cycle.snapshot.clone(),
            admitted_scrapers: cycle.gate.admitted(),
        }
    }
}
