//! Scrape gate — admits each scraper identity once per generation.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::debug;

use crate::store::StoreError;

/// A metrics consumer: origin address plus a client-supplied identifier
/// (typically the `User-Agent`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScraperIdentity {
    origin: String,
    client: String,
}

impl ScraperIdentity {
    pub fn new(origin: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            client: client.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn client(&self) -> &str {
        &self.client
    }
}

impl fmt::Display for ScraperIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.origin, self.client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Admitted,
    /// Already served this generation. Not a fault.
    Denied,
}

/// Identities that have read one generation, with their access time.
///
/// A gate is created together with the snapshot it guards and is dropped
/// with it, so clearing on publish is simply replacing the gate.
#[derive(Debug)]
pub struct ScrapeGate {
    generation: u64,
    /// identity → last access, Unix epoch milliseconds.
    seen: Mutex<HashMap<ScraperIdentity, u64>>,
}

impl ScrapeGate {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Admit `identity` if it has not read `generation` yet.
    ///
    /// A `generation` other than the gate's own means the caller paired
    /// this gate with the wrong snapshot.
    pub fn check_and_mark(
        &self,
        identity: &ScraperIdentity,
        generation: u64,
    ) -> Result<GateDecision, StoreError> {
        if generation != self.generation {
            return Err(StoreError::GateMismatch {
                gate: self.generation,
                snapshot: generation,
            });
        }

        let now = epoch_millis();
        let mut seen = self.seen.lock();
        if let Some(last) = seen.get_mut(identity) {
            *last = now;
            debug!(%identity, generation, "scrape denied, already served this generation");
            return Ok(GateDecision::Denied);
        }
        seen.insert(identity.clone(), now);
        Ok(GateDecision::Admitted)
    }

    /// Last access of `identity` in this generation.
    pub fn last_access(&self, identity: &ScraperIdentity) -> Option<u64> {
        self.seen.lock().get(identity).copied()
    }

    /// Number of identities admitted this generation.
    pub fn admitted(&self) -> usize {
        self.seen.lock().len()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
