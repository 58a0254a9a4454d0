//! Collector — the periodic aggregation driver.
//!
//! One task owns the record source and the aggregator. Cycles run inline
//! in that task, so a cycle can never start while the previous one is
//! still computing; missed ticks are delayed rather than bunched up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use jobtally_core::{AggregateError, Aggregator, RecordSource};

use crate::store::{SnapshotStore, StoreError};

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published { generation: u64, keys: usize },
    /// The source had no batch; the previous generation is still served.
    Stale { generation: u64 },
}

pub struct Collector<S> {
    source: S,
    aggregator: Aggregator,
    store: Arc<SnapshotStore>,
    interval: Duration,
}

impl<S: RecordSource> Collector<S> {
    pub fn new(source: S, store: Arc<SnapshotStore>, interval: Duration) -> Self {
        let aggregator = Aggregator::resume_from(store.generation());
        Self {
            source,
            aggregator,
            store,
            interval,
        }
    }

    /// Fetch, aggregate and publish once.
    ///
    /// A missing source is not an error: the cycle is skipped and the
    /// store keeps its snapshot. A `StoreError` means the store and this
    /// collector disagree about generations and is returned to the caller;
    /// on a regression the collector resumes numbering after the store's
    /// generation.
    pub fn run_cycle(&mut self) -> Result<CycleOutcome, StoreError> {
        let snapshot = match self.aggregator.collect(&mut self.source) {
            Ok(snapshot) => snapshot,
            Err(AggregateError::NoData(e)) => {
                let generation = self.store.generation();
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    generation,
                    "no record batch this cycle, keeping previous snapshot"
                );
                return Ok(CycleOutcome::Stale { generation });
            }
        };

        let keys = snapshot.len();
        let generation = match self.store.publish(snapshot) {
            Ok(generation) => generation,
            Err(e) => {
                // Renumber from the store so the next cycle can publish.
                if let StoreError::GenerationRegression { current, .. } = &e {
                    self.aggregator = Aggregator::resume_from(*current);
                }
                return Err(e);
            }
        };
        Ok(CycleOutcome::Published { generation, keys })
    }

    /// Run cycles until the shutdown signal fires. The first cycle runs
    /// immediately.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            source = %self.source.describe(),
            interval_secs = self.interval.as_secs(),
            "collector started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle() {
                        error!(error = %e, "aggregation cycle aborted");
                    }
                }
                _ = shutdown.changed() => {
                    info!("collector shutting down");
                    break;
                }
            }
        }
    }
}
