//! Aggregator — turns one batch of records into an immutable [`Snapshot`].
//!
//! Every cycle starts from empty counts. Nothing carries over from the
//! previous snapshot, so a key that stops appearing disappears instead of
//! lingering at a stale or zero value.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::labels::{AggregationKey, LabelShape};
use crate::record::{parse_line, ParseStats, Record};
use crate::source::{RecordSource, SourceError};

#[derive(Debug, Error)]
pub enum AggregateError {
    /// The record source could not produce a batch. The caller keeps
    /// serving its previous snapshot.
    #[error("no data: {0}")]
    NoData(#[from] SourceError),
}

/// Fully aggregated count table for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    generation: u64,
    counts: BTreeMap<AggregationKey, u64>,
    /// Number of distinct keys per shape.
    shapes: BTreeMap<LabelShape, usize>,
    /// Unix epoch seconds.
    created_at: u64,
    stats: ParseStats,
}

impl Snapshot {
    /// The empty generation-0 snapshot served before the first publish.
    pub fn initial() -> Self {
        Self {
            generation: 0,
            counts: BTreeMap::new(),
            shapes: BTreeMap::new(),
            created_at: epoch_secs(),
            stats: ParseStats::default(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn counts(&self) -> &BTreeMap<AggregationKey, u64> {
        &self.counts
    }

    pub fn get(&self, key: &AggregationKey) -> Option<u64> {
        self.counts.get(key).copied()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Distinct shapes with their key counts, in shape order.
    pub fn shapes(&self) -> &BTreeMap<LabelShape, usize> {
        &self.shapes
    }

    /// Keys partitioned by shape. Within a shape, keys are in key order.
    pub fn by_shape(&self) -> BTreeMap<LabelShape, Vec<(&AggregationKey, u64)>> {
        let mut groups: BTreeMap<LabelShape, Vec<(&AggregationKey, u64)>> = BTreeMap::new();
        for (key, &count) in &self.counts {
            groups.entry(key.shape()).or_default().push((key, count));
        }
        groups
    }
}

/// Produces successive snapshots with strictly increasing generations.
#[derive(Debug, Default)]
pub struct Aggregator {
    last_generation: u64,
}

impl Aggregator {
    /// Start at generation 0; the first snapshot is generation 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue numbering after an existing generation.
    pub fn resume_from(generation: u64) -> Self {
        Self {
            last_generation: generation,
        }
    }

    /// Generation of the most recently produced snapshot.
    pub fn last_generation(&self) -> u64 {
        self.last_generation
    }

    /// Aggregate already-parsed records.
    pub fn aggregate<I>(&mut self, records: I) -> Snapshot
    where
        I: IntoIterator<Item = Record>,
    {
        let mut stats = ParseStats::default();
        let records = records.into_iter().inspect(|_| {
            stats.lines += 1;
            stats.records += 1;
        });
        let (counts, shapes) = count(records);
        self.finish(counts, shapes, stats)
    }

    /// Parse and aggregate raw lines.
    pub fn aggregate_lines<I, S>(&mut self, lines: I) -> Snapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.parse_and_count(lines, ParseStats::default())
    }

    /// Fetch one batch from `source` and aggregate it. Lines the source
    /// rejected count as dropped lines.
    ///
    /// On a source failure the generation is not consumed.
    pub fn collect(&mut self, source: &mut dyn RecordSource) -> Result<Snapshot, AggregateError> {
        let batch = source.fetch()?;
        let stats = ParseStats {
            lines: batch.rejected,
            dropped_lines: batch.rejected,
            ..ParseStats::default()
        };
        Ok(self.parse_and_count(batch.lines, stats))
    }

    fn parse_and_count<I, S>(&mut self, lines: I, mut stats: ParseStats) -> Snapshot
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let records: Vec<Record> = lines
            .into_iter()
            .filter_map(|line| parse_line(line.as_ref(), &mut stats))
            .collect();
        let (counts, shapes) = count(records);
        self.finish(counts, shapes, stats)
    }

    fn finish(
        &mut self,
        counts: BTreeMap<AggregationKey, u64>,
        shapes: BTreeMap<LabelShape, usize>,
        stats: ParseStats,
    ) -> Snapshot {
        self.last_generation += 1;
        let snapshot = Snapshot {
            generation: self.last_generation,
            counts,
            shapes,
            created_at: epoch_secs(),
            stats,
        };
        debug!(
            generation = snapshot.generation,
            keys = snapshot.len(),
            shapes = snapshot.shapes.len(),
            dropped_lines = stats.dropped_lines,
            dropped_fragments = stats.dropped_fragments,
            "aggregated snapshot"
        );
        snapshot
    }
}

fn count<I>(records: I) -> (BTreeMap<AggregationKey, u64>, BTreeMap<LabelShape, usize>)
where
    I: IntoIterator<Item = Record>,
{
    let mut counts: BTreeMap<AggregationKey, u64> = BTreeMap::new();
    let mut shapes: BTreeMap<LabelShape, usize> = BTreeMap::new();
    for record in records {
        let key = AggregationKey::from_record(&record);
        *counts.entry(key).or_insert(0) += 1;
    }
    for key in counts.keys() {
        *shapes.entry(key.shape()).or_insert(0) += 1;
    }
    (counts, shapes)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
