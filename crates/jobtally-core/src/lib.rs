//! jobtally-core — the data path from raw log lines to snapshots.
//!
//! # Architecture
//!
//! ```text
//! RecordSource::fetch()   ← one batch of complete lines per cycle
//!   └── record::parse_line() → Record { host, job, extra_labels }
//!         └── Aggregator::aggregate() → Snapshot
//!               └── counts: AggregationKey → u64, grouped by LabelShape
//! ```

pub mod aggregate;
pub mod config;
pub mod labels;
pub mod record;
pub mod source;

pub use aggregate::{AggregateError, Aggregator, Snapshot};
pub use config::TallyConfig;
pub use labels::{AggregationKey, LabelShape, HOST_LABEL, JOB_LABEL};
pub use record::{parse_line, ParseStats, Record};
pub use source::{DrainMode, FileSource, MemorySource, RecordBatch, RecordSource, SourceError};
