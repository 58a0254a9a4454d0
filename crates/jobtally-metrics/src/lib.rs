//! jobtally-metrics — publishing and serving occurrence snapshots.
//!
//! # Architecture
//!
//! ```text
//! Collector
//!   └── run() → periodic cycle: source → Aggregator → SnapshotStore::publish()
//!
//! SnapshotStore
//!   ├── publish() ← swaps {snapshot, scrape gate} in one step
//!   ├── current() → latest snapshot, never blocks
//!   └── admit()   → one read per scraper identity per generation
//!
//! Prometheus exposition
//!   └── render() / render_text() → one family per label shape
//! ```

pub mod collector;
pub mod gate;
pub mod prometheus;
pub mod store;

pub use collector::{Collector, CycleOutcome};
pub use gate::{GateDecision, ScrapeGate, ScraperIdentity};
pub use prometheus::{render, render_text, ExpositionOptions, MetricFamily, Sample};
pub use store::{Admission, SnapshotStore, StoreError, StoreStatus};
