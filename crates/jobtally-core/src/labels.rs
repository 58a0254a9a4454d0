//! Aggregation keys and label shapes.
//!
//! A key is the full label set of one record. Keys are grouped by their
//! shape (the sorted label names) because one exposition family can only
//! carry a single label schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::record::Record;

/// Label name of the positional host field.
pub const HOST_LABEL: &str = "host";
/// Label name of the positional job field.
pub const JOB_LABEL: &str = "job";

/// Unordered set of (name, value) pairs identifying one counted group.
///
/// Backed by a `BTreeMap`, so two keys built from the same pairs in any
/// input order compare, hash and sort identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AggregationKey {
    labels: BTreeMap<String, String>,
}

impl AggregationKey {
    /// Build the key for a record. The positional `host` and `job` always
    /// win over an extra label of the same name.
    pub fn from_record(record: &Record) -> Self {
        let mut labels = record.extra_labels.clone();
        labels.insert(HOST_LABEL.to_string(), record.host.clone());
        labels.insert(JOB_LABEL.to_string(), record.job.clone());
        Self { labels }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn host(&self) -> &str {
        self.get(HOST_LABEL).unwrap_or_default()
    }

    pub fn job(&self) -> &str {
        self.get(JOB_LABEL).unwrap_or_default()
    }

    /// Label pairs in name order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn shape(&self) -> LabelShape {
        LabelShape(self.labels.keys().cloned().collect())
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.labels().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// Sorted tuple of the label names present in a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LabelShape(Vec<String>);

impl LabelShape {
    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// True for the `{host, job}` shape, i.e. keys without extra labels.
    pub fn is_base(&self) -> bool {
        self.0.len() == 2
    }
}

impl fmt::Display for LabelShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.join(","))
    }
}
