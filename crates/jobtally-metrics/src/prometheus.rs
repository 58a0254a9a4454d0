//! Prometheus text exposition format.
//!
//! A metric family has one fixed label schema, while records carry any
//! number of extra labels. Each label shape therefore gets its own family
//! under the same metric name: keys are never padded with empty labels to
//! fit a wider schema, and keys without extras never inherit foreign label
//! names.

use std::fmt::Write;

use jobtally_core::config::AggregationConfig;
use jobtally_core::{LabelShape, Snapshot};

/// Name and help text shared by every rendered family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpositionOptions {
    pub name: String,
    pub help: String,
}

impl Default for ExpositionOptions {
    fn default() -> Self {
        Self::from_config(&AggregationConfig::default())
    }
}

impl ExpositionOptions {
    pub fn from_config(config: &AggregationConfig) -> Self {
        Self {
            name: config.metric_name.clone(),
            help: config.help.clone(),
        }
    }
}

/// One sample line: sorted label pairs and the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub labels: Vec<(String, String)>,
    pub value: u64,
}

/// A gauge family whose samples all share `shape`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub shape: LabelShape,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    fn write_text(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, escape_help(&self.help));
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        for sample in &self.samples {
            out.push_str(&self.name);
            out.push('{');
            for (i, (name, value)) in sample.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
            }
            let _ = writeln!(out, "}} {}", sample.value);
        }
    }
}

/// Group a snapshot's keys into one family per label shape.
///
/// Families are ordered by shape, samples by key; both orders are stable
/// across renders of the same snapshot.
pub fn render(snapshot: &Snapshot, options: &ExpositionOptions) -> Vec<MetricFamily> {
    snapshot
        .by_shape()
        .into_iter()
        .map(|(shape, members)| MetricFamily {
            name: options.name.clone(),
            help: options.help.clone(),
            shape,
            samples: members
                .into_iter()
                .map(|(key, value)| Sample {
                    labels: key
                        .labels()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    value,
                })
                .collect(),
        })
        .collect()
}

/// Serialize families into newline-delimited text.
pub fn render_text(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        family.write_text(&mut out);
    }
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
