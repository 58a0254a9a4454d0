//! jobtally.toml configuration parser.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::source::DrainMode;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub server: ServerConfig,
    pub source: SourceConfig,
    pub aggregation: AggregationConfig,
    pub scrape: ScrapeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub mode: DrainMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub interval_secs: u64,
    pub metric_name: String,
    pub help: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Request header whose value identifies the scraper.
    pub identity_header: String,
    /// Take the origin from the first `X-Forwarded-For` entry when present.
    pub trust_forwarded_for: bool,
    /// Stand-in for a missing identifier or origin.
    pub placeholder: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data_collect.csv"),
            mode: DrainMode::Retain,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            metric_name: "log_host_job_count".to_string(),
            help: "Count of occurrences of host and job in log".to_string(),
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            identity_header: "user-agent".to_string(),
            trust_forwarded_for: false,
            placeholder: "unknown".to_string(),
        }
    }
}

impl TallyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TallyConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.aggregation.interval_secs > 0,
            "aggregation.interval_secs must be greater than zero"
        );
        anyhow::ensure!(
            is_valid_metric_name(&self.aggregation.metric_name),
            "aggregation.metric_name {:?} is not a valid metric name",
            self.aggregation.metric_name
        );
        anyhow::ensure!(
            is_valid_header_name(&self.scrape.identity_header),
            "scrape.identity_header {:?} is not a valid header name",
            self.scrape.identity_header
        );
        anyhow::ensure!(
            !self.scrape.placeholder.is_empty(),
            "scrape.placeholder must not be empty"
        );
        Ok(())
    }
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// RFC 7230 token characters.
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TallyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.aggregation.interval_secs, 10);
        assert_eq!(config.scrape.placeholder, "unknown");
    }

    #[test]
    fn parse_partial_file() {
        let toml_str = r#"
[source]
path = "/var/log/data_collect.csv"
mode = "truncate"

[scrape]
trust_forwarded_for = true
"#;
        let config: TallyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.source.path, PathBuf::from("/var/log/data_collect.csv"));
        assert_eq!(config.source.mode, DrainMode::Truncate);
        assert!(config.scrape.trust_forwarded_for);
        assert_eq!(config.scrape.identity_header, "user-agent");
        assert_eq!(config.server.listen.port(), 8080);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = TallyConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("log_host_job_count"));
        let back: TallyConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = TallyConfig::default();
        config.aggregation.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_metric_name() {
        let mut config = TallyConfig::default();
        config.aggregation.metric_name = "9lives".to_string();
        assert!(config.validate().is_err());

        config.aggregation.metric_name = "ns:log_count".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_header_name() {
        let mut config = TallyConfig::default();
        config.scrape.identity_header = "user agent".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobtally.toml");
        std::fs::write(&path, "[aggregation]\ninterval_secs = 80\n").unwrap();
        let config = TallyConfig::from_file(&path).unwrap();
        assert_eq!(config.aggregation.interval_secs, 80);
    }
}
