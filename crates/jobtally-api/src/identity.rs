//! Scraper identity derivation from the transport peer and request headers.

use std::net::SocketAddr;

use axum::http::header::{HeaderName, InvalidHeaderName, USER_AGENT};
use axum::http::HeaderMap;
use jobtally_core::config::ScrapeConfig;
use jobtally_metrics::ScraperIdentity;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct IdentityPolicy {
    header: HeaderName,
    trust_forwarded_for: bool,
    placeholder: String,
}

impl Default for IdentityPolicy {
    fn default() -> Self {
        Self {
            header: USER_AGENT,
            trust_forwarded_for: false,
            placeholder: "unknown".to_string(),
        }
    }
}

impl IdentityPolicy {
    pub fn from_config(config: &ScrapeConfig) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::from_bytes(config.identity_header.as_bytes())?,
            trust_forwarded_for: config.trust_forwarded_for,
            placeholder: config.placeholder.clone(),
        })
    }

    pub fn with_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    /// Origin is the peer IP, or the first `X-Forwarded-For` hop when that
    /// header is trusted. Missing parts fall back to the placeholder.
    pub fn derive(&self, peer: Option<SocketAddr>, headers: &HeaderMap) -> ScraperIdentity {
        let forwarded = self
            .trust_forwarded_for
            .then(|| header_str(headers, X_FORWARDED_FOR))
            .flatten()
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let origin = forwarded
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| self.placeholder.clone());

        let client = header_str(headers, self.header.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.placeholder.as_str())
            .to_string();

        ScraperIdentity::new(origin, client)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
