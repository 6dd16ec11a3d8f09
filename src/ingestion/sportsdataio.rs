//! Sportsdataio injury feed: optional, defensive outbound interface. Unlike
//! the odds/exchange clients, a failure here is never allowed to surface —
//! missing config, an unreachable endpoint, or a malformed response all
//! collapse to `None` so a caller only ever gets "no injury context" rather
//! than a propagated error.

use crate::config::Config;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

fn injuries_path(sport_key: &str) -> Option<&'static str> {
    match sport_key {
        "basketball_nba" => Some("nba/scores/json/Injuries"),
        "basketball_ncaab" => Some("cbb/scores/json/Injuries"),
        "americanfootball_nfl" => Some("nfl/scores/json/Injuries"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
pub struct InjuryRow {
    #[serde(default, rename = "Team")]
    pub team: Option<String>,
    #[serde(default, rename = "Status")]
    pub status: Option<String>,
}

/// A provider outage here must never degrade odds/exchange ingestion, so
/// this client is constructed even when disabled — `fetch_injuries` is the
/// only gate, keeping the disabled/enabled check in one place.
pub struct SportsdataioClient {
    http: Client,
    base_url: String,
    api_key: String,
    enabled: bool,
}

impl SportsdataioClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs_f64(config.sportsdataio_timeout_seconds))
            .build()
            .context("failed to build Sportsdataio HTTP client")?;
        Ok(SportsdataioClient {
            http,
            base_url: config.sportsdataio_base_url.clone(),
            api_key: config.sportsdataio_api_key.clone(),
            enabled: config.enable_sportsdataio_injuries,
        })
    }

    /// Best-effort injury rows for a sport's league-wide injury report.
    /// Returns `None` when disabled, unconfigured, unsupported, or on any
    /// request/decode failure — the caller falls back to whatever context
    /// it already has, same as every other optional signal input.
    pub async fn fetch_injuries(&self, sport_key: &str) -> Option<Vec<InjuryRow>> {
        if !self.enabled || self.api_key.is_empty() {
            return None;
        }
        let path = injuries_path(sport_key)?;
        let url = format!("{}/{path}", self.base_url);
        let resp = match self.http.get(&url).query(&[("key", &self.api_key)]).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(sport_key, error = %e, "sportsdataio injury request failed, skipping");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(sport_key, status = %resp.status(), "sportsdataio injury request returned non-success");
            return None;
        }
        match resp.json::<Vec<InjuryRow>>().await {
            Ok(rows) => {
                debug!(sport_key, rows = rows.len(), "fetched sportsdataio injury rows");
                Some(rows)
            }
            Err(e) => {
                warn!(sport_key, error = %e, "sportsdataio injury response decode failed, skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn injuries_path_covers_configured_sports_only() {
        assert!(injuries_path("basketball_nba").is_some());
        assert!(injuries_path("basketball_ncaab").is_some());
        assert!(injuries_path("americanfootball_nfl").is_some());
        assert!(injuries_path("icehockey_nhl").is_none());
    }

    #[tokio::test]
    async fn fetch_injuries_is_none_when_disabled() {
        let config = Config::parse_from(["stratum-engine"]);
        let client = SportsdataioClient::new(&config).unwrap();
        assert!(client.fetch_injuries("basketball_nba").await.is_none());
    }

    #[tokio::test]
    async fn fetch_injuries_is_none_without_api_key_even_if_enabled() {
        let mut config = Config::parse_from(["stratum-engine"]);
        config.enable_sportsdataio_injuries = true;
        let client = SportsdataioClient::new(&config).unwrap();
        assert!(client.fetch_injuries("basketball_nba").await.is_none());
    }
}
