//! C2 — exchange ingestion. Polls Kalshi (always) and Polymarket (opt-in)
//! for the outcome probabilities of markets already bridged to a
//! sportsbook event via `CanonicalEventAlignment`. Fail-open: one market's
//! parse or fetch failure never stops the batch.

use crate::config::Config;
use crate::db::models::ExchangeQuoteEvent;
use crate::db::Database;
use crate::error::EngineError;
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// `{market_id, outcomes:[{name:"YES"|"NO", probability, price?}], timestamp}`,
/// the shape both Kalshi and Polymarket responses are normalized into.
#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeMarketPayload {
    pub market_id: String,
    #[serde(default)]
    pub outcomes: Vec<ExchangeOutcomePayload>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExchangeOutcomePayload {
    pub name: String,
    #[serde(default)]
    pub probability: Option<f64>,
    #[serde(default)]
    pub price: Option<f64>,
}

/// Flattens one market payload into quotes. Missing outcome probability
/// skips that outcome, not the whole market; a missing timestamp falls
/// back to server time.
pub(crate) fn parse_market_quotes(
    canonical_event_key: &str,
    source: crate::db::models::ExchangeSource,
    payload: &ExchangeMarketPayload,
) -> Vec<ExchangeQuoteEvent> {
    let timestamp = payload.timestamp.unwrap_or_else(Utc::now);
    payload
        .outcomes
        .iter()
        .filter_map(|o| {
            let probability = o.probability?;
            if !probability.is_finite() {
                return None;
            }
            Some(ExchangeQuoteEvent {
                id: None,
                canonical_event_key: canonical_event_key.to_string(),
                source,
                market_id: payload.market_id.clone(),
                outcome_name: o.name.clone(),
                probability,
                price: o.price,
                timestamp,
            })
        })
        .collect()
}

pub struct KalshiClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl KalshiClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs_f64(config.kalshi_timeout_seconds))
            .build()
            .context("failed to build Kalshi HTTP client")?;
        Ok(KalshiClient {
            http,
            base_url: config.kalshi_base_url.clone(),
            api_key: config.kalshi_api_key.clone(),
        })
    }

    /// `GET {base}/trade-api/v2/markets/{market_id}` authenticated by
    /// `KALSHI_API_KEY`.
    pub async fn fetch_market(&self, market_id: &str) -> Result<ExchangeMarketPayload, EngineError> {
        let url = format!("{}/trade-api/v2/markets/{market_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamTransient(format!("kalshi request failed: {e}")))?;
        if resp.status().is_client_error() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamPermanent(format!("kalshi {status}: {body}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(EngineError::UpstreamTransient(format!("kalshi returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| EngineError::Validation(format!("kalshi response decode failed: {e}")))
    }
}

pub struct PolymarketClient {
    http: Client,
    base_url: String,
}

impl PolymarketClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs_f64(config.polymarket_timeout_seconds))
            .build()
            .context("failed to build Polymarket HTTP client")?;
        Ok(PolymarketClient {
            http,
            base_url: config.polymarket_base_url.clone(),
        })
    }

    /// `GET {base}/markets/{market_id}`, unauthenticated (public CLOB data).
    pub async fn fetch_market(&self, market_id: &str) -> Result<ExchangeMarketPayload, EngineError> {
        let url = format!("{}/markets/{market_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamTransient(format!("polymarket request failed: {e}")))?;
        if resp.status().is_client_error() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamPermanent(format!("polymarket {status}: {body}")));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(EngineError::UpstreamTransient(format!("polymarket returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| EngineError::Validation(format!("polymarket response decode failed: {e}")))
    }
}

#[derive(Debug, Default)]
pub struct ExchangeIngestOutcome {
    pub markets_seen: usize,
    pub quotes_inserted: i64,
    pub canonical_event_keys: Vec<String>,
    pub failed_market_ids: Vec<String>,
}

/// Polls Kalshi for every alignment with a `kalshi_market_id`, and
/// Polymarket for every alignment with a `polymarket_market_id` when
/// `ENABLE_POLYMARKET_INGEST` is set, capped at `*_MAX_PER_CYCLE` markets
/// per source per tick.
pub async fn ingest_cycle(
    db: &Database,
    kalshi: &KalshiClient,
    polymarket: Option<&PolymarketClient>,
    config: &Config,
) -> anyhow::Result<ExchangeIngestOutcome> {
    use crate::db::models::ExchangeSource;

    let mut outcome = ExchangeIngestOutcome::default();
    let alignments = db.list_alignments()?;

    let kalshi_targets: Vec<_> = alignments
        .iter()
        .filter_map(|a| a.kalshi_market_id.as_ref().map(|m| (a.canonical_event_key.clone(), m.clone())))
        .take(config.kalshi_max_per_cycle)
        .collect();

    for (canonical_event_key, market_id) in kalshi_targets {
        outcome.markets_seen += 1;
        match kalshi.fetch_market(&market_id).await {
            Ok(payload) => {
                record_quotes(db, &canonical_event_key, ExchangeSource::Kalshi, &payload, &mut outcome)?;
            }
            Err(e) => {
                warn!(market_id = %market_id, error = %e, "kalshi fetch failed, skipping market");
                outcome.failed_market_ids.push(market_id);
            }
        }
    }

    if config.enable_polymarket_ingest {
        if let Some(polymarket) = polymarket {
            let poly_targets: Vec<_> = alignments
                .iter()
                .filter_map(|a| a.polymarket_market_id.as_ref().map(|m| (a.canonical_event_key.clone(), m.clone())))
                .take(config.polymarket_max_per_cycle)
                .collect();

            for (canonical_event_key, market_id) in poly_targets {
                outcome.markets_seen += 1;
                match polymarket.fetch_market(&market_id).await {
                    Ok(payload) => {
                        record_quotes(db, &canonical_event_key, ExchangeSource::Polymarket, &payload, &mut outcome)?;
                    }
                    Err(e) => {
                        warn!(market_id = %market_id, error = %e, "polymarket fetch failed, skipping market");
                        outcome.failed_market_ids.push(market_id);
                    }
                }
            }
        }
    }

    Ok(outcome)
}

fn record_quotes(
    db: &Database,
    canonical_event_key: &str,
    source: crate::db::models::ExchangeSource,
    payload: &ExchangeMarketPayload,
    outcome: &mut ExchangeIngestOutcome,
) -> anyhow::Result<()> {
    let mut any = false;
    for quote in parse_market_quotes(canonical_event_key, source, payload) {
        if db.insert_exchange_quote_event(&quote)? {
            outcome.quotes_inserted += 1;
            any = true;
            debug!(
                canonical_event_key, market_id = %payload.market_id, outcome = %quote.outcome_name,
                probability = quote.probability, "exchange quote recorded"
            );
        }
    }
    if any {
        outcome.canonical_event_keys.push(canonical_event_key.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ExchangeSource;

    fn sample_payload() -> ExchangeMarketPayload {
        ExchangeMarketPayload {
            market_id: "KXNBA-BOS".into(),
            outcomes: vec![
                ExchangeOutcomePayload { name: "YES".into(), probability: Some(0.62), price: Some(0.62) },
                ExchangeOutcomePayload { name: "NO".into(), probability: None, price: None },
            ],
            timestamp: Some(Utc::now()),
        }
    }

    #[test]
    fn missing_probability_skips_outcome_not_market() {
        let quotes = parse_market_quotes("evt1", ExchangeSource::Kalshi, &sample_payload());
        assert_eq!(quotes.len(), 1);
        assert_eq!(quotes[0].outcome_name, "YES");
    }

    #[test]
    fn missing_timestamp_falls_back_to_now() {
        let mut payload = sample_payload();
        payload.timestamp = None;
        let before = Utc::now() - chrono::Duration::seconds(1);
        let quotes = parse_market_quotes("evt1", ExchangeSource::Kalshi, &payload);
        assert!(quotes[0].timestamp >= before);
    }

    #[test]
    fn record_quotes_dedupes_identical_rows() {
        let db = Database::open(":memory:").unwrap();
        let mut outcome = ExchangeIngestOutcome::default();
        let payload = sample_payload();
        record_quotes(&db, "evt1", ExchangeSource::Kalshi, &payload, &mut outcome).unwrap();
        record_quotes(&db, "evt1", ExchangeSource::Kalshi, &payload, &mut outcome).unwrap();
        assert_eq!(outcome.quotes_inserted, 1);
    }
}
