//! C1 — odds ingestion, plus the C4 quote-move ledger it feeds directly:
//! every changed `(event, book, market, outcome)` quote is both appended as
//! an `OddsSnapshot` and recorded as a `QuoteMoveEvent` in the same pass,
//! since both fire on the exact same "differs from last observed" condition.

use crate::config::{venue_tier, Config};
use crate::db::models::{Game, OddsSnapshot, QuoteMoveEvent, VenueTier};
use crate::db::Database;
use crate::error::EngineError;
use crate::kv::KvStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
pub(crate) struct OddsEventPayload {
    pub id: String,
    pub sport_key: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<BookmakerPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BookmakerPayload {
    pub key: String,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<MarketPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MarketPayload {
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<OutcomePayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutcomePayload {
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub point: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoricalOddsResponse {
    pub data: Vec<OddsEventPayload>,
}

/// One changed quote ready to be persisted as a snapshot (and, when a prior
/// value existed, a quote-move event).
pub(crate) struct ParsedQuote {
    pub sportsbook_key: String,
    pub market: String,
    pub outcome_name: String,
    pub line: Option<f64>,
    pub price: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Flattens one event payload's bookmakers/markets/outcomes into quotes,
/// applying the bookmaker allowlist and configured market set. Malformed
/// outcomes (unparseable price) are skipped individually, never the event.
pub(crate) fn parse_event_quotes(
    event: &OddsEventPayload,
    bookmaker_allow: Option<&[String]>,
    markets: &[String],
) -> Vec<ParsedQuote> {
    let mut out = Vec::new();
    for book in &event.bookmakers {
        if let Some(allow) = bookmaker_allow {
            if !allow.iter().any(|b| b.eq_ignore_ascii_case(&book.key)) {
                continue;
            }
        }
        let fetched_at = book.last_update.unwrap_or_else(Utc::now);
        for market in &book.markets {
            if !markets.iter().any(|m| m == &market.key) {
                continue;
            }
            for outcome in &market.outcomes {
                if !outcome.price.is_finite() {
                    continue;
                }
                out.push(ParsedQuote {
                    sportsbook_key: book.key.clone(),
                    market: market.key.clone(),
                    outcome_name: outcome.name.clone(),
                    line: outcome.point,
                    price: outcome.price.round() as i64,
                    fetched_at,
                });
            }
        }
    }
    out
}

/// Thin client over the-odds-api's `/sports/{sport}/odds` and
/// `/sports/{sport}/odds-history` endpoints, with bounded retry on
/// transient failure and immediate surfacing of permanent (4xx) errors.
pub struct OddsApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    retry_attempts: u32,
    backoff_seconds: f64,
    backoff_max_seconds: f64,
}

pub struct OddsApiResponse {
    pub events: Vec<OddsEventPayload>,
    pub requests_remaining: Option<i64>,
    pub requests_used: Option<i64>,
    pub requests_last: Option<i64>,
}

impl OddsApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.odds_api_timeout_seconds))
            .build()
            .context("failed to build odds API HTTP client")?;
        Ok(OddsApiClient {
            http,
            base_url: config.odds_api_base_url.clone(),
            api_key: config.odds_api_key.clone(),
            retry_attempts: config.odds_api_retry_attempts,
            backoff_seconds: config.odds_api_retry_backoff_seconds,
            backoff_max_seconds: config.odds_api_retry_backoff_max_seconds,
        })
    }

    async fn get_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response, EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.http.get(url).query(query).send().await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(EngineError::UpstreamPermanent(format!("{status}: {body}")));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= self.retry_attempts {
                        return Err(EngineError::UpstreamTransient(format!(
                            "odds API returned {status} after {attempt} attempts"
                        )));
                    }
                    warn!(%status, attempt, "odds API transient error, retrying");
                }
                Err(e) => {
                    if attempt >= self.retry_attempts {
                        return Err(EngineError::UpstreamTransient(format!(
                            "odds API request failed after {attempt} attempts: {e}"
                        )));
                    }
                    warn!(error = %e, attempt, "odds API request error, retrying");
                }
            }
            let delay = (self.backoff_seconds * 2f64.powi(attempt as i32 - 1)).min(self.backoff_max_seconds);
            tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
        }
    }

    /// `GET /sports/{sport_key}/odds`.
    pub async fn fetch_odds(&self, config: &Config, sport_key: &str) -> Result<OddsApiResponse, EngineError> {
        let url = format!("{}/sports/{sport_key}/odds", self.base_url);
        let mut query = vec![
            ("apiKey", self.api_key.clone()),
            ("regions", config.odds_api_regions.clone()),
            ("markets", config.odds_api_markets.clone()),
            ("oddsFormat", "american".to_string()),
            ("dateFormat", "iso".to_string()),
        ];
        if let Some(bookmakers) = config.odds_api_bookmakers_list() {
            query.push(("bookmakers", bookmakers.join(",")));
        }
        let resp = self.get_with_retry(&url, &query).await?;
        let requests_remaining = header_i64(&resp, "x-requests-remaining");
        let requests_used = header_i64(&resp, "x-requests-used");
        let requests_last = header_i64(&resp, "x-requests-last");
        let events: Vec<OddsEventPayload> = resp
            .json()
            .await
            .map_err(|e| EngineError::Validation(format!("odds API response decode failed: {e}")))?;
        Ok(OddsApiResponse {
            events,
            requests_remaining,
            requests_used,
            requests_last,
        })
    }

    /// `GET /sports/{sport_key}/odds-history` at a specific ISO-Z instant,
    /// used by the CLV backfill job.
    pub async fn fetch_historical_odds(
        &self,
        config: &Config,
        sport_key: &str,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<OddsEventPayload>, EngineError> {
        let url = format!("{}/historical/sports/{sport_key}/odds", self.base_url);
        let query = vec![
            ("apiKey", self.api_key.clone()),
            ("regions", config.odds_api_regions.clone()),
            ("markets", config.odds_api_markets.clone()),
            ("oddsFormat", "american".to_string()),
            ("dateFormat", "iso".to_string()),
            ("eventIds", event_id.to_string()),
            ("date", at.to_rfc3339()),
        ];
        let resp = self.get_with_retry(&url, &query).await?;
        let parsed: HistoricalOddsResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Validation(format!("odds history response decode failed: {e}")))?;
        Ok(parsed.data)
    }
}

fn header_i64(resp: &reqwest::Response, name: &str) -> Option<i64> {
    resp.headers().get(name)?.to_str().ok()?.parse().ok()
}

/// Outcome of one C1 ingestion pass, per the `IngestCycle` contract.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub events_seen: usize,
    pub snapshots_inserted: i64,
    pub event_ids: Vec<String>,
    pub requests_remaining: Option<i64>,
    pub requests_used: Option<i64>,
    pub requests_last: Option<i64>,
    pub failed_sport_keys: Vec<String>,
}

/// Polls every configured sport, upserts games, appends changed quotes as
/// snapshots + quote-move events, and dedupes unchanged quotes via the KV
/// cache. A sport whose fetch fails after retries is logged and skipped;
/// the rest of the cycle continues (per-sport failure isolation).
pub async fn ingest_cycle(
    db: &Database,
    kv: &KvStore,
    client: &OddsApiClient,
    config: &Config,
) -> Result<IngestOutcome> {
    let mut outcome = IngestOutcome::default();
    let bookmaker_allow = config.odds_api_bookmakers_list();
    let markets = config.odds_api_markets_list();
    let dedupe_ttl = (config.snapshot_retention_hours as u64).saturating_mul(3600).max(60);

    for sport_key in config.odds_api_sport_keys_list() {
        let response = match client.fetch_odds(config, &sport_key).await {
            Ok(r) => r,
            Err(e) => {
                warn!(sport_key = %sport_key, error = %e, "odds ingestion failed for sport, skipping");
                outcome.failed_sport_keys.push(sport_key.clone());
                continue;
            }
        };
        outcome.requests_remaining = response.requests_remaining.or(outcome.requests_remaining);
        outcome.requests_used = response.requests_used.or(outcome.requests_used);
        outcome.requests_last = response.requests_last.or(outcome.requests_last);

        for event in &response.events {
            outcome.events_seen += 1;
            if let Err(e) = ingest_event(db, kv, event, bookmaker_allow.as_deref(), &markets, dedupe_ttl, &mut outcome) {
                warn!(event_id = %event.id, error = %e, "malformed odds event, skipping");
            }
        }
    }

    kv.publish("odds_update");
    info!(
        events_seen = outcome.events_seen,
        snapshots_inserted = outcome.snapshots_inserted,
        "odds ingestion cycle complete"
    );
    Ok(outcome)
}

fn ingest_event(
    db: &Database,
    kv: &KvStore,
    event: &OddsEventPayload,
    bookmaker_allow: Option<&[String]>,
    markets: &[String],
    dedupe_ttl: u64,
    outcome: &mut IngestOutcome,
) -> Result<()> {
    db.upsert_game(&Game {
        event_id: event.id.clone(),
        sport_key: event.sport_key.clone(),
        commence_time: event.commence_time,
        home_team: event.home_team.clone(),
        away_team: event.away_team.clone(),
    })?;

    let mut touched = false;
    for quote in parse_event_quotes(event, bookmaker_allow, markets) {
        let dedupe_key = format!(
            "lastsnap:{}:{}:{}:{}",
            event.id, quote.sportsbook_key, quote.market, quote.outcome_name
        );
        let dedupe_value = format!("{}|{}", quote.line.map(|l| l.to_string()).unwrap_or_default(), quote.price);
        if kv.get(&dedupe_key).as_deref() == Some(dedupe_value.as_str()) {
            continue;
        }

        let prior = db.last_snapshot_for_key(&event.id, &quote.sportsbook_key, &quote.market, &quote.outcome_name)?;
        if let Some(prior) = &prior {
            if prior.line == quote.line && prior.price == quote.price {
                kv.set_ex(&dedupe_key, &dedupe_value, dedupe_ttl);
                continue;
            }
        }

        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: event.id.clone(),
            sport_key: event.sport_key.clone(),
            sportsbook_key: quote.sportsbook_key.clone(),
            market: quote.market.clone(),
            outcome_name: quote.outcome_name.clone(),
            line: quote.line,
            price: quote.price,
            fetched_at: quote.fetched_at,
        })?;
        outcome.snapshots_inserted += 1;
        touched = true;

        if quote.market == "spreads" {
            if let Some(prior) = prior {
                db.insert_quote_move_event(&QuoteMoveEvent {
                    id: None,
                    event_id: event.id.clone(),
                    market_key: quote.market.clone(),
                    outcome_name: quote.outcome_name.clone(),
                    venue: quote.sportsbook_key.clone(),
                    venue_tier: VenueTier::from_str(venue_tier(&quote.sportsbook_key)),
                    old_line: prior.line,
                    new_line: quote.line,
                    delta: match (prior.line, quote.line) {
                        (Some(a), Some(b)) => Some(b - a),
                        _ => None,
                    },
                    old_price: Some(prior.price),
                    new_price: Some(quote.price),
                    timestamp: quote.fetched_at,
                })?;
            }
        }

        kv.set_ex(&dedupe_key, &dedupe_value, dedupe_ttl);
        debug!(
            event_id = %event.id, book = %quote.sportsbook_key, market = %quote.market,
            outcome = %quote.outcome_name, "quote changed, snapshot appended"
        );
    }

    if touched {
        outcome.event_ids.push(event.id.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> OddsEventPayload {
        OddsEventPayload {
            id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            commence_time: Utc::now() + chrono::Duration::hours(3),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
            bookmakers: vec![BookmakerPayload {
                key: "pinnacle".into(),
                last_update: Some(Utc::now()),
                markets: vec![MarketPayload {
                    key: "spreads".into(),
                    outcomes: vec![
                        OutcomePayload { name: "BOS".into(), price: -110.0, point: Some(-3.5) },
                        OutcomePayload { name: "LAL".into(), price: -110.0, point: Some(3.5) },
                    ],
                }],
            }],
        }
    }

    #[test]
    fn parse_event_quotes_respects_bookmaker_allowlist() {
        let event = sample_event();
        let markets = vec!["spreads".to_string()];
        let allow = vec!["draftkings".to_string()];
        assert!(parse_event_quotes(&event, Some(&allow), &markets).is_empty());
        assert_eq!(parse_event_quotes(&event, None, &markets).len(), 2);
    }

    #[test]
    fn parse_event_quotes_skips_markets_not_requested() {
        let event = sample_event();
        let markets = vec!["totals".to_string()];
        assert!(parse_event_quotes(&event, None, &markets).is_empty());
    }

    #[test]
    fn ingest_event_inserts_snapshot_and_quote_move_on_change() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let mut outcome = IngestOutcome::default();
        let markets = vec!["spreads".to_string()];

        let first = sample_event();
        ingest_event(&db, &kv, &first, None, &markets, 3600, &mut outcome).unwrap();
        assert_eq!(outcome.snapshots_inserted, 2);

        let mut second = sample_event();
        second.bookmakers[0].markets[0].outcomes[0].point = Some(-4.0);
        second.bookmakers[0].last_update = Some(Utc::now() + chrono::Duration::seconds(30));
        ingest_event(&db, &kv, &second, None, &markets, 3600, &mut outcome).unwrap();
        assert_eq!(outcome.snapshots_inserted, 3);

        let moves = db.list_quote_moves("evt1", "spreads", Utc::now() - chrono::Duration::minutes(5)).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].old_line, Some(-3.5));
        assert_eq!(moves[0].new_line, Some(-4.0));
    }

    #[test]
    fn repeated_identical_quote_is_not_reinserted() {
        let db = Database::open(":memory:").unwrap();
        let kv = KvStore::new();
        let mut outcome = IngestOutcome::default();
        let markets = vec!["spreads".to_string()];
        let event = sample_event();
        ingest_event(&db, &kv, &event, None, &markets, 3600, &mut outcome).unwrap();
        ingest_event(&db, &kv, &event, None, &markets, 3600, &mut outcome).unwrap();
        assert_eq!(outcome.snapshots_inserted, 2);
    }
}
