//! Lead/lag matching: for each confirmed `StructuralEvent` on the
//! sportsbook side of a canonical alignment, finds the nearest exchange
//! probability-grid crossing within ±10 minutes and records which side
//! moved first.

use super::{decimal_to_f64, detect_prob_crossings};
use crate::db::models::{CrossMarketLeadLagEvent, LeadSource};
use crate::db::Database;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

const LOOKBACK_HOURS: i64 = 24;
const MATCH_WINDOW_MINUTES: i64 = 10;

/// Finds the nearest probability crossing timestamp to `target` among
/// `candidates`, within `MATCH_WINDOW_MINUTES`. Ties break on smaller
/// absolute delta, then earlier timestamp (both already guaranteed by a
/// stable sort on `(delta, timestamp)`).
fn nearest_within_window(target: DateTime<Utc>, candidates: &[DateTime<Utc>]) -> Option<DateTime<Utc>> {
    let window_seconds = ChronoDuration::minutes(MATCH_WINDOW_MINUTES).num_seconds();
    candidates
        .iter()
        .filter(|&&ts| (ts - target).num_seconds().abs() <= window_seconds)
        .min_by(|&&a, &&b| {
            let da = (a - target).num_seconds().abs();
            let db_ = (b - target).num_seconds().abs();
            da.cmp(&db_).then(a.cmp(&b))
        })
        .copied()
}

/// Runs lead/lag matching for one canonical event and persists any new
/// `CrossMarketLeadLagEvent` rows (conflict-ignore on identity key).
pub fn detect_and_persist(db: &Database, canonical_event_key: &str) -> Result<usize> {
    let Some(alignment) = db.get_alignment(canonical_event_key)? else {
        return Ok(0);
    };
    let structural_events = db.list_structural_events(&alignment.sportsbook_event_id)?;
    if structural_events.is_empty() {
        return Ok(0);
    }

    let since = Utc::now() - ChronoDuration::hours(LOOKBACK_HOURS);
    let mut quotes = Vec::new();
    if let Some(market_id) = &alignment.kalshi_market_id {
        quotes.extend(db.list_exchange_quotes("KALSHI", market_id, since)?);
    }
    if let Some(market_id) = &alignment.polymarket_market_id {
        quotes.extend(db.list_exchange_quotes("POLYMARKET", market_id, since)?);
    }
    if quotes.is_empty() {
        return Ok(0);
    }
    let crossings = detect_prob_crossings(&quotes);
    let crossing_timestamps: Vec<DateTime<Utc>> = crossings.iter().map(|c| c.timestamp).collect();

    let mut written = 0;
    for structural in &structural_events {
        let Some(matched_ts) = nearest_within_window(structural.confirmation_timestamp, &crossing_timestamps) else {
            continue;
        };
        let Some(matched) = crossings.iter().find(|c| c.timestamp == matched_ts) else {
            continue;
        };

        let lead_source = if matched.timestamp < structural.confirmation_timestamp {
            LeadSource::Exchange
        } else {
            LeadSource::Sportsbook
        };
        let lag_seconds = (structural.confirmation_timestamp - matched.timestamp).num_seconds().abs();

        let event = CrossMarketLeadLagEvent {
            id: None,
            canonical_event_key: canonical_event_key.to_string(),
            threshold_type: structural.threshold_type,
            sportsbook_threshold_value: structural.threshold_value,
            exchange_probability_threshold: decimal_to_f64(matched.threshold),
            lead_source,
            sportsbook_break_timestamp: structural.confirmation_timestamp,
            exchange_break_timestamp: matched.timestamp,
            lag_seconds,
        };
        if db.insert_lead_lag_event(&event)? {
            written += 1;
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        BreakDirection, CanonicalEventAlignment, ExchangeQuoteEvent, ExchangeSource, StructuralEvent, ThresholdType,
        VenueTier,
    };

    fn seed_alignment(db: &Database) {
        db.upsert_canonical_alignment(&CanonicalEventAlignment {
            canonical_event_key: "evt1".into(),
            sport: "basketball".into(),
            league: "nba".into(),
            home_team: "BOS".into(),
            away_team: "LAL".into(),
            start_time: Utc::now() + chrono::Duration::hours(2),
            sportsbook_event_id: "sb1".into(),
            kalshi_market_id: Some("KXNBA-BOS".into()),
            polymarket_market_id: None,
        })
        .unwrap();
    }

    fn seed_structural(db: &Database, confirmation_timestamp: DateTime<Utc>) {
        db.upsert_structural_event(&StructuralEvent {
            id: None,
            event_id: "sb1".into(),
            market_key: "spreads".into(),
            outcome_name: "BOS".into(),
            threshold_value: -3.5,
            threshold_type: ThresholdType::Half,
            break_direction: BreakDirection::Down,
            origin_venue: "pinnacle".into(),
            origin_venue_tier: VenueTier::T1,
            origin_timestamp: confirmation_timestamp,
            confirmation_timestamp,
            adoption_percentage: Some(1.0),
            adoption_count: 1,
            active_venue_count: 1,
            time_to_consensus_seconds: Some(0),
            dispersion_pre: None,
            dispersion_post: None,
            break_hold_minutes: 5.0,
            reversal_detected: false,
            reversal_timestamp: None,
        })
        .unwrap();
    }

    #[test]
    fn matches_nearest_crossing_and_tags_lead_source() {
        let db = Database::open(":memory:").unwrap();
        seed_alignment(&db);
        let now = Utc::now();
        seed_structural(&db, now);
        db.insert_exchange_quote_event(&ExchangeQuoteEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            source: ExchangeSource::Kalshi,
            market_id: "KXNBA-BOS".into(),
            outcome_name: "YES".into(),
            probability: 0.50,
            price: Some(0.50),
            timestamp: now - chrono::Duration::minutes(9),
        })
        .unwrap();
        db.insert_exchange_quote_event(&ExchangeQuoteEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            source: ExchangeSource::Kalshi,
            market_id: "KXNBA-BOS".into(),
            outcome_name: "YES".into(),
            probability: 0.60,
            price: Some(0.60),
            timestamp: now - chrono::Duration::minutes(3),
        })
        .unwrap();

        let written = detect_and_persist(&db, "evt1").unwrap();
        assert_eq!(written, 1);
        let rows = db.list_lead_lag_events("evt1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lead_source, LeadSource::Exchange);
    }

    #[test]
    fn no_crossing_within_window_yields_nothing() {
        let db = Database::open(":memory:").unwrap();
        seed_alignment(&db);
        let now = Utc::now();
        seed_structural(&db, now);
        db.insert_exchange_quote_event(&ExchangeQuoteEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            source: ExchangeSource::Kalshi,
            market_id: "KXNBA-BOS".into(),
            outcome_name: "YES".into(),
            probability: 0.50,
            price: Some(0.50),
            timestamp: now - chrono::Duration::minutes(60),
        })
        .unwrap();
        db.insert_exchange_quote_event(&ExchangeQuoteEvent {
            id: None,
            canonical_event_key: "evt1".into(),
            source: ExchangeSource::Kalshi,
            market_id: "KXNBA-BOS".into(),
            outcome_name: "YES".into(),
            probability: 0.60,
            price: Some(0.60),
            timestamp: now - chrono::Duration::minutes(50),
        })
        .unwrap();
        let written = detect_and_persist(&db, "evt1").unwrap();
        assert_eq!(written, 0);
    }
}
