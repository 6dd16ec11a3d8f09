//! Divergence classification: compares the latest confirmed sportsbook
//! structural break against the latest exchange probability crossing for a
//! canonical event and assigns one of ALIGNED / EXCHANGE_LEADS /
//! SPORTSBOOK_LEADS / OPPOSED / UNCONFIRMED / REVERTED, in that check
//! order (REVERTED short-circuits everything else).

use super::{decimal_to_f64, detect_prob_crossings, ProbCrossing};
use crate::db::models::{BreakDirection, CrossMarketDivergenceEvent, DivergenceType, LeadSource, StructuralEvent};
use crate::db::Database;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

const FRESHNESS_MINUTES: i64 = 15;
const ALIGNMENT_WINDOW_MINUTES: i64 = 10;
const REVERSAL_WINDOW_MINUTES: i64 = 30;

fn idempotency_key(
    canonical_event_key: &str,
    divergence_type: DivergenceType,
    sb_ts: Option<DateTime<Utc>>,
    ex_ts: Option<DateTime<Utc>>,
    sb_thresh: Option<f64>,
    ex_thresh: Option<f64>,
) -> String {
    format!(
        "{canonical_event_key}|{}|{}|{}|{}|{}",
        divergence_type.as_str(),
        sb_ts.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ex_ts.map(|t| t.to_rfc3339()).unwrap_or_default(),
        sb_thresh.map(|v| v.to_string()).unwrap_or_default(),
        ex_thresh.map(|v| v.to_string()).unwrap_or_default(),
    )
}

fn latest_exchange_crossing(db: &Database, alignment: &crate::db::models::CanonicalEventAlignment) -> Result<Option<ProbCrossing>> {
    let since = Utc::now() - ChronoDuration::hours(24);
    let mut quotes = Vec::new();
    if let Some(market_id) = &alignment.kalshi_market_id {
        quotes.extend(db.list_exchange_quotes("KALSHI", market_id, since)?);
    }
    if let Some(market_id) = &alignment.polymarket_market_id {
        quotes.extend(db.list_exchange_quotes("POLYMARKET", market_id, since)?);
    }
    let crossings = detect_prob_crossings(&quotes);
    Ok(crossings.into_iter().max_by_key(|c| c.timestamp))
}

fn has_fresh_exchange_activity(db: &Database, alignment: &crate::db::models::CanonicalEventAlignment) -> Result<bool> {
    let since = Utc::now() - ChronoDuration::minutes(FRESHNESS_MINUTES);
    let mut any = false;
    if let Some(market_id) = &alignment.kalshi_market_id {
        any |= !db.list_exchange_quotes("KALSHI", market_id, since)?.is_empty();
    }
    if let Some(market_id) = &alignment.polymarket_market_id {
        any |= !db.list_exchange_quotes("POLYMARKET", market_id, since)?.is_empty();
    }
    Ok(any)
}

fn has_fresh_sportsbook_activity(db: &Database, sportsbook_event_id: &str) -> Result<bool> {
    let since = Utc::now() - ChronoDuration::minutes(FRESHNESS_MINUTES);
    Ok(!db.list_quote_moves(sportsbook_event_id, "spreads", since)?.is_empty())
}

/// Runs one classification pass for a canonical event and persists the
/// outcome (conflict-ignore on idempotency key). Returns `true` if a new
/// row was written.
pub fn classify_and_persist(db: &Database, canonical_event_key: &str) -> Result<bool> {
    let Some(alignment) = db.get_alignment(canonical_event_key)? else {
        return Ok(false);
    };
    let latest_structural: Option<StructuralEvent> = db
        .list_structural_events(&alignment.sportsbook_event_id)?
        .into_iter()
        .next();
    let latest_crossing = latest_exchange_crossing(db, &alignment)?;

    let now = Utc::now();

    if let Some(structural) = &latest_structural {
        if structural.reversal_detected {
            if let Some(reversal_timestamp) = structural.reversal_timestamp {
                if let Some(prior) = db
                    .list_divergence_events(canonical_event_key)?
                    .into_iter()
                    .find(|d| !d.resolved && matches!(d.divergence_type, DivergenceType::Opposed | DivergenceType::ExchangeLeads | DivergenceType::SportsbookLeads))
                {
                    let prior_break = [prior.sportsbook_break_timestamp, prior.exchange_break_timestamp]
                        .into_iter()
                        .flatten()
                        .max();
                    if let Some(prior_break) = prior_break {
                        if (reversal_timestamp - prior_break).num_minutes().abs() <= REVERSAL_WINDOW_MINUTES {
                            let key = idempotency_key(
                                canonical_event_key,
                                DivergenceType::Reverted,
                                Some(reversal_timestamp),
                                prior.exchange_break_timestamp,
                                Some(structural.threshold_value),
                                prior.exchange_probability_threshold,
                            );
                            let row = CrossMarketDivergenceEvent {
                                id: None,
                                canonical_event_key: canonical_event_key.to_string(),
                                divergence_type: DivergenceType::Reverted,
                                lead_source: prior.lead_source,
                                sportsbook_threshold_value: Some(structural.threshold_value),
                                exchange_probability_threshold: prior.exchange_probability_threshold,
                                sportsbook_break_timestamp: Some(reversal_timestamp),
                                exchange_break_timestamp: prior.exchange_break_timestamp,
                                lag_seconds: None,
                                resolved: false,
                                resolved_at: None,
                                resolution_type: None,
                                idempotency_key: key.clone(),
                            };
                            let inserted = db.insert_divergence_event(&row)?;
                            if inserted {
                                db.resolve_prior_unresolved_divergences(canonical_event_key, now, "REVERTED", &key)?;
                            }
                            return Ok(inserted);
                        }
                    }
                }
            }
        }
    }

    let sb_fresh = latest_structural
        .as_ref()
        .map(|s| (now - s.confirmation_timestamp).num_minutes() <= FRESHNESS_MINUTES)
        .unwrap_or(false);
    let ex_fresh = latest_crossing
        .as_ref()
        .map(|c| (now - c.timestamp).num_minutes() <= FRESHNESS_MINUTES)
        .unwrap_or(false);

    let (divergence_type, lead_source) = if sb_fresh && ex_fresh {
        let structural = latest_structural.as_ref().unwrap();
        let crossing = latest_crossing.as_ref().unwrap();
        let delta_minutes = (structural.confirmation_timestamp - crossing.timestamp).num_minutes().abs();
        if delta_minutes <= ALIGNMENT_WINDOW_MINUTES {
            let aligned = directions_agree(structural.break_direction, crossing.direction);
            if aligned {
                (DivergenceType::Aligned, LeadSource::None)
            } else {
                (DivergenceType::Opposed, if crossing.timestamp < structural.confirmation_timestamp {
                    LeadSource::Exchange
                } else {
                    LeadSource::Sportsbook
                })
            }
        } else if crossing.timestamp < structural.confirmation_timestamp {
            (DivergenceType::ExchangeLeads, LeadSource::Exchange)
        } else {
            (DivergenceType::SportsbookLeads, LeadSource::Sportsbook)
        }
    } else if sb_fresh && !ex_fresh {
        if has_fresh_exchange_activity(db, &alignment)? {
            (DivergenceType::Unconfirmed, LeadSource::Sportsbook)
        } else {
            return Ok(false);
        }
    } else if ex_fresh && !sb_fresh {
        if has_fresh_sportsbook_activity(db, &alignment.sportsbook_event_id)? {
            (DivergenceType::Unconfirmed, LeadSource::Exchange)
        } else {
            return Ok(false);
        }
    } else {
        return Ok(false);
    };

    let sb_ts = latest_structural.as_ref().map(|s| s.confirmation_timestamp);
    let ex_ts = latest_crossing.as_ref().map(|c| c.timestamp);
    let sb_thresh = latest_structural.as_ref().map(|s| s.threshold_value);
    let ex_thresh = latest_crossing.as_ref().map(|c| decimal_to_f64(c.threshold));
    let lag_seconds = match (sb_ts, ex_ts) {
        (Some(a), Some(b)) => Some((a - b).num_seconds().abs()),
        _ => None,
    };
    let key = idempotency_key(canonical_event_key, divergence_type, sb_ts, ex_ts, sb_thresh, ex_thresh);

    let row = CrossMarketDivergenceEvent {
        id: None,
        canonical_event_key: canonical_event_key.to_string(),
        divergence_type,
        lead_source,
        sportsbook_threshold_value: sb_thresh,
        exchange_probability_threshold: ex_thresh,
        sportsbook_break_timestamp: sb_ts,
        exchange_break_timestamp: ex_ts,
        lag_seconds,
        resolved: false,
        resolved_at: None,
        resolution_type: None,
        idempotency_key: key.clone(),
    };
    let inserted = db.insert_divergence_event(&row)?;
    if inserted && matches!(divergence_type, DivergenceType::Aligned) {
        db.resolve_prior_unresolved_divergences(canonical_event_key, now, "ALIGNED", &key)?;
    }
    Ok(inserted)
}

fn directions_agree(sportsbook: BreakDirection, exchange: BreakDirection) -> bool {
    sportsbook == exchange
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        CanonicalEventAlignment, ExchangeQuoteEvent, ExchangeSource, ThresholdType, VenueTier,
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

    fn seed_structural(db: &Database, confirmation_timestamp: DateTime<Utc>, direction: BreakDirection) {
        db.upsert_structural_event(&StructuralEvent {
            id: None,
            event_id: "sb1".into(),
            market_key: "spreads".into(),
            outcome_name: "BOS".into(),
            threshold_value: -3.5,
            threshold_type: ThresholdType::Half,
            break_direction: direction,
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

    fn seed_exchange_quotes(db: &Database, now: DateTime<Utc>, probs: &[(f64, i64)]) {
        for (prob, minutes_ago) in probs {
            db.insert_exchange_quote_event(&ExchangeQuoteEvent {
                id: None,
                canonical_event_key: "evt1".into(),
                source: ExchangeSource::Kalshi,
                market_id: "KXNBA-BOS".into(),
                outcome_name: "YES".into(),
                probability: *prob,
                price: Some(*prob),
                timestamp: now - chrono::Duration::minutes(*minutes_ago),
            })
            .unwrap();
        }
    }

    #[test]
    fn same_direction_within_window_is_aligned() {
        let db = Database::open(":memory:").unwrap();
        seed_alignment(&db);
        let now = Utc::now();
        seed_structural(&db, now - chrono::Duration::minutes(2), BreakDirection::Down);
        seed_exchange_quotes(&db, now, &[(0.60, 10), (0.50, 3)]);
        let inserted = classify_and_persist(&db, "evt1").unwrap();
        assert!(inserted);
        let rows = db.list_divergence_events("evt1").unwrap();
        assert_eq!(rows[0].divergence_type, DivergenceType::Aligned);
    }

    #[test]
    fn opposite_direction_within_window_is_opposed() {
        let db = Database::open(":memory:").unwrap();
        seed_alignment(&db);
        let now = Utc::now();
        seed_structural(&db, now - chrono::Duration::minutes(2), BreakDirection::Down);
        seed_exchange_quotes(&db, now, &[(0.50, 10), (0.60, 3)]);
        let inserted = classify_and_persist(&db, "evt1").unwrap();
        assert!(inserted);
        let rows = db.list_divergence_events("evt1").unwrap();
        assert_eq!(rows[0].divergence_type, DivergenceType::Opposed);
    }

    #[test]
    fn no_fresh_activity_on_either_side_yields_nothing() {
        let db = Database::open(":memory:").unwrap();
        seed_alignment(&db);
        let inserted = classify_and_persist(&db, "evt1").unwrap();
        assert!(!inserted);
    }
}
