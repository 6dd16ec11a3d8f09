//! C6 — structural-event analyser. Walks the quote-move ledger for one
//! event's `spreads` market and turns integer/half-point threshold
//! crossings into confirmed `StructuralEvent` rows, gated on a Tier-1 venue
//! alone or two distinct venues agreeing. Crossing enumeration uses
//! `rust_decimal` rather than floats so a line landing exactly on a 0.5
//! boundary is never missed or double-counted to binary rounding drift.

use crate::db::models::{
    BreakDirection, QuoteMoveEvent, StructuralEvent, StructuralEventVenueParticipation,
    ThresholdType, VenueTier,
};
use crate::db::Database;
use crate::oddsmath::pstdev;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

const MARKET: &str = "spreads";
const ADOPTION_WINDOW_MINUTES: i64 = 5;
const DISPERSION_WINDOW_MINUTES: i64 = 5;
const REVERSAL_WINDOW_MINUTES: i64 = 30;
const FRESHNESS_MINUTES: i64 = 3;

fn half_step() -> Decimal {
    Decimal::from_str("0.5").unwrap()
}

fn to_decimal(v: f64) -> Option<Decimal> {
    Decimal::from_str(&format!("{v:.4}")).ok()
}

fn threshold_type_of(t: Decimal) -> ThresholdType {
    if t.fract().is_zero() {
        ThresholdType::Integer
    } else {
        ThresholdType::Half
    }
}

/// Enumerates every 0.5-grid threshold crossed travelling from `old` to
/// `new`, inclusive of a destination landing exactly on the grid, tagged
/// with the direction of travel. Mirrors
/// `cross_market::enumerate_prob_crossings`, scaled to the sportsbook's
/// half-point line grid instead of the exchange's probability grid.
fn enumerate_crossings(old: f64, new: f64) -> Vec<(Decimal, BreakDirection)> {
    let (Some(old_d), Some(new_d)) = (to_decimal(old), to_decimal(new)) else {
        return vec![];
    };
    if old_d == new_d {
        return vec![];
    }
    let step = half_step();
    let mut out = Vec::new();
    if new_d > old_d {
        let mut k = (old_d / step).floor() + Decimal::ONE;
        loop {
            let t = k * step;
            if t > new_d {
                break;
            }
            out.push((t, BreakDirection::Up));
            k += Decimal::ONE;
        }
    } else {
        let mut k = (old_d / step).ceil() - Decimal::ONE;
        loop {
            let t = k * step;
            if t < new_d {
                break;
            }
            out.push((t, BreakDirection::Down));
            k -= Decimal::ONE;
        }
    }
    out
}

#[derive(Clone)]
struct Candidate {
    venue: String,
    venue_tier: VenueTier,
    timestamp: DateTime<Utc>,
    line_before: Option<f64>,
    line_after: Option<f64>,
    delta: Option<f64>,
}

fn crossings_of(
    moves: &[QuoteMoveEvent],
    outcome_name: &str,
    threshold: Decimal,
    direction: BreakDirection,
    after: DateTime<Utc>,
    before: DateTime<Utc>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for m in moves {
        if m.outcome_name != outcome_name || m.timestamp <= after || m.timestamp > before {
            continue;
        }
        let (Some(old), Some(new)) = (m.old_line, m.new_line) else { continue };
        for (t, d) in enumerate_crossings(old, new) {
            if t == threshold && d == direction {
                out.push(Candidate {
                    venue: m.venue.clone(),
                    venue_tier: m.venue_tier,
                    timestamp: m.timestamp,
                    line_before: m.old_line,
                    line_after: m.new_line,
                    delta: m.delta,
                });
            }
        }
    }
    out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.venue.cmp(&b.venue)));
    out
}

/// First index (in timestamp, venue order) at which the cumulative set of
/// candidates satisfies confirmation: a Tier-1 venue present, or two
/// distinct venues.
fn confirm(sorted: &[Candidate]) -> Option<usize> {
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, c) in sorted.iter().enumerate() {
        if c.venue_tier == VenueTier::T1 {
            return Some(i);
        }
        seen.insert(c.venue.as_str());
        if seen.len() >= 2 {
            return Some(i);
        }
    }
    None
}

fn count_active_venues(
    db: &Database,
    event_id: &str,
    outcome_name: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<i64> {
    let rows = db.list_odds_snapshots_in_window(event_id, MARKET, window_start)?;
    let freshness_start = window_end - ChronoDuration::minutes(FRESHNESS_MINUTES);
    let venues: HashSet<&str> = rows
        .iter()
        .filter(|r| {
            r.outcome_name == outcome_name && r.fetched_at <= window_end && r.fetched_at >= freshness_start
        })
        .map(|r| r.sportsbook_key.as_str())
        .collect();
    Ok(venues.len() as i64)
}

fn latest_line_dispersion(
    db: &Database,
    event_id: &str,
    outcome_name: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Option<f64>> {
    let rows = db.list_odds_snapshots_in_window(event_id, MARKET, window_start)?;
    let mut latest: HashMap<&str, (f64, DateTime<Utc>)> = HashMap::new();
    for r in &rows {
        if r.outcome_name != outcome_name || r.fetched_at > window_end {
            continue;
        }
        let Some(line) = r.line else { continue };
        latest
            .entry(r.sportsbook_key.as_str())
            .and_modify(|(v, ts)| {
                if r.fetched_at > *ts {
                    *v = line;
                    *ts = r.fetched_at;
                }
            })
            .or_insert((line, r.fetched_at));
    }
    let lines: Vec<f64> = latest.values().map(|(v, _)| *v).collect();
    Ok(pstdev(&lines))
}

/// Runs structural analysis for one event's spreads market over the quote
/// moves observed since `lookback_hours` ago. Persists confirmed
/// `StructuralEvent` rows (upsert — reruns on the same ledger recompute the
/// same fields, they don't duplicate rows) plus one participation row per
/// distinct venue that crossed. Returns the number of rows written.
pub fn analyse_event(db: &Database, event_id: &str, lookback_hours: i64) -> Result<usize> {
    let since = Utc::now() - ChronoDuration::hours(lookback_hours);
    let moves = db.list_quote_moves(event_id, MARKET, since)?;
    if moves.is_empty() {
        return Ok(0);
    }

    let mut groups: HashMap<(String, Decimal, BreakDirection), Vec<Candidate>> = HashMap::new();
    for m in &moves {
        let (Some(old), Some(new)) = (m.old_line, m.new_line) else { continue };
        for (threshold, direction) in enumerate_crossings(old, new) {
            groups
                .entry((m.outcome_name.clone(), threshold, direction))
                .or_default()
                .push(Candidate {
                    venue: m.venue.clone(),
                    venue_tier: m.venue_tier,
                    timestamp: m.timestamp,
                    line_before: m.old_line,
                    line_after: m.new_line,
                    delta: m.delta,
                });
        }
    }

    let mut written = 0;
    for ((outcome_name, threshold, direction), mut candidates) in groups {
        candidates.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.venue.cmp(&b.venue)));
        let Some(confirm_idx) = confirm(&candidates) else { continue };

        let origin = candidates[0].clone();
        let confirming = candidates[confirm_idx].clone();
        let threshold_value: f64 = threshold.to_string().parse().unwrap_or(0.0);

        let adoption_start = origin.timestamp;
        let adoption_end = origin.timestamp + ChronoDuration::minutes(ADOPTION_WINDOW_MINUTES);
        let adoption_venues: HashSet<&str> = candidates
            .iter()
            .filter(|c| c.timestamp >= adoption_start && c.timestamp <= adoption_end)
            .map(|c| c.venue.as_str())
            .collect();
        let adoption_count = adoption_venues.len() as i64;

        let active_venue_count =
            count_active_venues(db, event_id, &outcome_name, adoption_start, adoption_end)?.max(adoption_count);
        let adoption_percentage = if active_venue_count > 0 {
            Some(adoption_count as f64 / active_venue_count as f64)
        } else {
            None
        };

        let dispersion_pre = latest_line_dispersion(
            db,
            event_id,
            &outcome_name,
            origin.timestamp - ChronoDuration::minutes(DISPERSION_WINDOW_MINUTES),
            origin.timestamp,
        )?;
        let dispersion_post =
            latest_line_dispersion(db, event_id, &outcome_name, origin.timestamp, adoption_end)?;

        let reversal_window_end = confirming.timestamp + ChronoDuration::minutes(REVERSAL_WINDOW_MINUTES);
        let reversal_candidates = crossings_of(
            &moves,
            &outcome_name,
            threshold,
            direction.opposite(),
            confirming.timestamp,
            reversal_window_end,
        );
        let reversal_confirm_idx = confirm(&reversal_candidates);
        let reversal_detected = reversal_confirm_idx.is_some();
        let reversal_timestamp = reversal_confirm_idx.map(|i| reversal_candidates[i].timestamp);

        let now = Utc::now();
        let hold_until = match reversal_timestamp {
            Some(r) => r.min(reversal_window_end).min(now),
            None => reversal_window_end.min(now),
        };
        let break_hold_minutes = (hold_until - confirming.timestamp).num_seconds() as f64 / 60.0;
        let break_hold_minutes = break_hold_minutes.max(0.0);

        let time_to_consensus_seconds = Some((confirming.timestamp - origin.timestamp).num_seconds());

        let event = StructuralEvent {
            id: None,
            event_id: event_id.to_string(),
            market_key: MARKET.to_string(),
            outcome_name: outcome_name.clone(),
            threshold_value,
            threshold_type: threshold_type_of(threshold),
            break_direction: direction,
            origin_venue: origin.venue.clone(),
            origin_venue_tier: origin.venue_tier,
            origin_timestamp: origin.timestamp,
            confirmation_timestamp: confirming.timestamp,
            adoption_percentage,
            adoption_count,
            active_venue_count,
            time_to_consensus_seconds,
            dispersion_pre,
            dispersion_post,
            break_hold_minutes,
            reversal_detected,
            reversal_timestamp,
        };
        let structural_event_id = db.upsert_structural_event(&event)?;
        written += 1;

        let mut inserted_venues: HashSet<String> = HashSet::new();
        for c in &candidates {
            if !inserted_venues.insert(c.venue.clone()) {
                continue;
            }
            db.insert_participation(&StructuralEventVenueParticipation {
                structural_event_id,
                venue: c.venue.clone(),
                venue_tier: c.venue_tier,
                crossed_at: c.timestamp,
                line_before: c.line_before,
                line_after: c.line_after,
                delta: c.delta,
            })?;
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::OddsSnapshot;

    fn seed_move(db: &Database, venue: &str, tier: VenueTier, old: f64, new: f64, minutes_ago: i64) {
        db.insert_quote_move_event(&QuoteMoveEvent {
            id: None,
            event_id: "evt1".into(),
            market_key: MARKET.into(),
            outcome_name: "BOS".into(),
            venue: venue.into(),
            venue_tier: tier,
            old_line: Some(old),
            new_line: Some(new),
            delta: Some(new - old),
            old_price: Some(-110),
            new_price: Some(-110),
            timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
        })
        .unwrap();
    }

    #[test]
    fn enumerate_crossings_half_grid_up() {
        let crossings = enumerate_crossings(-3.0, -4.5);
        let thresholds: Vec<String> = crossings.iter().map(|(t, _)| t.to_string()).collect();
        assert_eq!(thresholds, vec!["-3.5", "-4", "-4.5"]);
        assert!(crossings.iter().all(|(_, d)| *d == BreakDirection::Down));
    }

    #[test]
    fn enumerate_crossings_handles_no_move() {
        assert!(enumerate_crossings(-3.0, -3.0).is_empty());
    }

    #[test]
    fn tier1_alone_confirms_immediately() {
        let db = Database::open(":memory:").unwrap();
        seed_move(&db, "pinnacle", VenueTier::T1, -3.0, -3.5, 10);
        let written = analyse_event(&db, "evt1", 24).unwrap();
        assert_eq!(written, 1);
        let events = db.list_structural_events("evt1").unwrap();
        assert_eq!(events[0].origin_venue, "pinnacle");
        assert_eq!(events[0].adoption_count, 1);
    }

    #[test]
    fn two_tier3_venues_confirm_a_single_tier3_does_not() {
        let db = Database::open(":memory:").unwrap();
        seed_move(&db, "draftkings", VenueTier::T3, -3.0, -3.5, 10);
        let written = analyse_event(&db, "evt1", 24).unwrap();
        assert_eq!(written, 0);

        seed_move(&db, "fanduel", VenueTier::T3, -3.0, -3.5, 8);
        let written = analyse_event(&db, "evt1", 24).unwrap();
        assert_eq!(written, 1);
    }

    #[test]
    fn rerun_is_idempotent() {
        let db = Database::open(":memory:").unwrap();
        seed_move(&db, "pinnacle", VenueTier::T1, -3.0, -3.5, 10);
        analyse_event(&db, "evt1", 24).unwrap();
        analyse_event(&db, "evt1", 24).unwrap();
        let events = db.list_structural_events("evt1").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn reversal_within_window_is_detected() {
        let db = Database::open(":memory:").unwrap();
        seed_move(&db, "pinnacle", VenueTier::T1, -3.0, -3.5, 20);
        seed_move(&db, "pinnacle", VenueTier::T1, -3.5, -3.0, 5);
        let written = analyse_event(&db, "evt1", 24).unwrap();
        assert_eq!(written, 1);
        let events = db.list_structural_events("evt1").unwrap();
        assert!(events[0].reversal_detected);
    }

    #[test]
    fn active_venue_count_uses_fresh_snapshots() {
        let db = Database::open(":memory:").unwrap();
        seed_move(&db, "pinnacle", VenueTier::T1, -3.0, -3.5, 10);
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "pinnacle".into(),
            market: MARKET.into(),
            outcome_name: "BOS".into(),
            line: Some(-3.5),
            price: -110,
            fetched_at: Utc::now() - ChronoDuration::minutes(9),
        })
        .unwrap();
        db.insert_odds_snapshot(&OddsSnapshot {
            id: None,
            event_id: "evt1".into(),
            sport_key: "basketball_nba".into(),
            sportsbook_key: "circa".into(),
            market: MARKET.into(),
            outcome_name: "BOS".into(),
            line: Some(-3.5),
            price: -110,
            fetched_at: Utc::now() - ChronoDuration::minutes(9),
        })
        .unwrap();
        analyse_event(&db, "evt1", 24).unwrap();
        let events = db.list_structural_events("evt1").unwrap();
        assert!(events[0].active_venue_count >= 1);
    }
}
